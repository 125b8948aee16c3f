//! Set-level reconciliation: diffs desired containers against the previous
//! observed state and applies the minimum set of lifecycle actions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{files_equal, hcc, ContainerInstance, FileMap, HostConfiguredContainer};
use crate::docker::{self, Runtime, RuntimeProvider};
use crate::host::Host;

/// Previous observed state of a set, persisted between runs.
pub type ContainersState = BTreeMap<String, ContainerInstance>;

/// One error and the keys it affected. A transport failure covers every key
/// scheduled on that host.
#[derive(Debug)]
pub struct Failure {
    pub keys: Vec<String>,
    pub error: Arc<docker::Error>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]: {}", self.keys.join(", "), self.error)
    }
}

fn summarize(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{} container action(s) failed: {}", failures.len(), summarize(failures)))]
    Actions { failures: Vec<Failure> },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Work scheduled for one key. A spec change schedules a destroy in the first
/// phase and a create in the second.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Work {
    Destroy { id: String },
    Create,
    Start { id: String },
    UpdateFiles { id: String },
}

impl Work {
    fn describe(&self) -> &'static str {
        match self {
            Work::Destroy { .. } => "destroy",
            Work::Create => "create",
            Work::Start { .. } => "start",
            Work::UpdateFiles { .. } => "update-files",
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Plan {
    /// Records without a runtime counterpart, dropped without daemon calls.
    forgets: Vec<String>,
    destroys: Vec<(String, Work)>,
    creates: Vec<(String, Work)>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.forgets.is_empty() && self.destroys.is_empty() && self.creates.is_empty()
    }
}

/// Desired containers keyed by caller-assigned names, plus the previously
/// observed instances for the same keys.
pub struct ContainersSet {
    desired: BTreeMap<String, HostConfiguredContainer>,
    previous: ContainersState,
    create_order: Vec<String>,
    observed_files: BTreeMap<String, FileMap>,
}

impl ContainersSet {
    /// `create_order` fixes the per-host ordering of creates; keys missing
    /// from it are created last, in lexical order.
    pub fn new(
        desired: BTreeMap<String, HostConfiguredContainer>,
        previous: Option<ContainersState>,
        create_order: Vec<String>,
    ) -> Self {
        ContainersSet {
            desired,
            previous: previous.unwrap_or_default(),
            create_order,
            observed_files: BTreeMap::new(),
        }
    }

    /// The observed state after the last pass, to be persisted by the caller.
    pub fn previous_state(&self) -> &ContainersState {
        &self.previous
    }

    pub fn desired_keys(&self) -> impl Iterator<Item = &str> {
        self.desired.keys().map(String::as_str)
    }

    pub fn desired(&self, key: &str) -> Option<&HostConfiguredContainer> {
        self.desired.get(key)
    }

    /// Refreshes every previous-state record against its daemon and observes
    /// the injected files of containers that are still wanted.
    ///
    /// Unreachable hosts leave their records untouched; the deploy pass
    /// reports them.
    pub async fn check_current_state(&mut self, provider: &dyn RuntimeProvider) -> Result<()> {
        let (runtimes, errors) = self.connect_all(provider).await;
        for (host, error) in &errors {
            warn!(host = ?host, error = %error, "Host unreachable, keeping recorded state");
        }

        for (key, instance) in &mut self.previous {
            let Some(runtime) = runtimes.get(&instance.host) else {
                continue;
            };

            if let Err(err) = hcc::check(runtime.as_ref(), key, instance).await {
                warn!(key, error = %err, "Checking previous container failed");
            }
        }

        self.observed_files.clear();
        for (key, container) in &self.desired {
            if container.config_files.is_empty() {
                continue;
            }

            let Some(id) = self.previous.get(key).and_then(|p| p.id.clone()) else {
                continue;
            };
            let Some(runtime) = runtimes.get(&container.host) else {
                continue;
            };

            let paths: Vec<String> = container.config_files.keys().cloned().collect();
            match runtime.read_files(&id, &paths).await {
                Ok(files) => {
                    self.observed_files.insert(key.clone(), files);
                }
                Err(err) => warn!(key, error = %err, "Reading container files failed"),
            }
        }

        Ok(())
    }

    /// Applies the computed plan and refreshes the previous state from what
    /// the daemons actually hold afterwards.
    ///
    /// Individual action failures do not abort the pass; they are collected
    /// and returned once every scheduled action has terminated.
    pub async fn deploy(
        &mut self,
        provider: &dyn RuntimeProvider,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let plan = self.plan();
        if plan.is_empty() {
            info!("All containers are in the desired state");
            return Ok(());
        }

        for key in &plan.forgets {
            self.previous.remove(key);
        }

        let (runtimes, errors) = self.connect_all(provider).await;
        let mut failures: Vec<Failure> = Vec::new();

        for phase in [&plan.destroys, &plan.creates] {
            let mut batches: BTreeMap<&Host, Vec<(String, Work)>> = BTreeMap::new();
            for (key, work) in phase {
                let host = self.host_for(key);
                batches.entry(host).or_default().push((key.clone(), work.clone()));
            }

            // Keys scheduled on unreachable hosts fail as a group.
            batches.retain(|host, batch| {
                if let Some(error) = errors.get(*host) {
                    failures.push(Failure {
                        keys: batch.iter().map(|(key, _)| key.clone()).collect(),
                        error: error.clone(),
                    });
                    return false;
                }
                true
            });

            let runs = batches.into_iter().map(|(host, mut batch)| {
                batch.sort_by_key(|(key, _)| (self.create_rank(key), key.clone()));
                let runtime = runtimes[host].clone();
                let desired = &self.desired;

                async move {
                    let mut outcomes = Vec::new();
                    for (key, work) in batch {
                        if cancel.is_cancelled() {
                            outcomes.push((key, work, Err(docker::Error::Cancelled)));
                            continue;
                        }

                        info!(key, action = work.describe(), "Applying container action");
                        let mut result =
                            run_work(runtime.as_ref(), &key, &work, desired.get(&key)).await;

                        // Transient daemon failures get a single retry;
                        // terminal ones propagate as-is.
                        if let Err(err) = &result {
                            if err.is_transient() && !cancel.is_cancelled() {
                                warn!(key, error = %err, "Transient failure, retrying");
                                result =
                                    run_work(runtime.as_ref(), &key, &work, desired.get(&key))
                                        .await;
                            }
                        }

                        outcomes.push((key, work, result));
                    }
                    outcomes
                }
            });

            let results = join_all(runs).await;
            for outcomes in results {
                for (key, work, result) in outcomes {
                    match result {
                        Ok(applied) => self.merge(&key, &work, applied),
                        Err(error) => failures.push(Failure {
                            keys: vec![key],
                            error: Arc::new(error),
                        }),
                    }
                }
            }
        }

        self.reinspect(&runtimes).await;

        if failures.is_empty() {
            Ok(())
        } else {
            ActionsSnafu { failures }.fail()
        }
    }

    /// Computes the per-key action table.
    fn plan(&self) -> Plan {
        let mut plan = Plan::default();

        for (key, instance) in &self.previous {
            if self.desired.contains_key(key) {
                continue;
            }

            match &instance.id {
                Some(id) => plan
                    .destroys
                    .push((key.clone(), Work::Destroy { id: id.clone() })),
                None => plan.forgets.push(key.clone()),
            }
        }

        for (key, container) in &self.desired {
            let Some(previous) = self.previous.get(key) else {
                plan.creates.push((key.clone(), Work::Create));
                continue;
            };

            let Some(id) = previous.id.clone() else {
                plan.creates.push((key.clone(), Work::Create));
                continue;
            };

            if previous.container != container.container {
                debug!(
                    key,
                    desired = ?container.container,
                    observed = ?previous.container,
                    "Container specification changed"
                );
                plan.destroys.push((key.clone(), Work::Destroy { id }));
                plan.creates.push((key.clone(), Work::Create));
                continue;
            }

            let observed = self.observed_files.get(key);
            if observed.is_some_and(|files| !files_equal(&container.config_files, files)) {
                plan.creates.push((key.clone(), Work::UpdateFiles { id }));
                continue;
            }

            if !previous.running {
                plan.creates.push((key.clone(), Work::Start { id }));
            }
        }

        plan
    }

    /// Folds a successful action into the in-memory previous state.
    fn merge(&mut self, key: &str, work: &Work, applied: Option<ContainerInstance>) {
        match work {
            Work::Destroy { .. } => {
                self.previous.remove(key);
            }
            Work::Create => {
                if let Some(instance) = applied {
                    self.previous.insert(key.to_owned(), instance);
                }
            }
            Work::Start { .. } => {
                if let Some(previous) = self.previous.get_mut(key) {
                    previous.running = true;
                    previous.checked_at = Some(Utc::now());
                }
            }
            Work::UpdateFiles { .. } => {
                if let Some(previous) = self.previous.get_mut(key) {
                    if let Some(container) = self.desired.get(key) {
                        previous.config_files = container.config_files.clone();
                    }
                    previous.running = true;
                    previous.checked_at = Some(Utc::now());
                }
            }
        }
    }

    /// Re-inspects every known key so the persisted state reflects what the
    /// daemons actually hold, including the leftovers of interrupted runs.
    async fn reinspect(&mut self, runtimes: &BTreeMap<Host, Arc<dyn Runtime>>) {
        let mut keys_by_host: BTreeMap<Host, Vec<String>> = BTreeMap::new();
        let keys: BTreeSet<String> = self
            .desired
            .keys()
            .chain(self.previous.keys())
            .cloned()
            .collect();

        for key in keys {
            let host = self.host_for(&key).clone();
            keys_by_host.entry(host).or_default().push(key);
        }

        let lookups = keys_by_host.into_iter().filter_map(|(host, keys)| {
            let runtime = runtimes.get(&host)?.clone();
            Some(async move {
                let mut results = Vec::new();
                for key in keys {
                    let status = runtime.inspect(&key).await;
                    results.push((key, status));
                }
                results
            })
        });

        for results in join_all(lookups).await {
            for (key, status) in results {
                match status {
                    Ok(Some(status)) => {
                        if let Some(instance) = self.previous.get_mut(&key) {
                            instance.id = Some(status.id);
                            instance.running = status.running;
                            instance.checked_at = Some(Utc::now());
                        } else if let Some(container) = self.desired.get(&key) {
                            self.previous.insert(
                                key,
                                ContainerInstance {
                                    host: container.host.clone(),
                                    container: container.container.clone(),
                                    config_files: container.config_files.clone(),
                                    id: Some(status.id),
                                    running: status.running,
                                    checked_at: Some(Utc::now()),
                                },
                            );
                        }
                    }
                    Ok(None) => {
                        self.previous.remove(&key);
                    }
                    Err(err) => warn!(key, error = %err, "Post-action inspection failed"),
                }
            }
        }
    }

    async fn connect_all(
        &self,
        provider: &dyn RuntimeProvider,
    ) -> (
        BTreeMap<Host, Arc<dyn Runtime>>,
        BTreeMap<Host, Arc<docker::Error>>,
    ) {
        let hosts: BTreeSet<&Host> = self
            .desired
            .values()
            .map(|container| &container.host)
            .chain(self.previous.values().map(|instance| &instance.host))
            .collect();

        let connections = join_all(
            hosts
                .into_iter()
                .map(|host| async move { (host.clone(), provider.runtime(host).await) }),
        )
        .await;

        let mut runtimes = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (host, connection) in connections {
            match connection {
                Ok(runtime) => {
                    runtimes.insert(host, runtime);
                }
                Err(error) => {
                    errors.insert(host, Arc::new(error));
                }
            }
        }

        (runtimes, errors)
    }

    fn host_for(&self, key: &str) -> &Host {
        self.desired
            .get(key)
            .map(|container| &container.host)
            .or_else(|| self.previous.get(key).map(|instance| &instance.host))
            .expect("key belongs to desired or previous state")
    }

    fn create_rank(&self, key: &str) -> usize {
        self.create_order
            .iter()
            .position(|ordered| ordered == key)
            .unwrap_or(usize::MAX)
    }
}

async fn run_work(
    runtime: &dyn Runtime,
    key: &str,
    work: &Work,
    container: Option<&HostConfiguredContainer>,
) -> docker::Result<Option<ContainerInstance>> {
    match work {
        Work::Destroy { id } => {
            hcc::destroy(runtime, id).await?;
            Ok(None)
        }
        Work::Create => {
            let container = container.expect("create work only scheduled for desired keys");
            container.create_and_start(runtime, key).await.map(Some)
        }
        Work::Start { id } => {
            runtime.start(id).await?;
            Ok(None)
        }
        Work::UpdateFiles { id } => {
            let container = container.expect("file update only scheduled for desired keys");
            container.update_files(runtime, id).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::container::{ContainerSpec, File};
    use crate::docker::fake::{FakeContainer, FakeProvider};
    use crate::host::{direct, Host};

    fn host(name: &str) -> Host {
        Host {
            direct: Some(direct::Config {
                socket: Some(format!("/run/{name}.sock")),
            }),
            ssh: None,
        }
    }

    fn spec(image: &str) -> ContainerSpec {
        ContainerSpec {
            image: image.to_owned(),
            ..ContainerSpec::default()
        }
    }

    fn desired(
        entries: &[(&str, &Host, &str)],
    ) -> BTreeMap<String, HostConfiguredContainer> {
        entries
            .iter()
            .map(|(key, host, image)| {
                (
                    (*key).to_owned(),
                    HostConfiguredContainer::new((*host).clone(), spec(image)),
                )
            })
            .collect()
    }

    fn seeded_instance(host: &Host, image: &str, id: &str, running: bool) -> ContainerInstance {
        ContainerInstance {
            host: host.clone(),
            container: spec(image),
            config_files: FileMap::new(),
            id: Some(id.to_owned()),
            running,
            checked_at: None,
        }
    }

    fn seed(provider: &FakeProvider, host: &Host, key: &str, image: &str, id: &str, running: bool) {
        provider.daemon(host).insert(FakeContainer {
            id: id.to_owned(),
            name: key.to_owned(),
            spec: spec(image),
            files: FileMap::new(),
            running,
        });
    }

    #[tokio::test]
    async fn cold_start_creates_and_starts() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        let mut set = ContainersSet::new(
            desired(&[("etcd-member-0", &host, "etcd:v3.5.0")]),
            None,
            vec!["etcd-member-0".to_owned()],
        );

        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        let container = provider.daemon(&host).by_name("etcd-member-0").unwrap();
        assert!(container.running);
        assert_eq!(container.spec.image, "etcd:v3.5.0");

        let state = set.previous_state();
        assert_eq!(state.len(), 1);
        let instance = &state["etcd-member-0"];
        assert_eq!(instance.id.as_deref(), Some(container.id.as_str()));
        assert!(instance.running);
        assert_eq!(instance.container.image, "etcd:v3.5.0");
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        let mut set = ContainersSet::new(
            desired(&[("a", &host, "img:1")]),
            None,
            Vec::new(),
        );
        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        let mut second = ContainersSet::new(
            desired(&[("a", &host, "img:1")]),
            Some(set.previous_state().clone()),
            Vec::new(),
        );
        second.check_current_state(&provider).await.unwrap();

        assert!(second.plan().is_empty());

        second.deploy(&provider, &cancel).await.unwrap();
        assert_eq!(second.previous_state(), set.previous_state());
    }

    #[tokio::test]
    async fn scale_down_destroys_extra_members() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        for (key, id) in [("a", "id-a"), ("b", "id-b"), ("c", "id-c")] {
            seed(&provider, &host, key, "img:1", id, true);
        }

        let previous: ContainersState = [("a", "id-a"), ("b", "id-b"), ("c", "id-c")]
            .into_iter()
            .map(|(key, id)| (key.to_owned(), seeded_instance(&host, "img:1", id, true)))
            .collect();

        let mut set = ContainersSet::new(
            desired(&[("a", &host, "img:1"), ("b", &host, "img:1")]),
            Some(previous),
            Vec::new(),
        );

        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        assert!(provider.daemon(&host).by_name("c").is_none());
        assert_eq!(
            set.previous_state().keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_owned(), "b".to_owned()]
        );
    }

    #[tokio::test]
    async fn spec_drift_replaces_container() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        seed(&provider, &host, "a", "etcd:v3.4.0", "id-old", true);
        let previous: ContainersState = [(
            "a".to_owned(),
            seeded_instance(&host, "etcd:v3.4.0", "id-old", true),
        )]
        .into();

        let mut set = ContainersSet::new(
            desired(&[("a", &host, "etcd:v3.5.0")]),
            Some(previous),
            Vec::new(),
        );

        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        let container = provider.daemon(&host).by_name("a").unwrap();
        assert!(container.running);
        assert_eq!(container.spec.image, "etcd:v3.5.0");
        assert_ne!(container.id, "id-old");

        let instance = &set.previous_state()["a"];
        assert_eq!(instance.container.image, "etcd:v3.5.0");
        assert_eq!(instance.id.as_deref(), Some(container.id.as_str()));
    }

    #[tokio::test]
    async fn partial_failure_keeps_other_hosts_progressing() {
        let provider = FakeProvider::default();
        let reachable = host("one");
        let unreachable = host("two");
        let cancel = CancellationToken::new();

        provider.set_unreachable(&unreachable);
        let previous: ContainersState = [(
            "b".to_owned(),
            seeded_instance(&unreachable, "img:1", "id-b", true),
        )]
        .into();

        let mut set = ContainersSet::new(
            desired(&[("a", &reachable, "img:2"), ("b", &unreachable, "img:2")]),
            Some(previous),
            Vec::new(),
        );

        set.check_current_state(&provider).await.unwrap();
        let err = set
            .deploy(&provider, &cancel)
            .await
            .expect_err("unreachable host must fail the pass");

        let Error::Actions { failures } = err;
        assert!(!failures.is_empty());
        assert!(failures
            .iter()
            .all(|failure| failure.keys == vec!["b".to_owned()]));

        // The reachable member converged.
        assert!(provider.daemon(&reachable).by_name("a").unwrap().running);
        assert!(set.previous_state()["a"].running);

        // The unreachable member kept its prior record, untouched.
        let kept = &set.previous_state()["b"];
        assert_eq!(kept.id.as_deref(), Some("id-b"));
        assert_eq!(kept.container.image, "img:1");
    }

    #[tokio::test]
    async fn stopped_container_with_equal_spec_is_started() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        seed(&provider, &host, "a", "img:1", "id-a", false);
        let previous: ContainersState = [(
            "a".to_owned(),
            seeded_instance(&host, "img:1", "id-a", false),
        )]
        .into();

        let mut set = ContainersSet::new(
            desired(&[("a", &host, "img:1")]),
            Some(previous),
            Vec::new(),
        );

        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        let container = provider.daemon(&host).by_name("a").unwrap();
        assert!(container.running);
        assert_eq!(container.id, "id-a");
        assert!(set.previous_state()["a"].running);
    }

    #[tokio::test]
    async fn changed_files_are_updated_without_recreate() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        provider.daemon(&host).insert(FakeContainer {
            id: "id-a".to_owned(),
            name: "a".to_owned(),
            spec: spec("img:1"),
            files: FileMap::from([(
                "/etc/app/config".to_owned(),
                File::with_mode("old", 0o600),
            )]),
            running: true,
        });

        let previous: ContainersState = [(
            "a".to_owned(),
            seeded_instance(&host, "img:1", "id-a", true),
        )]
        .into();

        let mut container = HostConfiguredContainer::new(host.clone(), spec("img:1"));
        container.config_files.insert(
            "/etc/app/config".to_owned(),
            File::with_mode("new", 0o600),
        );

        let mut set = ContainersSet::new(
            BTreeMap::from([("a".to_owned(), container)]),
            Some(previous),
            Vec::new(),
        );

        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        let updated = provider.daemon(&host).by_name("a").unwrap();
        assert_eq!(updated.id, "id-a");
        assert_eq!(updated.files["/etc/app/config"].content, "new");
        assert_eq!(
            set.previous_state()["a"].config_files["/etc/app/config"].content,
            "new"
        );
    }

    #[tokio::test]
    async fn destroys_precede_creates_and_creates_follow_given_order() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        seed(&provider, &host, "old", "img:1", "id-old", true);
        let previous: ContainersState = [(
            "old".to_owned(),
            seeded_instance(&host, "img:1", "id-old", true),
        )]
        .into();

        let mut set = ContainersSet::new(
            desired(&[("b", &host, "img:1"), ("a", &host, "img:1")]),
            Some(previous),
            vec!["b".to_owned(), "a".to_owned()],
        );

        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        let ops = provider.daemon(&host).ops();
        let first_create = ops.iter().position(|op| op.starts_with("create")).unwrap();
        let last_remove = ops
            .iter()
            .rposition(|op| op.starts_with("remove"))
            .unwrap();
        assert!(last_remove < first_create, "ops: {ops:?}");

        let creates: Vec<&String> =
            ops.iter().filter(|op| op.starts_with("create")).collect();
        assert_eq!(creates, ["create b", "create a"]);
    }

    #[tokio::test]
    async fn mismatched_name_clears_record_and_recreates() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();

        // The recorded id now belongs to a different container name.
        seed(&provider, &host, "other", "img:1", "id-a", true);
        let previous: ContainersState = [(
            "a".to_owned(),
            seeded_instance(&host, "img:1", "id-a", true),
        )]
        .into();

        let mut set = ContainersSet::new(
            desired(&[("a", &host, "img:1")]),
            Some(previous),
            Vec::new(),
        );

        set.check_current_state(&provider).await.unwrap();
        set.deploy(&provider, &cancel).await.unwrap();

        let container = provider.daemon(&host).by_name("a").unwrap();
        assert!(container.running);
        assert_ne!(container.id, "id-a");
    }

    #[tokio::test]
    async fn cancellation_skips_pending_actions() {
        let provider = FakeProvider::default();
        let host = host("one");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut set = ContainersSet::new(
            desired(&[("a", &host, "img:1")]),
            None,
            Vec::new(),
        );

        set.check_current_state(&provider).await.unwrap();
        let err = set
            .deploy(&provider, &cancel)
            .await
            .expect_err("cancelled pass must report failures");

        let Error::Actions { failures } = err;
        assert!(failures
            .iter()
            .any(|failure| matches!(*failure.error, docker::Error::Cancelled)));
        assert!(provider.daemon(&host).by_name("a").is_none());
    }
}
