//! Snapshot-isolated, indexed tables.
//!
//! Every write clones the current table set, mutates the clone and swaps it in,
//! so a [`StateSnapshot`] taken before the write keeps seeing the old data.
//! Each table carries the index of the command that last touched it; readers
//! collect those indexes into a [`WatchSet`] and can wait for them to move.

mod restore;
mod watch;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, Result};
use crate::structs::{
    AclRole, AclToken, Allocation, AuthMethod, Deployment, Evaluation, IndexEntry, Job,
    JobSummary, Namespace, Node,
};

pub use restore::StateRestore;
pub use watch::{WatchEvent, WatchSet};

use watch::TableWatches;

pub const TABLE_AUTH_METHODS: &str = "auth_methods";
pub const TABLE_ACL_TOKENS: &str = "acl_token";
pub const TABLE_ACL_ROLES: &str = "acl_roles";
pub const TABLE_NODES: &str = "nodes";
pub const TABLE_JOBS: &str = "jobs";
pub const TABLE_JOB_VERSIONS: &str = "job_version";
pub const TABLE_JOB_SUMMARIES: &str = "job_summary";
pub const TABLE_EVALS: &str = "evals";
pub const TABLE_ALLOCS: &str = "allocs";
pub const TABLE_DEPLOYMENTS: &str = "deployment";
pub const TABLE_NAMESPACES: &str = "namespaces";

/// Every built-in table; each gets its own index watch.
pub const TABLES: &[&str] = &[
    TABLE_AUTH_METHODS,
    TABLE_ACL_TOKENS,
    TABLE_ACL_ROLES,
    TABLE_NODES,
    TABLE_JOBS,
    TABLE_JOB_VERSIONS,
    TABLE_JOB_SUMMARIES,
    TABLE_EVALS,
    TABLE_ALLOCS,
    TABLE_DEPLOYMENTS,
    TABLE_NAMESPACES,
];

type NsKey = (String, String);

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub(crate) auth_methods: BTreeMap<String, AuthMethod>,
    /// Keyed by accessor ID.
    pub(crate) acl_tokens: BTreeMap<String, AclToken>,
    /// Secret ID to accessor ID.
    pub(crate) acl_token_secrets: BTreeMap<String, String>,
    /// Keyed by role ID.
    pub(crate) acl_roles: BTreeMap<String, AclRole>,
    pub(crate) nodes: BTreeMap<String, Node>,
    pub(crate) jobs: BTreeMap<NsKey, Job>,
    pub(crate) job_versions: BTreeMap<(String, String, u64), Job>,
    pub(crate) job_summaries: BTreeMap<NsKey, JobSummary>,
    pub(crate) evals: BTreeMap<String, Evaluation>,
    pub(crate) allocs: BTreeMap<String, Allocation>,
    pub(crate) deployments: BTreeMap<String, Deployment>,
    pub(crate) namespaces: BTreeMap<String, Namespace>,
    /// Opaque rows owned by snapshot extensions, by table name.
    pub(crate) extensions: BTreeMap<String, Vec<Vec<u8>>>,
    pub(crate) indexes: BTreeMap<String, u64>,
}

impl Tables {
    fn index(&self, table: &str) -> u64 {
        self.indexes.get(table).copied().unwrap_or(0)
    }

    fn insert_token(&mut self, token: AclToken) {
        self.acl_token_secrets
            .insert(token.secret_id.clone(), token.accessor_id.clone());
        self.acl_tokens.insert(token.accessor_id.clone(), token);
    }

    fn role_by_name(&self, name: &str) -> Option<&AclRole> {
        self.acl_roles.values().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateStoreConfig {
    pub region: String,
}

/// The current set of tables plus the machinery to watch them.
pub struct StateStore {
    config: StateStoreConfig,
    tables: RwLock<Arc<Tables>>,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
    watches: Arc<TableWatches>,
    abandon: CancellationToken,
}

impl StateStore {
    pub fn new(config: StateStoreConfig) -> Self {
        Self {
            config,
            tables: RwLock::new(Arc::new(Tables::default())),
            write_lock: Mutex::new(()),
            watches: Arc::new(TableWatches::new(TABLES)),
            abandon: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    /// A point-in-time view. Later writes are invisible to it.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            tables: self.tables.read().clone(),
            watches: self.watches.clone(),
            abandon: self.abandon.clone(),
        }
    }

    /// Start rebuilding a store from a snapshot stream.
    pub fn restore(&self) -> StateRestore<'_> {
        StateRestore::new(self)
    }

    /// Mark this store as replaced. Readers blocked on it wake immediately.
    pub fn abandon(&self) {
        self.abandon.cancel();
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandon.is_cancelled()
    }

    /// Token that fires when the store is abandoned.
    pub fn abandon_token(&self) -> CancellationToken {
        self.abandon.clone()
    }

    /// Highest index any table has seen.
    pub fn latest_index(&self) -> u64 {
        self.tables.read().indexes.values().copied().max().unwrap_or(0)
    }

    /// Run `f` against a private copy of the tables and publish the result
    /// atomically. `f` returns the tables it touched; on error nothing is
    /// published.
    fn write<F>(&self, index: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut Tables) -> Result<Vec<&'static str>>,
    {
        let _writer = self.write_lock.lock();
        let current = self.tables.read().clone();
        let mut next = Tables::clone(&current);

        let touched = f(&mut next)?;
        for table in &touched {
            next.indexes.insert(table.to_string(), index);
        }
        *self.tables.write() = Arc::new(next);

        for table in touched {
            self.watches.notify(table, index);
        }
        Ok(())
    }

    pub(crate) fn install(&self, tables: Tables) {
        let _writer = self.write_lock.lock();
        let indexes = tables.indexes.clone();
        *self.tables.write() = Arc::new(tables);
        for (table, index) in indexes {
            self.watches.notify(&table, index);
        }
    }

    /// Insert or update auth methods. `create_index` and `create_time` are
    /// kept from an existing record; `modify_index` is set to `index`.
    pub fn upsert_auth_methods(&self, index: u64, methods: Vec<AuthMethod>) -> Result<()> {
        self.write(index, |t| {
            for mut method in methods {
                match t.auth_methods.get(&method.name) {
                    Some(existing) => {
                        method.create_index = existing.create_index;
                        method.create_time = existing.create_time;
                    }
                    None => method.create_index = index,
                }
                method.modify_index = index;
                t.auth_methods.insert(method.name.clone(), method);
            }
            Ok(vec![TABLE_AUTH_METHODS])
        })
    }

    /// Delete auth methods by name. A missing name fails the whole batch.
    pub fn delete_auth_methods(&self, index: u64, names: &[String]) -> Result<()> {
        self.write(index, |t| {
            for name in names {
                if t.auth_methods.remove(name).is_none() {
                    return Err(ControlError::NotFound(format!("auth method {:?}", name)));
                }
            }
            Ok(vec![TABLE_AUTH_METHODS])
        })
    }

    /// Insert new tokens. Tokens are immutable, so an accessor already in the
    /// table is rejected, as is a link to a role that does not exist.
    pub fn upsert_acl_tokens(&self, index: u64, tokens: Vec<AclToken>) -> Result<()> {
        self.write(index, |t| {
            for mut token in tokens {
                if t.acl_tokens.contains_key(&token.accessor_id) {
                    return Err(ControlError::InvalidArgument(format!(
                        "token {} already exists",
                        token.accessor_id
                    )));
                }
                if t.acl_token_secrets.contains_key(&token.secret_id) {
                    return Err(ControlError::InvalidArgument(
                        "token secret ID already in use".to_string(),
                    ));
                }
                for link in &token.roles {
                    let known = t
                        .acl_roles
                        .get(&link.id)
                        .map(|r| r.name == link.name)
                        .unwrap_or(false);
                    if !known {
                        return Err(ControlError::RoleNotFound(link.name.clone()));
                    }
                }
                token.create_index = index;
                token.modify_index = index;
                t.insert_token(token);
            }
            Ok(vec![TABLE_ACL_TOKENS])
        })
    }

    pub fn delete_acl_tokens(&self, index: u64, accessor_ids: &[String]) -> Result<()> {
        self.write(index, |t| {
            for id in accessor_ids {
                let token = t
                    .acl_tokens
                    .remove(id)
                    .ok_or_else(|| ControlError::NotFound(format!("ACL token {}", id)))?;
                t.acl_token_secrets.remove(&token.secret_id);
            }
            Ok(vec![TABLE_ACL_TOKENS])
        })
    }

    /// Insert or update roles. Names are unique; updating a role by name
    /// keeps its ID.
    pub fn upsert_acl_roles(&self, index: u64, roles: Vec<AclRole>) -> Result<()> {
        self.write(index, |t| {
            for mut role in roles {
                if let Some(existing) = t.role_by_name(&role.name).cloned() {
                    role.id = existing.id;
                    role.create_index = existing.create_index;
                } else {
                    role.create_index = index;
                }
                role.modify_index = index;
                t.acl_roles.insert(role.id.clone(), role);
            }
            Ok(vec![TABLE_ACL_ROLES])
        })
    }

    pub fn upsert_node(&self, index: u64, mut node: Node) -> Result<()> {
        self.write(index, |t| {
            node.canonicalize();
            node.create_index = t
                .nodes
                .get(&node.id)
                .map(|n| n.create_index)
                .unwrap_or(index);
            node.modify_index = index;
            t.nodes.insert(node.id.clone(), node);
            Ok(vec![TABLE_NODES])
        })
    }

    /// Register a job, recording the version and creating its summary.
    pub fn upsert_job(&self, index: u64, mut job: Job) -> Result<()> {
        self.write(index, |t| {
            job.canonicalize();
            let key = (job.namespace.clone(), job.id.clone());
            match t.jobs.get(&key) {
                Some(existing) => {
                    job.create_index = existing.create_index;
                    job.version = existing.version + 1;
                }
                None => job.create_index = index,
            }
            job.modify_index = index;

            t.job_versions.insert(
                (job.namespace.clone(), job.id.clone(), job.version),
                job.clone(),
            );
            t.job_summaries.entry(key.clone()).or_insert(JobSummary {
                job_id: job.id.clone(),
                namespace: job.namespace.clone(),
                running: 0,
                create_index: index,
                modify_index: index,
            });
            t.jobs.insert(key, job);
            Ok(vec![TABLE_JOBS, TABLE_JOB_VERSIONS, TABLE_JOB_SUMMARIES])
        })
    }

    pub fn upsert_evals(&self, index: u64, evals: Vec<Evaluation>) -> Result<()> {
        self.write(index, |t| {
            for mut eval in evals {
                eval.create_index = t
                    .evals
                    .get(&eval.id)
                    .map(|e| e.create_index)
                    .unwrap_or(index);
                eval.modify_index = index;
                t.evals.insert(eval.id.clone(), eval);
            }
            Ok(vec![TABLE_EVALS])
        })
    }

    pub fn upsert_allocs(&self, index: u64, allocs: Vec<Allocation>) -> Result<()> {
        self.write(index, |t| {
            for mut alloc in allocs {
                alloc.create_index = t
                    .allocs
                    .get(&alloc.id)
                    .map(|a| a.create_index)
                    .unwrap_or(index);
                alloc.modify_index = index;
                t.allocs.insert(alloc.id.clone(), alloc);
            }
            Ok(vec![TABLE_ALLOCS])
        })
    }

    pub fn upsert_deployment(&self, index: u64, mut deployment: Deployment) -> Result<()> {
        self.write(index, |t| {
            deployment.create_index = t
                .deployments
                .get(&deployment.id)
                .map(|d| d.create_index)
                .unwrap_or(index);
            deployment.modify_index = index;
            t.deployments.insert(deployment.id.clone(), deployment);
            Ok(vec![TABLE_DEPLOYMENTS])
        })
    }

    pub fn upsert_namespaces(&self, index: u64, namespaces: Vec<Namespace>) -> Result<()> {
        self.write(index, |t| {
            for mut ns in namespaces {
                ns.create_index = t
                    .namespaces
                    .get(&ns.name)
                    .map(|n| n.create_index)
                    .unwrap_or(index);
                ns.modify_index = index;
                t.namespaces.insert(ns.name.clone(), ns);
            }
            Ok(vec![TABLE_NAMESPACES])
        })
    }
}

/// A consistent read view. Every query records the table it read in the
/// supplied [`WatchSet`] together with the index it observed.
#[derive(Clone)]
pub struct StateSnapshot {
    tables: Arc<Tables>,
    watches: Arc<TableWatches>,
    abandon: CancellationToken,
}

impl StateSnapshot {
    fn watch(&self, ws: &mut WatchSet, table: &'static str) {
        if let Some(rx) = self.watches.subscribe(table) {
            ws.add(table, self.tables.index(table), rx);
        }
        ws.watch_abandon(self.abandon.clone());
    }

    /// Last index that modified `table`; 0 if it was never written.
    pub fn index(&self, table: &str) -> u64 {
        self.tables.index(table)
    }

    pub fn auth_methods(&self, ws: &mut WatchSet) -> Vec<AuthMethod> {
        self.watch(ws, TABLE_AUTH_METHODS);
        self.tables.auth_methods.values().cloned().collect()
    }

    pub fn auth_methods_by_prefix(&self, ws: &mut WatchSet, prefix: &str) -> Vec<AuthMethod> {
        self.watch(ws, TABLE_AUTH_METHODS);
        self.tables
            .auth_methods
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn auth_method_by_name(&self, ws: &mut WatchSet, name: &str) -> Option<AuthMethod> {
        self.watch(ws, TABLE_AUTH_METHODS);
        self.tables.auth_methods.get(name).cloned()
    }

    pub fn acl_tokens(&self, ws: &mut WatchSet) -> Vec<AclToken> {
        self.watch(ws, TABLE_ACL_TOKENS);
        self.tables.acl_tokens.values().cloned().collect()
    }

    pub fn acl_token_by_accessor_id(&self, ws: &mut WatchSet, id: &str) -> Option<AclToken> {
        self.watch(ws, TABLE_ACL_TOKENS);
        self.tables.acl_tokens.get(id).cloned()
    }

    pub fn acl_token_by_secret_id(&self, ws: &mut WatchSet, secret: &str) -> Option<AclToken> {
        self.watch(ws, TABLE_ACL_TOKENS);
        self.tables
            .acl_token_secrets
            .get(secret)
            .and_then(|accessor| self.tables.acl_tokens.get(accessor))
            .cloned()
    }

    pub fn acl_roles(&self, ws: &mut WatchSet) -> Vec<AclRole> {
        self.watch(ws, TABLE_ACL_ROLES);
        self.tables.acl_roles.values().cloned().collect()
    }

    pub fn acl_role_by_name(&self, ws: &mut WatchSet, name: &str) -> Option<AclRole> {
        self.watch(ws, TABLE_ACL_ROLES);
        self.tables.role_by_name(name).cloned()
    }

    pub fn acl_role_by_id(&self, ws: &mut WatchSet, id: &str) -> Option<AclRole> {
        self.watch(ws, TABLE_ACL_ROLES);
        self.tables.acl_roles.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.tables.nodes.values().cloned().collect()
    }

    pub fn node_by_id(&self, id: &str) -> Option<Node> {
        self.tables.nodes.get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.tables.jobs.values().cloned().collect()
    }

    pub fn job_by_id(&self, namespace: &str, id: &str) -> Option<Job> {
        self.tables
            .jobs
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }

    pub fn job_versions(&self) -> Vec<Job> {
        self.tables.job_versions.values().cloned().collect()
    }

    pub fn job_summaries(&self) -> Vec<JobSummary> {
        self.tables.job_summaries.values().cloned().collect()
    }

    pub fn evals(&self) -> Vec<Evaluation> {
        self.tables.evals.values().cloned().collect()
    }

    pub fn allocs(&self) -> Vec<Allocation> {
        self.tables.allocs.values().cloned().collect()
    }

    pub fn alloc_by_id(&self, id: &str) -> Option<Allocation> {
        self.tables.allocs.get(id).cloned()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.tables.deployments.values().cloned().collect()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.tables.namespaces.values().cloned().collect()
    }

    pub fn indexes(&self) -> Vec<IndexEntry> {
        self.tables
            .indexes
            .iter()
            .map(|(key, value)| IndexEntry {
                key: key.clone(),
                value: *value,
            })
            .collect()
    }

    /// Rows held for a snapshot extension table.
    pub fn extension_rows(&self, table: &str) -> &[Vec<u8>] {
        self.tables
            .extensions
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::mock;
    use std::time::Duration;

    fn store() -> StateStore {
        StateStore::new(StateStoreConfig {
            region: "global".to_string(),
        })
    }

    #[test]
    fn upsert_keeps_create_index_and_bumps_modify_index() {
        let store = store();
        store
            .upsert_auth_methods(2, vec![mock::auth_method("okta")])
            .unwrap();
        store
            .upsert_auth_methods(5, vec![mock::auth_method("okta")])
            .unwrap();

        let snap = store.snapshot();
        let method = snap
            .auth_method_by_name(&mut WatchSet::new(), "okta")
            .unwrap();
        assert_eq!(method.create_index, 2);
        assert_eq!(method.modify_index, 5);
        assert_eq!(snap.index(TABLE_AUTH_METHODS), 5);
    }

    #[test]
    fn snapshots_do_not_see_later_writes() {
        let store = store();
        let before = store.snapshot();
        store
            .upsert_auth_methods(2, vec![mock::auth_method("okta")])
            .unwrap();

        assert!(before.auth_methods(&mut WatchSet::new()).is_empty());
        assert_eq!(before.index(TABLE_AUTH_METHODS), 0);
        assert_eq!(store.snapshot().auth_methods(&mut WatchSet::new()).len(), 1);
    }

    #[test]
    fn failed_batch_changes_nothing() {
        let store = store();
        store
            .upsert_auth_methods(2, vec![mock::auth_method("a"), mock::auth_method("b")])
            .unwrap();

        let err = store
            .delete_auth_methods(3, &["a".to_string(), "missing".to_string()])
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));

        let snap = store.snapshot();
        assert_eq!(snap.auth_methods(&mut WatchSet::new()).len(), 2);
        assert_eq!(snap.index(TABLE_AUTH_METHODS), 2);
    }

    #[test]
    fn prefix_listing() {
        let store = store();
        store
            .upsert_auth_methods(
                2,
                vec![
                    mock::auth_method("okta-prod"),
                    mock::auth_method("okta-dev"),
                    mock::auth_method("auth0"),
                ],
            )
            .unwrap();
        let names: Vec<String> = store
            .snapshot()
            .auth_methods_by_prefix(&mut WatchSet::new(), "okta")
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["okta-dev", "okta-prod"]);
    }

    #[test]
    fn tokens_are_immutable_and_require_known_roles() {
        let store = store();
        let role = mock::role("ops");
        let token = mock::client_token(&role);

        let err = store.upsert_acl_tokens(2, vec![token.clone()]).unwrap_err();
        assert_eq!(err, ControlError::RoleNotFound("ops".to_string()));

        store.upsert_acl_roles(3, vec![role]).unwrap();
        store.upsert_acl_tokens(4, vec![token.clone()]).unwrap();
        assert!(store.upsert_acl_tokens(5, vec![token.clone()]).is_err());

        let found = store
            .snapshot()
            .acl_token_by_secret_id(&mut WatchSet::new(), &token.secret_id)
            .unwrap();
        assert_eq!(found.accessor_id, token.accessor_id);
        assert_eq!(found.create_index, 4);
    }

    #[test]
    fn deleting_a_token_drops_its_secret() {
        let store = store();
        let token = mock::management_token();
        store.upsert_acl_tokens(2, vec![token.clone()]).unwrap();
        store
            .delete_acl_tokens(3, &[token.accessor_id.clone()])
            .unwrap();
        assert!(store
            .snapshot()
            .acl_token_by_secret_id(&mut WatchSet::new(), &token.secret_id)
            .is_none());
    }

    #[test]
    fn role_upsert_by_name_keeps_id() {
        let store = store();
        let role = mock::role("ops");
        store.upsert_acl_roles(2, vec![role.clone()]).unwrap();

        let mut renamed = mock::role("ops");
        renamed.description = "operators".to_string();
        store.upsert_acl_roles(3, vec![renamed]).unwrap();

        let stored = store
            .snapshot()
            .acl_role_by_name(&mut WatchSet::new(), "ops")
            .unwrap();
        assert_eq!(stored.id, role.id);
        assert_eq!(stored.create_index, 2);
        assert_eq!(stored.description, "operators");
    }

    #[test]
    fn job_upsert_records_versions_and_summary() {
        let store = store();
        store.upsert_job(2, Job::new("web")).unwrap();
        store.upsert_job(3, Job::new("web")).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.job_by_id("default", "web").unwrap().version, 1);
        assert_eq!(snap.job_versions().len(), 2);
        assert_eq!(snap.job_summaries().len(), 1);
        assert_eq!(snap.index(TABLE_JOB_SUMMARIES), 3);
    }

    #[tokio::test]
    async fn write_wakes_reader_watching_the_table() {
        let store = Arc::new(store());
        let mut ws = WatchSet::new();
        store.snapshot().auth_methods(&mut ws);

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .upsert_auth_methods(2, vec![mock::auth_method("okta")])
                .unwrap();
        });

        let event = tokio::time::timeout(Duration::from_secs(1), ws.wait())
            .await
            .unwrap();
        assert_eq!(event, WatchEvent::Changed(TABLE_AUTH_METHODS));
    }

    #[tokio::test]
    async fn unrelated_write_does_not_wake_reader() {
        let store = store();
        let mut ws = WatchSet::new();
        store.snapshot().auth_methods(&mut ws);
        store.upsert_node(2, Node::new("n1", "client-1")).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), ws.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn abandon_wakes_reader() {
        let store = store();
        let mut ws = WatchSet::new();
        store.snapshot().auth_methods(&mut ws);
        store.abandon();
        assert!(store.is_abandoned());
        assert_eq!(ws.wait().await, WatchEvent::Abandoned);
    }
}
