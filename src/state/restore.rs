use super::{StateStore, Tables};
use crate::structs::{
    AclRole, AclToken, Allocation, AuthMethod, Deployment, Evaluation, IndexEntry, Job,
    JobSummary, Namespace, Node,
};

/// Bulk loader used while decoding a snapshot. Records are staged privately
/// and only become visible on [`StateRestore::commit`]; dropping the restore
/// discards them.
pub struct StateRestore<'a> {
    store: &'a StateStore,
    tables: Tables,
}

impl<'a> StateRestore<'a> {
    pub(super) fn new(store: &'a StateStore) -> Self {
        Self {
            store,
            tables: Tables::default(),
        }
    }

    pub fn node_restore(&mut self, node: Node) {
        self.tables.nodes.insert(node.id.clone(), node);
    }

    pub fn job_restore(&mut self, job: Job) {
        self.tables
            .jobs
            .insert((job.namespace.clone(), job.id.clone()), job);
    }

    pub fn job_version_restore(&mut self, job: Job) {
        self.tables
            .job_versions
            .insert((job.namespace.clone(), job.id.clone(), job.version), job);
    }

    pub fn job_summary_restore(&mut self, summary: JobSummary) {
        self.tables.job_summaries.insert(
            (summary.namespace.clone(), summary.job_id.clone()),
            summary,
        );
    }

    pub fn eval_restore(&mut self, eval: Evaluation) {
        self.tables.evals.insert(eval.id.clone(), eval);
    }

    pub fn alloc_restore(&mut self, alloc: Allocation) {
        self.tables.allocs.insert(alloc.id.clone(), alloc);
    }

    pub fn deployment_restore(&mut self, deployment: Deployment) {
        self.tables
            .deployments
            .insert(deployment.id.clone(), deployment);
    }

    pub fn namespace_restore(&mut self, namespace: Namespace) {
        self.tables
            .namespaces
            .insert(namespace.name.clone(), namespace);
    }

    pub fn index_restore(&mut self, entry: IndexEntry) {
        self.tables.indexes.insert(entry.key, entry.value);
    }

    pub fn acl_token_restore(&mut self, token: AclToken) {
        self.tables.insert_token(token);
    }

    pub fn acl_role_restore(&mut self, role: AclRole) {
        self.tables.acl_roles.insert(role.id.clone(), role);
    }

    pub fn auth_method_restore(&mut self, method: AuthMethod) {
        self.tables
            .auth_methods
            .insert(method.name.clone(), method);
    }

    /// Stage an opaque row for an extension table.
    pub fn extension_restore(&mut self, table: &str, row: Vec<u8>) {
        self.tables
            .extensions
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Publish everything staged so far.
    pub fn commit(self) {
        self.store.install(self.tables);
    }
}

#[cfg(test)]
mod tests {
    use crate::state::{StateStore, StateStoreConfig, WatchSet, TABLE_AUTH_METHODS};
    use crate::structs::{mock, IndexEntry};

    #[test]
    fn nothing_is_visible_before_commit() {
        let store = StateStore::new(StateStoreConfig::default());
        let mut restore = store.restore();
        let mut method = mock::auth_method("okta");
        method.create_index = 4;
        method.modify_index = 4;
        restore.auth_method_restore(method);
        restore.index_restore(IndexEntry {
            key: TABLE_AUTH_METHODS.to_string(),
            value: 4,
        });

        assert!(store.snapshot().auth_methods(&mut WatchSet::new()).is_empty());
        restore.commit();

        let snap = store.snapshot();
        assert_eq!(snap.auth_methods(&mut WatchSet::new()).len(), 1);
        assert_eq!(snap.index(TABLE_AUTH_METHODS), 4);
    }

    #[test]
    fn dropped_restore_is_discarded() {
        let store = StateStore::new(StateStoreConfig::default());
        {
            let mut restore = store.restore();
            restore.extension_restore("quotas", vec![1, 2, 3]);
        }
        assert!(store.snapshot().extension_rows("quotas").is_empty());
    }
}
