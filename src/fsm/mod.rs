//! The replicated state machine: applies committed log entries to the state
//! store and serializes the store to and from snapshot streams.

pub mod restore;
pub mod snapshot;
pub mod timetable;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::error::{ControlError, Result};
use crate::raft::Command;
use crate::state::{StateStore, StateStoreConfig, WatchSet};
use crate::structs::{
    AclRole, AclToken, Allocation, AuthMethod, Deployment, Evaluation, IndexEntry, Job,
    JobSummary, Namespace, Node,
};

pub use restore::{ExtensionRegistry, FsmFilter, SnapshotExtension};
pub use snapshot::{SnapshotHeader, SnapshotReader, SnapshotType, SnapshotWriter};
pub use timetable::{TimeTable, TimeTableEntry};

use restore::keep;
use snapshot::{decode, SNAPSHOT_FORMAT_VERSION};

#[derive(Debug, Clone, Default)]
pub struct FsmConfig {
    pub region: String,
}

/// Owns the current state store. The FSM is the only writer of the store
/// reference; everything else reads it through [`Fsm::state`].
pub struct Fsm {
    config: FsmConfig,
    state: RwLock<Arc<StateStore>>,
    timetable: Mutex<TimeTable>,
    extensions: ExtensionRegistry,
}

impl Fsm {
    pub fn new(config: FsmConfig) -> Self {
        Self::with_extensions(config, ExtensionRegistry::new())
    }

    pub fn with_extensions(config: FsmConfig, extensions: ExtensionRegistry) -> Self {
        let state = StateStore::new(Self::store_config(&config));
        Self {
            config,
            state: RwLock::new(Arc::new(state)),
            timetable: Mutex::new(TimeTable::default()),
            extensions,
        }
    }

    fn store_config(config: &FsmConfig) -> StateStoreConfig {
        StateStoreConfig {
            region: config.region.clone(),
        }
    }

    /// The current state store. Callers hold it for one operation only; a
    /// restore may replace it at any time.
    pub fn state(&self) -> Arc<StateStore> {
        self.state.read().clone()
    }

    pub fn timetable(&self) -> TimeTable {
        self.timetable.lock().clone()
    }

    /// Apply one committed command at `index`. A failed command leaves the
    /// store untouched.
    pub fn apply(&self, index: u64, command: &Command) -> Result<()> {
        self.timetable.lock().witness(index, Utc::now());

        let state = self.state();
        let result = match command {
            Command::UpsertAuthMethods(methods) => state.upsert_auth_methods(index, methods.clone()),
            Command::DeleteAuthMethods(names) => state.delete_auth_methods(index, names),
            Command::UpsertAclTokens(tokens) => state.upsert_acl_tokens(index, tokens.clone()),
            Command::DeleteAclTokens(ids) => state.delete_acl_tokens(index, ids),
            Command::UpsertAclRoles(roles) => state.upsert_acl_roles(index, roles.clone()),
            Command::Noop => Ok(()),
        };

        match &result {
            Ok(()) => tracing::debug!(index, command = command.name(), "Applied command"),
            Err(e) => tracing::warn!(index, command = command.name(), error = %e, "Command failed to apply"),
        }
        result
    }

    /// Serialize the whole state store.
    pub fn persist(&self) -> Result<Vec<u8>> {
        let store = self.state();
        let snap = store.snapshot();
        let mut writer = SnapshotWriter::new(SnapshotHeader {
            version: SNAPSHOT_FORMAT_VERSION,
            last_index: store.latest_index(),
        })?;
        let ws = &mut WatchSet::new();

        writer.record(SnapshotType::TimeTable, &self.timetable.lock().entries())?;
        for node in snap.nodes() {
            writer.record(SnapshotType::Node, &node)?;
        }
        for job in snap.jobs() {
            writer.record(SnapshotType::Job, &job)?;
        }
        for eval in snap.evals() {
            writer.record(SnapshotType::Eval, &eval)?;
        }
        for alloc in snap.allocs() {
            writer.record(SnapshotType::Alloc, &alloc)?;
        }
        for entry in snap.indexes() {
            writer.record(SnapshotType::Index, &entry)?;
        }
        for summary in snap.job_summaries() {
            writer.record(SnapshotType::JobSummary, &summary)?;
        }
        for version in snap.job_versions() {
            writer.record(SnapshotType::JobVersion, &version)?;
        }
        for deployment in snap.deployments() {
            writer.record(SnapshotType::Deployment, &deployment)?;
        }
        for token in snap.acl_tokens(ws) {
            writer.record(SnapshotType::AclToken, &token)?;
        }
        for role in snap.acl_roles(ws) {
            writer.record(SnapshotType::AclRole, &role)?;
        }
        for method in snap.auth_methods(ws) {
            writer.record(SnapshotType::AuthMethod, &method)?;
        }
        for namespace in snap.namespaces() {
            writer.record(SnapshotType::Namespace, &namespace)?;
        }
        for extension in self.extensions.iter() {
            for row in snap.extension_rows(extension.table()) {
                writer.raw(extension.tag(), row)?;
            }
        }

        Ok(writer.finish())
    }

    /// Replace the state store with the contents of a snapshot.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        self.restore_filtered(data, None)
    }

    /// Rebuild a fresh store from `data`, keeping only records that pass
    /// `filter`, then swap it in and abandon the old one.
    pub fn restore_filtered(&self, data: &[u8], filter: Option<&FsmFilter>) -> Result<()> {
        let new_state = Arc::new(StateStore::new(Self::store_config(&self.config)));
        let mut timetable = TimeTable::default();

        let mut reader = SnapshotReader::new(data);
        let header = reader.header()?;

        let mut restore = new_state.restore();
        while let Some((tag, payload)) = reader.next_record()? {
            let Some(kind) = SnapshotType::from_tag(tag) else {
                let extension = self
                    .extensions
                    .get(tag)
                    .ok_or(ControlError::UnrecognizedRecordKind(tag))?;
                extension.restore(&mut restore, payload)?;
                continue;
            };

            match kind {
                SnapshotType::TimeTable => timetable.load(decode(payload)?),
                SnapshotType::Node => {
                    let mut node: Node = decode(payload)?;
                    if keep(filter, |f| f.include_node(&node.id)) {
                        node.canonicalize();
                        restore.node_restore(node);
                    }
                }
                SnapshotType::Job => {
                    let mut job: Job = decode(payload)?;
                    if keep(filter, |f| f.include_job(&job.id)) {
                        job.canonicalize();
                        restore.job_restore(job);
                    }
                }
                SnapshotType::Eval => {
                    let eval: Evaluation = decode(payload)?;
                    if keep(filter, |f| f.include_job(&eval.job_id)) {
                        restore.eval_restore(eval);
                    }
                }
                SnapshotType::Alloc => {
                    let alloc: Allocation = decode(payload)?;
                    if keep(filter, |f| {
                        f.include_job(&alloc.job_id) || f.include_node(&alloc.node_id)
                    }) {
                        restore.alloc_restore(alloc);
                    }
                }
                SnapshotType::Index => restore.index_restore(decode::<IndexEntry>(payload)?),
                SnapshotType::JobSummary => {
                    let summary: JobSummary = decode(payload)?;
                    if keep(filter, |f| f.include_job(&summary.job_id)) {
                        restore.job_summary_restore(summary);
                    }
                }
                SnapshotType::JobVersion => {
                    let version: Job = decode(payload)?;
                    if keep(filter, |f| f.include_job(&version.id)) {
                        restore.job_version_restore(version);
                    }
                }
                SnapshotType::Deployment => {
                    let deployment: Deployment = decode(payload)?;
                    if keep(filter, |f| f.include_job(&deployment.job_id)) {
                        restore.deployment_restore(deployment);
                    }
                }
                SnapshotType::AclToken => restore.acl_token_restore(decode::<AclToken>(payload)?),
                SnapshotType::AclRole => restore.acl_role_restore(decode::<AclRole>(payload)?),
                SnapshotType::AuthMethod => {
                    restore.auth_method_restore(decode::<AuthMethod>(payload)?)
                }
                SnapshotType::Namespace => {
                    restore.namespace_restore(decode::<Namespace>(payload)?)
                }
            }
        }
        restore.commit();

        // Only the pointer swap happens under the lock.
        let old_state = {
            let mut current = self.state.write();
            std::mem::replace(&mut *current, new_state)
        };
        *self.timetable.lock() = timetable;

        // Readers blocked on the old store will never see another change.
        old_state.abandon();

        tracing::info!(
            last_index = header.last_index,
            filtered = filter.is_some(),
            "Restored state from snapshot"
        );
        Ok(())
    }
}
