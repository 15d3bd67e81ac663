use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ControlError, Result};
use crate::fsm::snapshot::SnapshotType;
use crate::state::StateRestore;

/// Allow-list for a partial restore. Records keyed by job or node are kept
/// only when their ID is listed; an allocation is kept when either its job
/// or its node is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsmFilter {
    pub jobs: Vec<String>,
    pub nodes: Vec<String>,
}

impl FsmFilter {
    pub fn new(jobs: Vec<String>, nodes: Vec<String>) -> Self {
        Self { jobs, nodes }
    }

    pub fn include_job(&self, job_id: &str) -> bool {
        self.jobs.iter().any(|j| j == job_id)
    }

    pub fn include_node(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n == node_id)
    }
}

/// No filter means everything is restored.
pub(crate) fn keep(filter: Option<&FsmFilter>, predicate: impl FnOnce(&FsmFilter) -> bool) -> bool {
    filter.map(predicate).unwrap_or(true)
}

/// A record kind compiled in optionally. Its rows are opaque to the core and
/// are carried under `tag` in snapshots.
pub trait SnapshotExtension: Send + Sync {
    fn tag(&self) -> u8;

    /// Table the rows are stored under.
    fn table(&self) -> &'static str;

    /// Decode one payload and stage it in `restore`.
    fn restore(&self, restore: &mut StateRestore<'_>, payload: &[u8]) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    by_tag: HashMap<u8, Arc<dyn SnapshotExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn SnapshotExtension>) -> Result<()> {
        let tag = extension.tag();
        if SnapshotType::from_tag(tag).is_some() || self.by_tag.contains_key(&tag) {
            return Err(ControlError::InvalidArgument(format!(
                "snapshot tag {} is already registered",
                tag
            )));
        }
        tracing::debug!(tag, table = extension.table(), "Registered snapshot extension");
        self.by_tag.insert(tag, extension);
        Ok(())
    }

    pub fn get(&self, tag: u8) -> Option<&Arc<dyn SnapshotExtension>> {
        self.by_tag.get(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SnapshotExtension>> {
        self.by_tag.values()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<u8> = self.by_tag.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("ExtensionRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quotas;

    impl SnapshotExtension for Quotas {
        fn tag(&self) -> u8 {
            200
        }

        fn table(&self) -> &'static str {
            "quotas"
        }

        fn restore(&self, restore: &mut StateRestore<'_>, payload: &[u8]) -> Result<()> {
            restore.extension_restore(self.table(), payload.to_vec());
            Ok(())
        }
    }

    struct ShadowsNodes;

    impl SnapshotExtension for ShadowsNodes {
        fn tag(&self) -> u8 {
            SnapshotType::Node.tag()
        }

        fn table(&self) -> &'static str {
            "nodes"
        }

        fn restore(&self, _: &mut StateRestore<'_>, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn extensions_cannot_claim_builtin_or_duplicate_tags() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Arc::new(Quotas)).unwrap();
        assert!(registry.register(Arc::new(Quotas)).is_err());
        assert!(registry.register(Arc::new(ShadowsNodes)).is_err());
        assert!(registry.get(200).is_some());
    }

    #[test]
    fn allocation_kept_if_job_or_node_listed() {
        let filter = FsmFilter::new(vec!["A".into()], vec!["n1".into()]);
        assert!(filter.include_job("A"));
        assert!(!filter.include_job("B"));
        assert!(filter.include_node("n1"));
        assert!(keep(None, |f| f.include_job("anything")));
        assert!(!keep(Some(&filter), |f| f.include_job("B") || f.include_node("n2")));
    }
}
