pub mod acl;
pub mod auth_method;
pub mod duration;
pub mod records;
pub mod rpc;

#[cfg(test)]
pub(crate) mod mock;

pub use acl::{Acl, AclRole, AclToken, AclTokenRoleLink, TokenType};
pub use auth_method::{AuthMethod, AuthMethodConfig, AuthMethodStub};
pub use records::{
    Allocation, Deployment, Evaluation, IndexEntry, Job, JobSummary, Namespace, Node,
};
pub use rpc::*;
