//! OIDC federation: provider discovery and code exchange, claim mapping,
//! auth-request state binding and the local login callback.

pub mod cache;
pub mod callback;
pub mod claims;
pub mod provider;
pub mod state;

pub use cache::ProviderCache;
pub use callback::{CallbackOutcome, CallbackServer};
pub use provider::{AuthRequest, Provider, ProviderConfig, ProviderTokens};
pub use state::StateSigner;
