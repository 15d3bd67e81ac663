use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::oidc::provider::{Provider, ProviderConfig};
use crate::structs::AuthMethod;

/// Discovered providers keyed by auth-method name. An entry is only reused
/// while the method's hash is unchanged.
pub struct ProviderCache {
    timeout: Duration,
    entries: Mutex<HashMap<String, (Vec<u8>, Arc<Provider>)>>,
}

impl ProviderCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, method: &AuthMethod) -> Option<Arc<Provider>> {
        let entries = self.entries.lock();
        match entries.get(&method.name) {
            Some((hash, provider)) if *hash == method.hash => Some(provider.clone()),
            _ => None,
        }
    }

    /// The provider for `method`, running discovery on a miss.
    pub async fn get(&self, method: &AuthMethod) -> Result<Arc<Provider>> {
        if let Some(provider) = self.cached(method) {
            return Ok(provider);
        }

        let config = ProviderConfig::from_auth_method(method)?;
        let provider = Arc::new(Provider::discover(config, self.timeout).await?);
        self.entries
            .lock()
            .insert(method.name.clone(), (method.hash.clone(), provider.clone()));
        Ok(provider)
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
