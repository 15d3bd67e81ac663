use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;

/// Limits applied to blocking queries.
#[derive(Debug, Clone)]
pub struct BlockingQueryConfig {
    /// Wait used when a blocking request does not give one.
    pub default_wait: Duration,
    /// Upper bound on any requested wait.
    pub max_wait: Duration,
    /// Waits are extended by up to `wait / jitter_fraction` so that many
    /// clients blocked on the same index do not all return together.
    pub jitter_fraction: u32,
    /// Wake-ups without a fresh result before the query gives up waiting
    /// and returns what it has.
    pub max_rounds: usize,
}

impl Default for BlockingQueryConfig {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_secs(5 * 60),
            max_wait: Duration::from_secs(10 * 60),
            jitter_fraction: 16,
            max_rounds: 128,
        }
    }
}

/// OIDC login settings.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// HMAC key binding the `state` of an auth URL to the request that
    /// produced it. Every server of the authoritative region must share it.
    pub state_key: Vec<u8>,
    /// How long an auth URL remains redeemable.
    pub request_ttl: Duration,
    /// Deadline for each call to the identity provider.
    pub provider_timeout: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        let mut state_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut state_key);
        Self {
            state_key,
            request_ttl: Duration::from_secs(5 * 60),
            provider_timeout: Duration::from_secs(5),
        }
    }
}

/// Auth-method replication from the authoritative region.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Token presented to the authoritative region.
    pub token: Option<String>,
    /// Minimum spacing between replication rounds.
    pub interval: Duration,
    /// Ceiling for the error backoff.
    pub max_backoff: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            token: None,
            interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub node_id: u64,
    pub node_name: String,
    pub region: String,
    /// Region that owns auth methods and ACL writes.
    pub authoritative_region: String,
    pub acl_enabled: bool,
    pub http_addr: SocketAddr,
    /// Base URL other servers use to reach this one.
    pub advertise_addr: String,
    /// Base URLs of servers in other regions, used for forwarding.
    pub region_servers: BTreeMap<String, Vec<String>>,
    /// Start as leader of a single-server region.
    pub bootstrap: bool,
    /// Secret of the management token minted on first leadership.
    pub bootstrap_token: Option<String>,
    /// Applied log entries kept before compaction.
    pub max_log_entries: usize,
    pub blocking: BlockingQueryConfig,
    pub oidc: OidcConfig,
    pub replication: ReplicationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        // SAFETY: This is a hardcoded valid address that will always parse
        let http_addr: SocketAddr = "127.0.0.1:4646"
            .parse()
            .expect("default HTTP address is valid");
        Self {
            node_id: 1,
            node_name: "server-1".to_string(),
            region: "global".to_string(),
            authoritative_region: "global".to_string(),
            acl_enabled: true,
            advertise_addr: format!("http://{}", http_addr),
            http_addr,
            region_servers: BTreeMap::new(),
            bootstrap: true,
            bootstrap_token: None,
            max_log_entries: 8192,
            blocking: BlockingQueryConfig::default(),
            oidc: OidcConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(node_id: u64, http_addr: SocketAddr) -> Self {
        Self {
            node_id,
            node_name: format!("server-{}", node_id),
            http_addr,
            advertise_addr: format!("http://{}", http_addr),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_authoritative_region(mut self, region: impl Into<String>) -> Self {
        self.authoritative_region = region.into();
        self
    }

    pub fn with_region_server(mut self, region: impl Into<String>, addr: impl Into<String>) -> Self {
        self.region_servers
            .entry(region.into())
            .or_default()
            .push(addr.into());
        self
    }

    pub fn with_acl(mut self, enabled: bool) -> Self {
        self.acl_enabled = enabled;
        self
    }

    pub fn with_bootstrap_token(mut self, secret: impl Into<String>) -> Self {
        self.bootstrap_token = Some(secret.into());
        self
    }

    /// Whether this server's region owns auth-method writes.
    pub fn is_authoritative(&self) -> bool {
        self.authoritative_region.is_empty() || self.region == self.authoritative_region
    }
}
