use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{ControlError, Result};
use crate::fsm::{Fsm, FsmConfig};
use crate::http;
use crate::raft::{wait_for_leadership, LocalRaft, RaftMessage};
use crate::replication::run_replication;
use crate::rpc::{acl, HttpForwarder, Server, ServerState};

/// A control-plane server: FSM, consensus log, RPC server and HTTP gateway.
pub struct ServerNode {
    pub config: ServerConfig,
    pub fsm: Arc<Fsm>,
    pub raft: Arc<LocalRaft>,
    pub server: Arc<Server>,
    shutdown: CancellationToken,
}

impl ServerNode {
    pub fn new(
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let fsm = Arc::new(Fsm::new(FsmConfig {
            region: config.region.clone(),
        }));
        let (raft, raft_rx) = LocalRaft::new(&config, fsm.clone());
        let raft = Arc::new(raft);

        let forwarder =
            HttpForwarder::new(config.region_servers.clone(), config.blocking.clone())?;
        let state = Arc::new(ServerState::new(
            config.clone(),
            fsm.clone(),
            raft.clone(),
            Arc::new(forwarder),
            shutdown.clone(),
        ));
        let server = Arc::new(Server::new(state));

        let node = Self {
            config,
            fsm,
            raft,
            server,
            shutdown,
        };
        Ok((node, raft_rx))
    }

    /// Bind the configured HTTP address and run until shutdown.
    pub async fn run(self, raft_rx: mpsc::Receiver<RaftMessage>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.http_addr)
            .await
            .map_err(|e| {
                ControlError::Unavailable(format!(
                    "failed to bind {}: {}",
                    self.config.http_addr, e
                ))
            })?;
        self.run_with_listener(listener, raft_rx).await;
        Ok(())
    }

    /// Run every subsystem, serving HTTP on `listener`:
    /// 1. the consensus loop
    /// 2. bootstrap-token minting whenever this node gains leadership
    /// 3. auth-method replication (non-authoritative regions only)
    /// 4. the HTTP gateway, until shutdown
    pub async fn run_with_listener(
        self,
        listener: tokio::net::TcpListener,
        raft_rx: mpsc::Receiver<RaftMessage>,
    ) {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        tracing::info!(
            node_id = self.config.node_id,
            region = %self.config.region,
            addr = ?addr,
            acl = self.config.acl_enabled,
            "Starting control-plane server"
        );

        let raft = self.raft.clone();
        let raft_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            raft.run(raft_rx, raft_shutdown).await;
        });

        let state = self.server.state().clone();
        let bootstrap_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            Self::bootstrap_loop(state, bootstrap_shutdown).await;
        });

        let state = self.server.state().clone();
        let replication_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_replication(state, replication_shutdown).await;
        });

        http::serve(listener, self.server.clone(), self.shutdown.clone()).await;
        tracing::info!(node_id = self.config.node_id, "Control-plane server stopped");
    }

    async fn bootstrap_loop(state: Arc<ServerState>, shutdown: CancellationToken) {
        if state.config.bootstrap_token.is_none() {
            return;
        }
        let mut leadership = state.raft.leadership();
        loop {
            tokio::select! {
                alive = wait_for_leadership(&mut leadership, true) => {
                    if !alive {
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }
            if let Err(e) = acl::bootstrap(&state).await {
                tracing::error!(error = %e, "Failed to mint bootstrap token");
            }
            tokio::select! {
                _ = wait_for_leadership(&mut leadership, false) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}
