use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{ControlError, Result};
use crate::fsm::{Fsm, FsmFilter};
use crate::raft::state::{Command, RaftRole, RaftState};

/// Where the current leader can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub id: u64,
    /// Base URL of the leader's HTTP endpoint.
    pub addr: String,
}

/// The replicated log as the rest of the server sees it.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Commit `command` and apply it to the FSM, returning its index. An
    /// FSM failure is returned as-is; the state is unchanged.
    async fn apply(&self, command: Command) -> Result<u64>;

    fn is_leader(&self) -> bool;

    fn leader(&self) -> Option<LeaderInfo>;

    /// Flips to `false` when this node loses leadership.
    fn leadership(&self) -> watch::Receiver<bool>;

    /// Time since this node last heard from the leader; zero on the leader.
    fn last_contact(&self) -> Duration;
}

/// Wait until the leadership watch reads `leader`. Returns false if the
/// consensus loop went away first.
pub async fn wait_for_leadership(rx: &mut watch::Receiver<bool>, leader: bool) -> bool {
    rx.wait_for(|current| *current == leader).await.is_ok()
}

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Request to append a command to the log
    AppendCommand {
        command: Command,
        response_tx: oneshot::Sender<Result<u64>>,
    },
    /// Take leadership in a new term
    BecomeLeader {
        response_tx: oneshot::Sender<Result<u64>>,
    },
    /// Hand leadership to another node (or to nobody)
    TransferLeadership {
        leader: Option<LeaderInfo>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// Serialize the FSM
    Snapshot {
        response_tx: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Replace the FSM state with a snapshot
    Restore {
        data: Vec<u8>,
        filter: Option<FsmFilter>,
        response_tx: oneshot::Sender<Result<()>>,
    },
}

/// A single-voter log. Every entry commits as soon as it is appended, and
/// the event loop applies it to the FSM before answering, so commands are
/// applied exactly once in log order.
pub struct LocalRaft {
    pub id: u64,
    advertise_addr: String,
    bootstrap: bool,
    max_log_entries: usize,
    state: RwLock<RaftState>,
    fsm: Arc<Fsm>,
    message_tx: mpsc::Sender<RaftMessage>,
    leadership_tx: watch::Sender<bool>,
    leader: RwLock<Option<LeaderInfo>>,
    last_contact: RwLock<Instant>,
}

impl LocalRaft {
    pub fn new(config: &ServerConfig, fsm: Arc<Fsm>) -> (Self, mpsc::Receiver<RaftMessage>) {
        let (message_tx, message_rx) = mpsc::channel(100);
        let (leadership_tx, _) = watch::channel(false);

        let node = Self {
            id: config.node_id,
            advertise_addr: config.advertise_addr.clone(),
            bootstrap: config.bootstrap,
            max_log_entries: config.max_log_entries,
            state: RwLock::new(RaftState::new()),
            fsm,
            message_tx,
            leadership_tx,
            leader: RwLock::new(None),
            last_contact: RwLock::new(Instant::now()),
        };

        (node, message_rx)
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn current_term(&self) -> u64 {
        self.state.read().current_term
    }

    pub fn last_index(&self) -> u64 {
        self.state.read().last_log_index()
    }

    fn self_info(&self) -> LeaderInfo {
        LeaderInfo {
            id: self.id,
            addr: self.advertise_addr.clone(),
        }
    }

    /// Run the Raft node main loop until `shutdown` fires
    pub async fn run(&self, mut message_rx: mpsc::Receiver<RaftMessage>, shutdown: CancellationToken) {
        if self.bootstrap {
            if let Err(e) = self.establish_leadership() {
                tracing::error!(node_id = self.id, error = %e, "Failed to establish leadership");
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.id, "Raft loop shutting down");
                    break;
                }
                msg = message_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_message(msg);
                }
            }
        }

        self.state.write().become_follower(None);
        self.leadership_tx.send_replace(false);
    }

    fn handle_message(&self, msg: RaftMessage) {
        match msg {
            RaftMessage::AppendCommand { command, response_tx } => {
                let _ = response_tx.send(self.handle_append_command(command));
            }
            RaftMessage::BecomeLeader { response_tx } => {
                let _ = response_tx.send(self.establish_leadership());
            }
            RaftMessage::TransferLeadership { leader, response_tx } => {
                self.relinquish_leadership(leader);
                let _ = response_tx.send(Ok(()));
            }
            RaftMessage::Snapshot { response_tx } => {
                let _ = response_tx.send(self.fsm.persist());
            }
            RaftMessage::Restore {
                data,
                filter,
                response_tx,
            } => {
                let _ = response_tx.send(self.handle_restore(&data, filter.as_ref()));
            }
        }
    }

    /// Become leader and commit a no-op so the new term has an entry.
    fn establish_leadership(&self) -> Result<u64> {
        {
            let mut state = self.state.write();
            if state.role == RaftRole::Leader {
                return Ok(state.last_log_index());
            }
            state.become_leader(self.id);
            tracing::info!(node_id = self.id, term = state.current_term, "Became leader");
        }
        *self.leader.write() = Some(self.self_info());

        let index = self.handle_append_command(Command::Noop)?;
        self.leadership_tx.send_replace(true);
        Ok(index)
    }

    fn relinquish_leadership(&self, leader: Option<LeaderInfo>) {
        let mut state = self.state.write();
        let was_leader = state.role == RaftRole::Leader;
        state.become_follower(leader.as_ref().map(|l| l.id));
        drop(state);

        *self.leader.write() = leader.clone();
        *self.last_contact.write() = Instant::now();
        if was_leader {
            tracing::info!(
                node_id = self.id,
                new_leader = ?leader.as_ref().map(|l| l.id),
                "Stepped down from leadership"
            );
        }
        self.leadership_tx.send_replace(false);
    }

    /// Handle a request to append a command (leader only)
    fn handle_append_command(&self, command: Command) -> Result<u64> {
        let mut state = self.state.write();

        if state.role != RaftRole::Leader {
            return Err(ControlError::Unavailable(format!(
                "not the leader, current leader: {:?}",
                state.leader_id
            )));
        }

        let index = state.append_entry(command);
        // A single voter is its own quorum.
        state.commit_index = index;

        let result = match state.get_entry(index) {
            Some(entry) => self.fsm.apply(index, &entry.command),
            None => Err(ControlError::ConsensusApply(format!(
                "entry {} missing after append",
                index
            ))),
        };
        state.last_applied = index;
        tracing::debug!(index, term = state.current_term, "Committed log entry");

        if state.log.len() > self.max_log_entries {
            let upto = state.last_applied;
            state.compact_to(upto);
            tracing::debug!(snapshot_index = upto, "Compacted log");
        }
        drop(state);

        *self.last_contact.write() = Instant::now();
        result.map(|_| index)
    }

    fn handle_restore(&self, data: &[u8], filter: Option<&FsmFilter>) -> Result<()> {
        self.fsm.restore_filtered(data, filter)?;
        let mut state = self.state.write();
        // Never move the index backwards, even for an older snapshot.
        let index = self.fsm.state().latest_index().max(state.last_log_index());
        state.reset_to_snapshot(index);
        Ok(())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> RaftMessage,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(make(response_tx))
            .await
            .map_err(|_| ControlError::ConsensusApply("raft loop is not running".to_string()))?;
        response_rx
            .await
            .map_err(|_| ControlError::ConsensusApply("raft loop dropped the request".to_string()))?
    }

    pub async fn become_leader(&self) -> Result<u64> {
        self.request(|response_tx| RaftMessage::BecomeLeader { response_tx })
            .await
    }

    pub async fn step_down(&self, leader: Option<LeaderInfo>) -> Result<()> {
        self.request(|response_tx| RaftMessage::TransferLeadership {
            leader,
            response_tx,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        self.request(|response_tx| RaftMessage::Snapshot { response_tx })
            .await
    }

    pub async fn restore(&self, data: Vec<u8>, filter: Option<FsmFilter>) -> Result<()> {
        self.request(|response_tx| RaftMessage::Restore {
            data,
            filter,
            response_tx,
        })
        .await
    }

    /// Wait until this node leads, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        let mut rx = self.leadership_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|leader| *leader))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ConsensusLog for LocalRaft {
    async fn apply(&self, command: Command) -> Result<u64> {
        self.request(|response_tx| RaftMessage::AppendCommand {
            command,
            response_tx,
        })
        .await
    }

    fn is_leader(&self) -> bool {
        self.state.read().role == RaftRole::Leader
    }

    fn leader(&self) -> Option<LeaderInfo> {
        if self.is_leader() {
            return Some(self.self_info());
        }
        self.leader.read().clone()
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership_tx.subscribe()
    }

    fn last_contact(&self) -> Duration {
        if self.is_leader() {
            Duration::ZERO
        } else {
            self.last_contact.read().elapsed()
        }
    }
}
