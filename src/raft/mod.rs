pub mod node;
pub mod state;

pub use node::{wait_for_leadership, ConsensusLog, LeaderInfo, LocalRaft, RaftMessage};
pub use state::{Command, LogEntry, RaftRole, RaftState};
