use serde::{Deserialize, Serialize};

use crate::structs::{AclRole, AclToken, AuthMethod};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Commands replicated through the log and applied by the FSM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    UpsertAuthMethods(Vec<AuthMethod>),
    DeleteAuthMethods(Vec<String>),
    UpsertAclTokens(Vec<AclToken>),
    /// Accessor IDs to revoke
    DeleteAclTokens(Vec<String>),
    UpsertAclRoles(Vec<AclRole>),
    /// No-op command (used for leader commit)
    Noop,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::UpsertAuthMethods(_) => "upsert_auth_methods",
            Command::DeleteAuthMethods(_) => "delete_auth_methods",
            Command::UpsertAclTokens(_) => "upsert_acl_tokens",
            Command::DeleteAclTokens(_) => "delete_acl_tokens",
            Command::UpsertAclRoles(_) => "upsert_acl_roles",
            Command::Noop => "noop",
        }
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// Log and volatile state of the single-voter log.
///
/// Entries up to `snapshot_index` have been applied and dropped from `log`;
/// `log[0]` (if any) has index `snapshot_index + 1`.
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub log: Vec<LogEntry>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,

    pub commit_index: u64,
    pub last_applied: u64,

    pub role: RaftRole,
    pub leader_id: Option<u64>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            log: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader_id: None,
        }
    }

    /// Get the last log index
    pub fn last_log_index(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Get the last log term
    pub fn last_log_term(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Get log entry at index (1-indexed); compacted entries are gone
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    /// Append a new entry to the log and return its index
    pub fn append_entry(&mut self, command: Command) -> u64 {
        let index = self.last_log_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            command,
        });
        index
    }

    /// Drop applied entries up to and including `index`.
    pub fn compact_to(&mut self, index: u64) {
        let index = index.min(self.last_applied);
        if index <= self.snapshot_index {
            return;
        }
        let term = self.get_entry(index).map(|e| e.term).unwrap_or(self.snapshot_term);
        let drop_count = (index - self.snapshot_index) as usize;
        self.log.drain(..drop_count.min(self.log.len()));
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Reset the log after installing a snapshot taken at `index`.
    pub fn reset_to_snapshot(&mut self, index: u64) {
        self.log.clear();
        self.snapshot_index = index;
        self.snapshot_term = self.current_term;
        self.commit_index = index;
        self.last_applied = index;
    }

    /// Transition to follower state
    pub fn become_follower(&mut self, leader_id: Option<u64>) {
        self.role = RaftRole::Follower;
        self.leader_id = leader_id;
    }

    /// Transition to leader state in a new term
    pub fn become_leader(&mut self, my_id: u64) {
        self.current_term += 1;
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert!(state.log.is_empty());
        assert_eq!(state.last_log_index(), 0);
    }

    #[test]
    fn test_become_leader_bumps_term() {
        let mut state = RaftState::new();
        state.become_leader(1);
        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id, Some(1));
        assert_eq!(state.current_term, 1);

        state.become_follower(Some(2));
        state.become_leader(1);
        assert_eq!(state.current_term, 2);
    }

    #[test]
    fn test_append_entry() {
        let mut state = RaftState::new();
        state.become_leader(1);
        assert_eq!(state.append_entry(Command::Noop), 1);
        assert_eq!(state.append_entry(Command::Noop), 2);
        assert_eq!(state.last_log_index(), 2);
        assert_eq!(state.last_log_term(), 1);
        assert!(state.get_entry(0).is_none());
        assert_eq!(state.get_entry(2).unwrap().index, 2);
        assert!(state.get_entry(3).is_none());
    }

    #[test]
    fn test_compaction_keeps_indexes_monotonic() {
        let mut state = RaftState::new();
        state.become_leader(1);
        for _ in 0..5 {
            state.append_entry(Command::Noop);
        }
        state.commit_index = 5;
        state.last_applied = 4;

        // Cannot compact past what has been applied.
        state.compact_to(5);
        assert_eq!(state.snapshot_index, 4);
        assert_eq!(state.log.len(), 1);
        assert!(state.get_entry(4).is_none());
        assert_eq!(state.get_entry(5).unwrap().index, 5);

        assert_eq!(state.append_entry(Command::Noop), 6);
    }

    #[test]
    fn test_reset_to_snapshot() {
        let mut state = RaftState::new();
        state.become_leader(1);
        state.append_entry(Command::Noop);
        state.reset_to_snapshot(40);
        assert_eq!(state.last_log_index(), 40);
        assert_eq!(state.last_applied, 40);
        assert_eq!(state.append_entry(Command::Noop), 41);
    }
}
