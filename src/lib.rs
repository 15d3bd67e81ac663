pub mod api;
pub mod config;
pub mod error;
pub mod fsm;
pub mod http;
pub mod node;
pub mod oidc;
pub mod raft;
pub mod replication;
pub mod rpc;
pub mod shutdown;
pub mod state;
pub mod structs;
