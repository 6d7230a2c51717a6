pub mod config;
pub mod domain;
pub mod http;
pub mod id;
pub mod kv;
pub mod raft;
pub mod state;
pub mod version;
