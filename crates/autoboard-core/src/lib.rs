pub mod activity;
pub mod config;
pub mod deps;
pub mod event;
pub mod gateway;
pub mod persist;
pub mod reconciler;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod store;
pub mod types;
pub mod worktree;

pub use types::*;
