//! taskbroker — durable task lifecycle and broker/worker orchestration core.

pub mod broker;
pub mod config;
pub mod error;
pub mod executor;
pub mod performer;
pub mod store;
pub mod task;
