//! Switchboard Core Library
//! Request interception pipeline, account failover, and usage accounting

pub mod config;
pub mod directory;
pub mod error;
pub mod proxy;
pub mod store;
