//! Order service with a cache-aside read path.
//!
//! Orders arrive as JSON on a line-delimited TCP bus, are cached in an
//! [`cache::ExpiringCache`] and persisted to SQLite. Lookups over HTTP are
//! answered from the cache when possible and from the store otherwise.

pub mod bus;
pub mod cache;
pub mod cli;
pub mod commands;
pub mod db;
pub mod error;
pub mod generate;
pub mod http;
pub mod server;
pub mod service;
pub mod store;
pub mod types;
