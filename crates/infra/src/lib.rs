//! Infrastructure layer: KV store adapters, configuration and the job
//! lifecycle services built on them.

pub mod config;
pub mod jobs;
pub mod kv_store;

#[cfg(test)]
mod integration_tests;
