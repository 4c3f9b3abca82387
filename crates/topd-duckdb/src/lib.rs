pub mod backend;
pub mod history;
pub mod schema;
pub mod sites;
pub mod storage_impl;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `topd_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
