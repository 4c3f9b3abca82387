/// Re-export `Config` from `topd-core` for use within this crate.
///
/// Environment parsing lives in `topd-core` so integration tests can build a
/// `Config` without the server binary.
pub use topd_core::config::{Config, StorageKind};
