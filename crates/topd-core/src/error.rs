use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid config value for {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },
}
