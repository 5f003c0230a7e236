//! slipway-core — configuration, artifact references, retry policy and the
//! error taxonomy shared by every Slipway crate.

pub mod artifact;
pub mod config;
pub mod duration;
pub mod error;
pub mod retry;

pub use artifact::{ArtifactError, ArtifactRef};
pub use config::SlipwayConfig;
pub use duration::parse_duration;
pub use error::{CutoverError, FailureCategory};
pub use retry::RetryPolicy;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Derive a short, stable identifier from a list of parts.
///
/// Used for deployment ids so that re-dispatching the same request
/// always lands on the same record.
pub fn stable_id(prefix: &str, parts: &[&str]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{prefix}-{}", &digest[..12])
}
