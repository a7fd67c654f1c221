use std::time::Duration;

pub mod merge;
pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Default interval for requeuing a managed resource absent a more specific signal.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the Kubernetes field manager used for server-side apply/patch calls.
pub(crate) const MANAGER_NAME: &str = "eno-operator";

/// The finalizer string placed on Composition and ResourceSlice objects.
pub const CLEANUP_FINALIZER: &str = "eno.azure.io/cleanup";

pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    hex::encode(hasher.finalize())
}
