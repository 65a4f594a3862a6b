//! Failure classification (spec.md §6/§7): a handful of marker error types
//! carried on specific error paths so `bin/apt-mirror.rs` can map the
//! outermost `anyhow::Error` to one of the documented exit codes without
//! string-matching messages. Everything else defaults to exit code 3
//! (network/checksum failure), the catch-all per spec.md's exit code table.
//!
//! [`crate::lock::LockContention`] is the fourth member of this family; it
//! lives in `lock.rs` alongside the primitive it reports on.

use std::fmt;

/// The configuration file is missing, malformed, or declares no
/// repositories - CLI exit code 1.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// GPG/detached-signature verification failed - CLI exit code 4. Per
/// spec.md §4.B, a signature failure aborts the whole repository: no
/// indices are fetched, nothing is promoted, nothing is GC'd.
#[derive(Debug)]
pub struct SignatureError(pub String);

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signature verification failed: {}", self.0)
    }
}

impl std::error::Error for SignatureError {}

/// Find the first error in `err`'s chain that downcasts to `T`.
pub fn find_in_chain<T: std::error::Error + 'static>(err: &anyhow::Error) -> Option<&T> {
    err.chain().find_map(|cause| cause.downcast_ref::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_in_chain_locates_a_wrapped_marker() {
        let err = anyhow::Error::new(ConfigError("no repositories".to_string()))
            .context("loading /etc/apt/mirror.list");
        assert!(find_in_chain::<ConfigError>(&err).is_some());
        assert!(find_in_chain::<SignatureError>(&err).is_none());
    }
}
