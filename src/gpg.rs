//! Signature verification is an external collaborator (spec.md §1): this
//! crate shells out to a `gpgv`-style verifier rather than embedding an
//! OpenPGP implementation, unlike the teacher's `helpers::verifier` (which
//! linked `sequoia-openpgp` directly). A `Verifier` trait keeps the
//! orchestrator testable without invoking a real binary.

use std::{
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{bail, Context, Error};

pub trait GpgVerifier: Send + Sync {
    /// Verify `content` against `detached_signature` (`None` for an inline-
    /// signed `InRelease`) using `keyring`. Returns `Ok(())` iff the
    /// signature is valid and made by a key in the keyring.
    fn verify(
        &self,
        content: &[u8],
        detached_signature: Option<&[u8]>,
        keyring: &Path,
    ) -> Result<(), Error>;
}

/// Shells out to the system `gpgv` binary.
pub struct GpgvVerifier;

impl GpgVerifier for GpgvVerifier {
    fn verify(
        &self,
        content: &[u8],
        detached_signature: Option<&[u8]>,
        keyring: &Path,
    ) -> Result<(), Error> {
        // `gpgv` has no stdin-signature mode: it always needs at least one
        // file argument (the clear-signed message, or a detached signature
        // plus the signed content). Materialize both sides on disk.
        let content_file = tempfile::NamedTempFile::new().context("creating temporary content file")?;
        std::fs::write(content_file.path(), content).context("writing temporary content file")?;

        let mut command = Command::new("gpgv");
        command
            .arg("--keyring")
            .arg(keyring)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let sig_file;
        if let Some(signature) = detached_signature {
            sig_file = tempfile::NamedTempFile::new().context("creating temporary signature file")?;
            std::fs::write(sig_file.path(), signature).context("writing temporary signature file")?;
            command.arg(sig_file.path()).arg(content_file.path());
        } else {
            command.arg(content_file.path());
        }

        let output = command.output().context("running gpgv")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gpgv signature verification failed: {stderr}");
        }

        Ok(())
    }
}

/// Fake verifier for tests: accepts or rejects unconditionally, and records
/// every call it was given.
#[derive(Default)]
pub struct FakeGpgVerifier {
    pub accept: bool,
}

impl GpgVerifier for FakeGpgVerifier {
    fn verify(
        &self,
        _content: &[u8],
        _detached_signature: Option<&[u8]>,
        _keyring: &Path,
    ) -> Result<(), Error> {
        if self.accept {
            Ok(())
        } else {
            bail!("signature verification failed (fake verifier configured to reject)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_verifier_honors_accept_flag() {
        let accepting = FakeGpgVerifier { accept: true };
        assert!(accepting.verify(b"data", None, Path::new("/dev/null")).is_ok());

        let rejecting = FakeGpgVerifier { accept: false };
        assert!(rejecting.verify(b"data", None, Path::new("/dev/null")).is_err());
    }
}
