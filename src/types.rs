//! Core data model: repositories, artifacts, run identity.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{format_err, Error};
use proxmox_apt::{deb822::CheckSums, repositories::APTRepository};
use proxmox_time::{epoch_i64, epoch_to_rfc3339_utc};

/// The three sequential phases of a run, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Release,
    Index,
    Archive,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Release => "Release",
            Stage::Index => "Index",
            Stage::Archive => "Archive",
        })
    }
}

/// A single repository root, derived from one `deb`/`deb-src` config line.
///
/// Identified for dedup/ordering purposes by `(scheme_host, suite)` - see
/// [`Repository::key`].
#[derive(Debug, Clone)]
pub struct Repository {
    pub repository: APTRepository,
    /// Architectures configured for this repository (already resolved against
    /// `defaultarch`/`[arch=...]`, "all" is always implied separately).
    pub architectures: Vec<String>,
    pub source: bool,
    pub signed_by: Option<PathBuf>,
}

impl Repository {
    /// Host (used as the first path component under `mirror/`/`skel/`).
    pub fn host(&self) -> Result<String, Error> {
        let uri = self
            .repository
            .uris
            .first()
            .ok_or_else(|| format_err!("repository has no URI"))?;
        let without_scheme = uri
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(uri.as_str());
        let host = without_scheme.split('/').next().unwrap_or(without_scheme);
        Ok(host.to_string())
    }

    /// Path prefix of the repository root below the host, e.g. `ubuntu` for
    /// `http://host/ubuntu`.
    pub fn path_prefix(&self) -> Result<String, Error> {
        let uri = self
            .repository
            .uris
            .first()
            .ok_or_else(|| format_err!("repository has no URI"))?;
        let without_scheme = uri
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(uri.as_str());
        Ok(without_scheme
            .split_once('/')
            .map(|(_, rest)| rest.trim_matches('/').to_string())
            .unwrap_or_default())
    }

    /// `<host>[/<path-prefix>]`, the root every artifact's
    /// `tree_relative_path` is rooted under.
    pub fn root_relative(&self) -> Result<String, Error> {
        let host = self.host()?;
        let prefix = self.path_prefix()?;
        Ok(if prefix.is_empty() {
            host
        } else {
            format!("{host}/{prefix}")
        })
    }

    pub fn suite(&self) -> Result<&str, Error> {
        self.repository
            .suites
            .first()
            .map(|s| s.as_str())
            .ok_or_else(|| format_err!("repository has no suite"))
    }

    /// Stable dedup/grouping key: scheme+host+path-prefix+suite.
    pub fn key(&self) -> Result<String, Error> {
        Ok(format!(
            "{}/{}",
            self.repository
                .uris
                .first()
                .ok_or_else(|| format_err!("repository has no URI"))?,
            self.suite()?
        ))
    }
}

/// One file the engine must fetch and place in `mirror/`.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Path relative to the repository root, on both remote and local tree.
    pub relative_path: String,
    /// Known for listed artifacts; `None` for the top-level Release before
    /// its own hash is known.
    pub byte_size: Option<u64>,
    pub checksums: CheckSums,
    pub stage: Stage,
}

impl Artifact {
    /// Dedup key: `(scheme, host, relative_path)` - two repositories sharing a
    /// URL never fetch the same file twice within a run.
    pub fn dedup_key(&self, repo: &Repository) -> Result<String, Error> {
        Ok(format!(
            "{}/{}",
            repo.repository
                .uris
                .first()
                .ok_or_else(|| format_err!("repository has no URI"))?,
            self.relative_path
        ))
    }

    pub fn local_path(&self, mirror_root: &Path, repo: &Repository) -> Result<PathBuf, Error> {
        Ok(mirror_root.join(self.tree_relative_path(repo)?))
    }

    /// Path relative to the `mirror/`/`skel/` root: `<host>[/<prefix>]/<relative_path>`.
    pub fn tree_relative_path(&self, repo: &Repository) -> Result<String, Error> {
        let prefix = repo.path_prefix()?;
        Ok(if prefix.is_empty() {
            format!("{}/{}", repo.host()?, self.relative_path)
        } else {
            format!("{}/{}/{}", repo.host()?, prefix, self.relative_path)
        })
    }

    /// Absolute URL to fetch this artifact from.
    pub fn url(&self, repo: &Repository) -> Result<String, Error> {
        let base = repo
            .repository
            .uris
            .first()
            .ok_or_else(|| format_err!("repository has no URI"))?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), self.relative_path))
    }
}

/// Extension over `proxmox_apt::deb822::CheckSums` implementing the
/// strongest-available-algorithm selection rule from spec.md §4.B
/// (SHA512 > SHA256 > SHA1 > MD5).
pub trait ChecksumsExt {
    /// Name and hex digest of the strongest algorithm present.
    fn strongest_hex(&self) -> Option<(&'static str, String)>;
}

impl ChecksumsExt for CheckSums {
    fn strongest_hex(&self) -> Option<(&'static str, String)> {
        if let Some(sha512) = self.sha512 {
            return Some(("sha512", hex::encode(sha512)));
        }
        if let Some(sha256) = self.sha256 {
            return Some(("sha256", hex::encode(sha256)));
        }
        if let Some(sha1) = self.sha1 {
            return Some(("sha1", hex::encode(sha1)));
        }
        if let Some(md5) = self.md5 {
            return Some(("md5", hex::encode(md5)));
        }
        None
    }
}

/// Monotonic run identity, used for the `var/<run-timestamp>.state` journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunId(i64);

impl RunId {
    pub fn now() -> Self {
        Self(epoch_i64())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let formatted = epoch_to_rfc3339_utc(self.0).map_err(|_| std::fmt::Error)?;
        f.write_str(&formatted)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(_s: &str) -> Result<Self, Self::Err> {
        // Journal file names are write-only from this process's perspective;
        // parsing back is not required by any operation in this crate.
        Err(format_err!("RunId is not parseable from its display form"))
    }
}
