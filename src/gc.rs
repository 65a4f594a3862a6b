//! Reference-tracking garbage collector (component F): walks `mirror/` and
//! classifies every file as wanted, `LOCAL` (untouched, outside any
//! `clean`-opted-in prefix) or `DELETE` (stale and eligible for removal),
//! per spec.md §4.F. Tree walks use `walkdir`, the same crate the teacher's
//! `Pool::gc` walks its link directory with.

use std::{
    collections::HashSet,
    fs,
    io::Write as _,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use walkdir::WalkDir;

use crate::config::CleanMode;

#[derive(Debug, Default)]
pub struct GcReport {
    /// Present on disk but outside any `clean`-opted-in prefix: left alone
    /// unconditionally.
    pub local: Vec<PathBuf>,
    /// Stale and opted into cleaning: candidates for `clean.sh` and/or
    /// unlinking.
    pub stale: Vec<PathBuf>,
    pub stale_bytes: u64,
}

/// Walk `mirror_root` and classify every regular file relative to it.
///
/// `wanted` holds paths relative to `mirror_root` that the current run's
/// config still wants - anything else is either `local` (no `clean`
/// directive covers it) or `stale` (covered, but no longer referenced).
pub fn scan(
    mirror_root: &Path,
    wanted: &HashSet<PathBuf>,
    clean_allowed: impl Fn(&Path) -> bool,
) -> Result<GcReport, Error> {
    let mut report = GcReport::default();

    // Nothing has ever been promoted yet (e.g. every repository failed
    // during MetaStage on a first run) - an absent mirror root has no
    // stale files to report, rather than a walk error.
    if !mirror_root.exists() {
        return Ok(report);
    }

    for entry in WalkDir::new(mirror_root) {
        let entry = entry.with_context(|| format!("walking {mirror_root:?}"))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(mirror_root)
            .expect("walkdir yields paths under its root")
            .to_path_buf();

        if wanted.contains(&relative) {
            continue;
        }

        if clean_allowed(&relative) {
            let size = entry.metadata().map(|meta| meta.size()).unwrap_or(0);
            report.stale_bytes += size;
            report.stale.push(relative);
        } else {
            report.local.push(relative);
        }
    }

    Ok(report)
}

/// Write `var/clean.sh`: a shell script of `rm -f` lines for every stale
/// path, for an operator to review before running manually (clean modes
/// `on`/`both`).
pub fn write_clean_script(path: &Path, mirror_root: &Path, stale: &[PathBuf]) -> Result<(), Error> {
    let mut script = String::from("#!/bin/sh\nset -e\n");
    for relative in stale {
        let absolute = mirror_root.join(relative);
        script.push_str(&format!("rm -f -- {:?}\n", absolute));
    }

    let mut file = fs::File::create(path).with_context(|| format!("creating {path:?}"))?;
    file.write_all(script.as_bytes())?;

    let mut perms = file.metadata()?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(path, perms)?;

    Ok(())
}

/// Unlink every stale path directly (clean modes `auto`/`both`). Returns
/// the number of files removed.
pub fn unlink_stale(mirror_root: &Path, stale: &[PathBuf]) -> Result<usize, Error> {
    let mut removed = 0;
    for relative in stale {
        let absolute = mirror_root.join(relative);
        match fs::remove_file(&absolute) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("removing {absolute:?}")),
        }
    }
    Ok(removed)
}

/// Apply `mode` to a computed report: write the script and/or unlink, per
/// spec.md §4.F's four clean modes.
pub fn apply(mode: CleanMode, var_path: &Path, mirror_root: &Path, report: &GcReport) -> Result<(), Error> {
    if mode.writes_script() {
        write_clean_script(&var_path.join("clean.sh"), mirror_root, &report.stale)?;
    }
    if mode.unlinks() {
        unlink_stale(mirror_root, &report.stale)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn classifies_wanted_local_and_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "deb.debian.org/pool/main/a.deb");
        touch(root, "deb.debian.org/pool/main/b.deb");
        touch(root, "other.example/pool/main/c.deb");

        let mut wanted = HashSet::new();
        wanted.insert(PathBuf::from("deb.debian.org/pool/main/a.deb"));

        let report = scan(root, &wanted, |p| {
            p.starts_with("deb.debian.org")
        })
        .unwrap();

        assert_eq!(report.stale, vec![PathBuf::from("deb.debian.org/pool/main/b.deb")]);
        assert_eq!(report.local, vec![PathBuf::from("other.example/pool/main/c.deb")]);
    }

    #[test]
    fn unlink_stale_removes_files_and_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "a.deb");

        let removed = unlink_stale(root, &[PathBuf::from("a.deb"), PathBuf::from("missing.deb")]).unwrap();
        assert_eq!(removed, 1);
        assert!(!root.join("a.deb").exists());
    }

    #[test]
    fn write_clean_script_is_executable_and_lists_stale_paths() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("clean.sh");
        write_clean_script(&script_path, dir.path(), &[PathBuf::from("pool/a.deb")]).unwrap();

        let contents = fs::read_to_string(&script_path).unwrap();
        assert!(contents.contains("pool/a.deb"));

        let mode = fs::metadata(&script_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
