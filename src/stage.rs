//! Staging and promotion (component D): artifacts are always written under
//! `skel/` first and only promoted into `mirror/` by rename once a whole
//! stage has succeeded, so a reader of `mirror/` never observes a partially
//! written file (spec.md §4.D, invariant 2). Uses the same
//! `proxmox_sys::fs` primitives the teacher's pool uses for fsync'd writes.

use std::{fs, path::PathBuf};

use anyhow::{Context, Error};
use proxmox_sys::fs::{create_path, replace_file, CreateOptions};

pub struct Stager {
    skel_root: PathBuf,
    mirror_root: PathBuf,
    /// spec.md §4.D / §6 `unlink`: unlink the destination before rename when
    /// its content differs, rather than letting `rename` replace the dirent
    /// underneath a possibly hardlinked inode.
    unlink: bool,
}

impl Stager {
    pub fn new(skel_root: impl Into<PathBuf>, mirror_root: impl Into<PathBuf>) -> Self {
        Stager {
            skel_root: skel_root.into(),
            mirror_root: mirror_root.into(),
            unlink: false,
        }
    }

    pub fn with_unlink(mut self, unlink: bool) -> Self {
        self.unlink = unlink;
        self
    }

    pub fn staged_path(&self, relative: &str) -> PathBuf {
        self.skel_root.join(relative)
    }

    pub fn final_path(&self, relative: &str) -> PathBuf {
        self.mirror_root.join(relative)
    }

    /// Path of the in-progress download for `relative` - written to
    /// incrementally as bytes arrive over the network, so an interrupted
    /// fetch leaves genuine resumable bytes behind (spec.md §3 invariant 3 /
    /// §5's ".partial suffix ... preserved for resumption"). Never promoted
    /// directly; [`Stager::finalize_partial`] renames it into
    /// [`Stager::staged_path`] once the whole artifact has verified.
    pub fn partial_path(&self, relative: &str) -> PathBuf {
        let mut path = self.staged_path(relative).into_os_string();
        path.push(".partial");
        PathBuf::from(path)
    }

    /// Fsync the `.partial` file for `relative` and rename it into its final
    /// staged name (spec.md §4.C point 5's finalization step).
    pub fn finalize_partial(&self, relative: &str) -> Result<(), Error> {
        let partial = self.partial_path(relative);
        let file = fs::File::open(&partial).with_context(|| format!("opening {partial:?}"))?;
        file.sync_all().with_context(|| format!("fsyncing {partial:?}"))?;
        drop(file);

        let staged = self.staged_path(relative);
        fs::rename(&partial, &staged)
            .with_context(|| format!("finalizing {partial:?} to {staged:?}"))
    }

    /// Write `data` to `skel/<relative>`, fsync'd, creating parent
    /// directories as needed.
    pub fn write_staged(&self, relative: &str, data: &[u8]) -> Result<(), Error> {
        let path = self.staged_path(relative);
        if let Some(parent) = path.parent() {
            create_path(parent, None, Some(CreateOptions::default()))
                .with_context(|| format!("creating staging directory {parent:?}"))?;
        }
        replace_file(&path, data, CreateOptions::default(), true)
            .with_context(|| format!("writing staged file {path:?}"))
    }

    /// Whether `skel/<relative>` already holds a staged copy, e.g. one
    /// resumed from a previous interrupted run.
    pub fn has_staged(&self, relative: &str) -> bool {
        self.staged_path(relative).exists()
    }

    /// Atomically move a staged file into its final place in `mirror/`.
    /// `fs::rename` is atomic as long as both paths share a filesystem,
    /// which the fixed mirror/skel layout guarantees.
    pub fn promote(&self, relative: &str) -> Result<(), Error> {
        let staged = self.staged_path(relative);
        let final_path = self.final_path(relative);

        // A reused artifact (§4.D's "download skipped entirely" precondition
        // check, see `scheduler::fetch_one`) never lands in `skel/` at all -
        // it was already promoted by an earlier run. Nothing to do.
        if !staged.exists() && final_path.exists() {
            return Ok(());
        }

        if let Some(parent) = final_path.parent() {
            create_path(parent, None, Some(CreateOptions::default()))
                .with_context(|| format!("creating mirror directory {parent:?}"))?;
        }

        // spec.md §4.D: pool files are sometimes hardlinked into multiple
        // suite/component paths, so overwriting the destination in place
        // would corrupt every other name sharing its inode. When `unlink` is
        // set and the existing destination's content differs from what's
        // staged, break that link explicitly before the rename.
        if self.unlink && final_path.exists() {
            let differs = fs::read(&final_path)
                .ok()
                .zip(fs::read(&staged).ok())
                .map(|(old, new)| old != new)
                .unwrap_or(true);
            if differs {
                fs::remove_file(&final_path)
                    .with_context(|| format!("unlinking {final_path:?} before promotion"))?;
            }
        }

        fs::rename(&staged, &final_path)
            .with_context(|| format!("promoting {staged:?} to {final_path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_promote_moves_file_into_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));

        stager.write_staged("dists/noble/Release", b"release contents").unwrap();
        assert!(stager.has_staged("dists/noble/Release"));
        assert!(!stager.final_path("dists/noble/Release").exists());

        stager.promote("dists/noble/Release").unwrap();
        assert!(!stager.staged_path("dists/noble/Release").exists());
        let contents = fs::read(stager.final_path("dists/noble/Release")).unwrap();
        assert_eq!(contents, b"release contents");
    }

    #[test]
    fn promote_overwrites_existing_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));

        stager.write_staged("Release", b"first").unwrap();
        stager.promote("Release").unwrap();

        stager.write_staged("Release", b"second").unwrap();
        stager.promote("Release").unwrap();

        assert_eq!(fs::read(stager.final_path("Release")).unwrap(), b"second");
    }

    #[test]
    fn unlink_set_breaks_hardlink_before_overwriting_changed_content() {
        let dir = tempfile::tempdir().unwrap();
        let stager =
            Stager::new(dir.path().join("skel"), dir.path().join("mirror")).with_unlink(true);

        stager.write_staged("pool/a.deb", b"v1").unwrap();
        stager.promote("pool/a.deb").unwrap();

        // A second name hardlinked to the same inode as the promoted file.
        let alias = dir.path().join("mirror").join("b.deb");
        fs::hard_link(stager.final_path("pool/a.deb"), &alias).unwrap();

        stager.write_staged("pool/a.deb", b"v2").unwrap();
        stager.promote("pool/a.deb").unwrap();

        assert_eq!(fs::read(stager.final_path("pool/a.deb")).unwrap(), b"v2");
        // The alias still reads the old content - unlinking broke the shared
        // inode instead of corrupting it in place.
        assert_eq!(fs::read(&alias).unwrap(), b"v1");
    }

    #[test]
    fn finalize_partial_renames_the_partial_into_its_staged_name() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));

        let partial = stager.partial_path("pool/a.deb");
        fs::create_dir_all(partial.parent().unwrap()).unwrap();
        fs::write(&partial, b"partial bytes").unwrap();

        stager.finalize_partial("pool/a.deb").unwrap();
        assert!(!partial.exists());
        assert_eq!(fs::read(stager.staged_path("pool/a.deb")).unwrap(), b"partial bytes");
    }

    #[test]
    fn unlink_not_set_skips_the_explicit_unlink_step() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));

        stager.write_staged("Release", b"first").unwrap();
        stager.promote("Release").unwrap();
        stager.write_staged("Release", b"second").unwrap();
        stager.promote("Release").unwrap();

        assert_eq!(fs::read(stager.final_path("Release")).unwrap(), b"second");
    }
}
