//! Orchestrator (component G): the run-level state machine from spec.md
//! §4.G - `Init -> Locked -> ConfigLoaded -> MetaStage -> IndexStage ->
//! ArchiveStage -> Cleanup -> PostHook -> Done`, with `Failed` reachable
//! from any state.

use std::{
    collections::HashSet,
    fmt::{self, Display},
    path::PathBuf,
    process::Command,
    sync::Arc,
};

use anyhow::{bail, Context, Error};
use serde::Serialize;

use crate::{
    config::Config,
    error::SignatureError,
    gc,
    gpg::GpgVerifier,
    lock,
    metadata,
    progress::{Progress, StageProgress},
    scheduler::{DownloadOutcome, DownloadTask, Scheduler},
    stage::Stager,
    transport::Transport,
    types::{Artifact, RunId, Stage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Locked,
    ConfigLoaded,
    MetaStage,
    IndexStage,
    ArchiveStage,
    Cleanup,
    PostHook,
    Done,
    Failed,
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Init => "Init",
            State::Locked => "Locked",
            State::ConfigLoaded => "ConfigLoaded",
            State::MetaStage => "MetaStage",
            State::IndexStage => "IndexStage",
            State::ArchiveStage => "ArchiveStage",
            State::Cleanup => "Cleanup",
            State::PostHook => "PostHook",
            State::Done => "Done",
            State::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Per-run journal persisted at `var/<run-timestamp>.state` (serde_json, an
/// ambient-stack addition alongside the teacher's `anyhow`/`println!` idiom
/// for everything else).
#[derive(Debug, Serialize)]
pub struct RunJournal {
    pub run_id: String,
    pub final_state: String,
    pub repositories: usize,
    pub index_progress: JournalProgress,
    pub archive_progress: JournalProgress,
    pub stale_files: usize,
    pub failed_repositories: usize,
    /// Set when at least one repository's signature verification failed -
    /// the CLI maps this to exit code 4 in preference to the generic 3.
    pub signature_failure: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize, Default)]
pub struct JournalProgress {
    pub new: usize,
    pub new_bytes: usize,
    pub reused: usize,
}

impl From<Progress> for JournalProgress {
    fn from(p: Progress) -> Self {
        JournalProgress {
            new: p.new,
            new_bytes: p.new_bytes,
            reused: p.reused,
        }
    }
}

/// Result of fetching one repository's top-level metadata: the parsed
/// Release plus every relative path that was staged for it (the Release/
/// InRelease file itself, and a detached `Release.gpg` when applicable).
struct ReleaseFetch {
    release: proxmox_apt::deb822::ReleaseFile,
    relative: String,
    extra: Vec<String>,
}

pub struct Orchestrator {
    config: Config,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn GpgVerifier>,
}

impl Orchestrator {
    pub fn new(config: Config, transport: Arc<dyn Transport>, verifier: Arc<dyn GpgVerifier>) -> Self {
        Orchestrator {
            config,
            transport,
            verifier,
        }
    }

    pub fn run(&self) -> Result<RunJournal, Error> {
        let mut state = State::Init;
        let run_id = RunId::now();
        let mut warnings = Vec::new();

        let result = self.run_inner(&run_id, &mut state, &mut warnings);

        match &result {
            Ok(_) => state = State::Done,
            Err(_) => state = State::Failed,
        }

        let journal = match result {
            Ok((index_progress, archive_progress, stale_files, failed_repositories, signature_failure)) => RunJournal {
                run_id: run_id.to_string(),
                final_state: state.to_string(),
                repositories: self.config.repositories.len(),
                index_progress: index_progress.into(),
                archive_progress: archive_progress.into(),
                stale_files,
                failed_repositories,
                signature_failure,
                warnings,
            },
            Err(err) => {
                self.write_journal_best_effort(&run_id, &state, &warnings);
                return Err(err);
            }
        };

        self.persist_journal(&run_id, &journal)?;
        Ok(journal)
    }

    fn run_inner(
        &self,
        run_id: &RunId,
        state: &mut State,
        warnings: &mut Vec<String>,
    ) -> Result<(Progress, Progress, usize, usize, bool), Error> {
        std::fs::create_dir_all(&self.config.var_path).context("creating var directory")?;
        let _lock = lock::acquire(&self.config.var_path)?;
        *state = State::Locked;

        if self.config.repositories.is_empty() {
            bail!("configuration has no 'deb'/'deb-src' lines");
        }
        *state = State::ConfigLoaded;

        let stager = Stager::new(&self.config.skel_path, &self.config.mirror_path)
            .with_unlink(self.config.unlink);
        let scheduler = Scheduler::new(&self.config, self.transport.clone())?;

        let mut index_artifacts_all = Vec::new();
        let mut archive_artifacts_all = Vec::new();
        let mut wanted: HashSet<PathBuf> = HashSet::new();
        // spec.md §3: "deduplication key is (scheme, host, relative_path)" -
        // two repositories referencing the same URL (e.g. two suites under
        // one repository root sharing a pool/ file) must only be fetched
        // once per run (spec.md §8 scenario S3).
        let mut seen_artifacts: HashSet<String> = HashSet::new();

        // Repository failure is scoped per spec.md §7: a repository whose
        // Release/index/archive fetches fail drops out of later stages and
        // GC, but its siblings continue. `path_to_repo` lets a scheduler
        // failure (which only carries a relative path) be traced back to
        // the repository key it belongs to.
        let mut failed_repos: HashSet<String> = HashSet::new();
        let mut path_to_repo: std::collections::HashMap<String, String> = std::collections::HashMap::new();

        let mut signature_failure = false;
        // Release/InRelease (+ detached Release.gpg) relative paths staged
        // during MetaStage, promoted only after this repository's indices
        // succeed - see `fetch_release`'s doc comment.
        let mut release_paths: std::collections::HashMap<String, (String, Vec<String>)> =
            std::collections::HashMap::new();

        *state = State::MetaStage;
        for repo in &self.config.repositories {
            let key = repo.key()?;
            let fetched = match self.fetch_release(repo, &stager) {
                Ok(fetched) => fetched,
                Err(err) => {
                    if crate::error::find_in_chain::<SignatureError>(&err).is_some() {
                        signature_failure = true;
                    }
                    warnings.push(format!("{key}: repository failed during MetaStage: {err:#}"));
                    failed_repos.insert(key);
                    continue;
                }
            };

            wanted.insert(PathBuf::from(&fetched.relative));
            path_to_repo.insert(fetched.relative.clone(), key.clone());
            for extra in &fetched.extra {
                wanted.insert(PathBuf::from(extra));
                path_to_repo.insert(extra.clone(), key.clone());
            }
            release_paths.insert(key.clone(), (fetched.relative.clone(), fetched.extra.clone()));

            let index_artifacts = metadata::index_artifacts(&fetched.release, repo);
            for artifact in index_artifacts {
                let relative = artifact.tree_relative_path(repo)?;
                wanted.insert(PathBuf::from(&relative));
                path_to_repo.insert(relative, key.clone());

                if seen_artifacts.insert(artifact.dedup_key(repo)?) {
                    index_artifacts_all.push(DownloadTask {
                        repo: repo.clone(),
                        artifact,
                    });
                }
            }
        }

        *state = State::IndexStage;
        let index_total = index_artifacts_all.len();
        let (index_outcomes, index_failures) = scheduler.run(&stager, index_artifacts_all);
        println!("{}", narrate_stage(Stage::Index, &index_outcomes, index_total));
        for failure in &index_failures {
            if let Some(key) = path_to_repo.get(&failure.relative_path) {
                failed_repos.insert(key.clone());
            }
            warnings.push(format!("{}: {}", failure.relative_path, failure.error));
        }
        for outcome in &index_outcomes {
            if !failed_repos.contains(
                path_to_repo
                    .get(&outcome.relative_path)
                    .map(String::as_str)
                    .unwrap_or_default(),
            ) {
                stager.promote(&outcome.relative_path)?;
            }
        }
        let index_progress = crate::scheduler::summarize(&index_outcomes);

        // Promote each repository's Release/InRelease (and detached
        // Release.gpg) only now that its indices are live in mirror/ -
        // spec.md §4.D's promotion ordering, enforced here rather than
        // per-file in `Stager`.
        for repo in &self.config.repositories {
            let key = repo.key()?;
            if failed_repos.contains(&key) {
                continue;
            }
            if let Some((relative, extra)) = release_paths.get(&key) {
                stager.promote(relative)?;
                for extra_relative in extra {
                    stager.promote(extra_relative)?;
                }
            }
        }

        for repo in &self.config.repositories {
            let key = repo.key()?;
            if failed_repos.contains(&key) {
                continue;
            }
            let Some((relative, _)) = release_paths.get(&key) else {
                continue;
            };
            let release_path = stager.final_path(relative);
            if let Ok(data) = std::fs::read(&release_path) {
                let release = metadata::parse_release(&data)?;
                let artifacts = self.collect_archive_artifacts(&release, repo)?;
                for artifact in artifacts {
                    let relative = artifact.tree_relative_path(repo)?;
                    wanted.insert(PathBuf::from(&relative));
                    path_to_repo.insert(relative, key.clone());

                    if seen_artifacts.insert(artifact.dedup_key(repo)?) {
                        archive_artifacts_all.push(DownloadTask {
                            repo: repo.clone(),
                            artifact,
                        });
                    }
                }
            }
        }

        *state = State::ArchiveStage;
        let archive_total = archive_artifacts_all.len();
        let (archive_outcomes, archive_failures) = scheduler.run(&stager, archive_artifacts_all);
        println!("{}", narrate_stage(Stage::Archive, &archive_outcomes, archive_total));
        for failure in &archive_failures {
            if let Some(key) = path_to_repo.get(&failure.relative_path) {
                failed_repos.insert(key.clone());
            }
            warnings.push(format!("{}: {}", failure.relative_path, failure.error));
        }
        for outcome in &archive_outcomes {
            stager.promote(&outcome.relative_path)?;
        }
        let archive_progress = crate::scheduler::summarize(&archive_outcomes);

        if !failed_repos.is_empty() {
            warnings.push(format!(
                "GC skipped for {} repositor{} with a failed stage this run",
                failed_repos.len(),
                if failed_repos.len() == 1 { "y" } else { "ies" }
            ));
        }

        *state = State::Cleanup;
        let mut clean_roots: Vec<PathBuf> = Vec::new();
        for repo in &self.config.repositories {
            if failed_repos.contains(&repo.key()?) {
                continue;
            }
            let uri = repo
                .repository
                .uris
                .first()
                .map(String::as_str)
                .unwrap_or_default();
            if self.config.clean_allowed(uri) {
                clean_roots.push(PathBuf::from(repo.root_relative()?));
            }
        }
        let report = gc::scan(&self.config.mirror_path, &wanted, |relative| {
            clean_roots.iter().any(|root| relative.starts_with(root))
        })?;
        gc::apply(self.config.clean, &self.config.var_path, &self.config.mirror_path, &report)?;
        let stale_files = report.stale.len();

        *state = State::PostHook;
        if self.config.run_postmirror {
            self.run_postmirror_hook(run_id)?;
        }

        Ok((index_progress, archive_progress, stale_files, failed_repos.len(), signature_failure))
    }

    /// Fetch the repository's top-level metadata. Only *stages* it under
    /// `skel/` - promotion to `mirror/` is deferred until after this
    /// repository's indices have been fetched and promoted (spec.md §4.D:
    /// "Release/InRelease last, so a client observing the tree never sees a
    /// Release referencing a not-yet-present index").
    fn fetch_release(&self, repo: &crate::types::Repository, stager: &Stager) -> Result<ReleaseFetch, Error> {
        let base = repo
            .repository
            .uris
            .first()
            .ok_or_else(|| anyhow::format_err!("repository has no URI"))?;
        let dist_url = format!("{}/dists/{}", base.trim_end_matches('/'), repo.suite()?);

        let in_release_relative = format!("{}/dists/{}/InRelease", repo.root_relative()?, repo.suite()?);
        let condition = Self::release_condition(stager, &in_release_relative);
        let in_release = self.transport.get(&format!("{dist_url}/InRelease"), &condition);

        let (data, relative, detached_signature, extra, unchanged) = match in_release {
            Ok(outcome) if outcome.status == 304 => (
                std::fs::read(stager.final_path(&in_release_relative))
                    .with_context(|| format!("re-reading unchanged {in_release_relative}"))?,
                in_release_relative,
                None,
                Vec::new(),
                true,
            ),
            Ok(outcome) if outcome.status < 400 => {
                (outcome.into_body()?, in_release_relative, None, Vec::new(), false)
            }
            _ => {
                let release_relative = format!("{}/dists/{}/Release", repo.root_relative()?, repo.suite()?);
                let condition = Self::release_condition(stager, &release_relative);
                let outcome = self.transport.get(&format!("{dist_url}/Release"), &condition)?;
                if outcome.status == 304 {
                    let gpg_relative = format!("{release_relative}.gpg");
                    (
                        std::fs::read(stager.final_path(&release_relative))
                            .with_context(|| format!("re-reading unchanged {release_relative}"))?,
                        release_relative,
                        None,
                        vec![gpg_relative],
                        true,
                    )
                } else {
                    if outcome.status >= 400 {
                        bail!("neither InRelease nor Release available for {}", dist_url);
                    }

                    // InRelease is clear-signed and needs no companion; a plain
                    // Release is verified (and mirrored) against a detached
                    // Release.gpg, which clients also expect to find on disk.
                    let gpg_relative = format!("{release_relative}.gpg");
                    let gpg_outcome = self.transport.get(
                        &format!("{dist_url}/Release.gpg"),
                        &crate::transport::FetchCondition::default(),
                    )?;
                    if gpg_outcome.status >= 400 {
                        bail!("Release.gpg missing for {} (required alongside Release)", dist_url);
                    }
                    let gpg_body = gpg_outcome.into_body()?;
                    stager.write_staged(&gpg_relative, &gpg_body)?;

                    (
                        outcome.into_body()?,
                        release_relative,
                        Some(gpg_body),
                        vec![gpg_relative],
                        false,
                    )
                }
            }
        };

        if !unchanged {
            if self.config.verify_gpg {
                let keyring = repo
                    .signed_by
                    .clone()
                    .or_else(|| self.config.gpg_keyring.clone())
                    .ok_or_else(|| anyhow::format_err!("verify_gpg is set but no keyring is configured"))?;
                self.verifier
                    .verify(&data, detached_signature.as_deref(), &keyring)
                    .map_err(|err| anyhow::Error::new(SignatureError(format!("{err:#}"))))?;
            }
            stager.write_staged(&relative, &data)?;
        }
        let release = metadata::parse_release(&data)?;

        Ok(ReleaseFetch {
            release,
            relative,
            extra,
        })
    }

    /// spec.md §4.C point 2: apply `If-Modified-Since` using the mtime of any
    /// existing promoted file, since the top-level Release has no hash known
    /// ahead of fetching it - this is the only conditional-GET mechanism
    /// available for it. A 304 is handled by the caller as success-with-no-
    /// change; no condition is sent when nothing has ever been promoted yet.
    fn release_condition(stager: &Stager, relative: &str) -> crate::transport::FetchCondition {
        let if_modified_since = std::fs::metadata(stager.final_path(relative))
            .and_then(|meta| meta.modified())
            .ok()
            .map(httpdate::fmt_http_date);
        crate::transport::FetchCondition {
            if_modified_since,
            ..Default::default()
        }
    }

    fn collect_archive_artifacts(
        &self,
        release: &proxmox_apt::deb822::ReleaseFile,
        repo: &crate::types::Repository,
    ) -> Result<Vec<Artifact>, Error> {
        let wanted = metadata::wanted_index_references(release, repo);
        let grouped = metadata::group_by_basename(&wanted);

        let mut artifacts = Vec::new();
        for variants in grouped.values() {
            let reference = metadata::pick_parseable_variant(variants);
            let path = stager_path_for(&self.config.mirror_path, repo, reference)?;
            let Ok(raw) = std::fs::read(&path) else {
                continue;
            };
            let Ok(data) = metadata::decompress(reference, &raw) else {
                continue;
            };

            match &reference.file_type {
                proxmox_apt::deb822::FileReferenceType::Packages(_, _) => {
                    if let Ok(packages) = metadata::parse_packages(&data) {
                        artifacts.extend(metadata::package_artifacts(&packages));
                    }
                }
                proxmox_apt::deb822::FileReferenceType::Sources(_) => {
                    if let Ok(sources) = metadata::parse_sources(&data) {
                        artifacts.extend(metadata::source_artifacts(&sources));
                    }
                }
                _ => {}
            }
        }
        Ok(artifacts)
    }

    fn run_postmirror_hook(&self, run_id: &RunId) -> Result<(), Error> {
        let Some(script) = &self.config.postmirror_script else {
            return Ok(());
        };
        let status = Command::new(script)
            .env("APT_MIRROR_RUN_ID", run_id.to_string())
            .env("APT_MIRROR_MIRROR_PATH", &self.config.mirror_path)
            .status()
            .with_context(|| format!("running post-mirror hook {script:?}"))?;
        if !status.success() {
            bail!("post-mirror hook {script:?} exited with {status}");
        }
        Ok(())
    }

    fn persist_journal(&self, run_id: &RunId, journal: &RunJournal) -> Result<(), Error> {
        let path = self.config.var_path.join(format!("{run_id}.state").replace(['/', ':'], "-"));
        let data = serde_json::to_vec_pretty(journal)?;
        std::fs::write(&path, data).with_context(|| format!("writing run journal {path:?}"))
    }

    fn write_journal_best_effort(&self, run_id: &RunId, state: &State, warnings: &[String]) {
        let journal = RunJournal {
            run_id: run_id.to_string(),
            final_state: state.to_string(),
            repositories: self.config.repositories.len(),
            index_progress: JournalProgress::default(),
            archive_progress: JournalProgress::default(),
            stale_files: 0,
            failed_repositories: 0,
            signature_failure: false,
            warnings: warnings.to_vec(),
        };
        let _ = self.persist_journal(run_id, &journal);
    }
}

/// Build spec.md §7's one-line-per-stage narration ("completed/total counts,
/// current throughput, and ETA") from a finished stage's outcomes. Stages run
/// to completion before outcomes are known, so this is a post-stage summary
/// line rather than a ticking live counter - still the required shape.
fn narrate_stage(stage: Stage, outcomes: &[DownloadOutcome], total: usize) -> String {
    let mut progress = StageProgress::new(stage, total);
    for outcome in outcomes {
        progress.advance(outcome.bytes_fetched);
    }
    progress.line()
}

fn stager_path_for(
    mirror_root: &std::path::Path,
    repo: &crate::types::Repository,
    reference: &proxmox_apt::deb822::FileReference,
) -> Result<PathBuf, Error> {
    let artifact = Artifact {
        relative_path: format!("dists/{}/{}", repo.suite()?, reference.path),
        byte_size: Some(reference.size as u64),
        checksums: reference.checksums.clone(),
        stage: Stage::Index,
    };
    artifact.local_path(mirror_root, repo)
}
