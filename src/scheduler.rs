//! Bounded-concurrency download scheduler (component C). Runs a batch of
//! artifacts through a `rayon::ThreadPool` sized to `nthreads`, the same
//! concurrency primitive `p-vector`'s scanner uses for bounded parallel
//! work, in the fan-out/collect shape `aoscbootstrap`'s downloader uses
//! (`Arc<Mutex<_>>` aggregation around `par_iter`).

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Error};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    config::Config,
    progress::Progress,
    ratelimit::RateLimiter,
    retry::RetryPolicy,
    stage::Stager,
    transport::{FetchCondition, Transport},
    types::{Artifact, Repository},
    verify,
};

pub struct DownloadTask {
    pub repo: Repository,
    pub artifact: Artifact,
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub relative_path: String,
    pub bytes_fetched: usize,
    pub reused: bool,
}

#[derive(Debug)]
pub struct DownloadFailure {
    pub relative_path: String,
    pub error: String,
}

pub struct Scheduler {
    pool: ThreadPool,
    transport: Arc<dyn Transport>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    resume: bool,
    verify_checksums: bool,
}

impl Scheduler {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.nthreads.max(1))
            .build()?;

        Ok(Scheduler {
            pool,
            transport,
            rate_limiter: RateLimiter::new(config.limit_rate),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_delay),
            resume: config.resume_partial_downloads,
            verify_checksums: config.verify_checksums,
        })
    }

    /// Run every task, bounded by the pool's thread count. Returns
    /// successes and failures separately - a failed archive-stage artifact
    /// does not stop its siblings (spec.md §7's "continue past a single
    /// artifact failure, stage fails only if too many do" policy is applied
    /// by the caller over these results).
    pub fn run(&self, stager: &Stager, tasks: Vec<DownloadTask>) -> (Vec<DownloadOutcome>, Vec<DownloadFailure>) {
        let outcomes = Mutex::new(Vec::with_capacity(tasks.len()));
        let failures = Mutex::new(Vec::new());

        self.pool.install(|| {
            use rayon::prelude::*;
            tasks.par_iter().for_each(|task| match self.fetch_one(stager, task) {
                Ok(outcome) => outcomes.lock().unwrap().push(outcome),
                Err(err) => failures.lock().unwrap().push(DownloadFailure {
                    // Same tree-relative form `DownloadOutcome::relative_path`
                    // uses, so callers can key a `path_to_repo` map by either
                    // outcomes or failures interchangeably.
                    relative_path: task
                        .artifact
                        .tree_relative_path(&task.repo)
                        .unwrap_or_else(|_| task.artifact.relative_path.clone()),
                    error: err.to_string(),
                }),
            });
        });

        (outcomes.into_inner().unwrap(), failures.into_inner().unwrap())
    }

    fn fetch_one(&self, stager: &Stager, task: &DownloadTask) -> Result<DownloadOutcome, Error> {
        let relative = task.artifact.tree_relative_path(&task.repo)?;
        let url = task.artifact.url(&task.repo)?;

        // spec.md §4.D: "if the final path already exists and hash already
        // matches the declared hash, the download is skipped entirely
        // (precondition check before issuing HTTP)". Checked first since a
        // prior run's promotion empties `skel/` of this path entirely -
        // without this check every re-run would refetch every archive and
        // index that has already landed in `mirror/` (spec.md §8 property 1).
        if let Ok(data) = std::fs::read(stager.final_path(&relative)) {
            if verify::verify_bytes(&data, &task.artifact.checksums).is_ok() {
                return Ok(DownloadOutcome {
                    relative_path: relative,
                    bytes_fetched: 0,
                    reused: true,
                });
            }
        }

        if stager.has_staged(&relative) && self.verify_checksums {
            let data = std::fs::read(stager.staged_path(&relative))?;
            if verify::verify_bytes(&data, &task.artifact.checksums).is_ok() {
                return Ok(DownloadOutcome {
                    relative_path: relative,
                    bytes_fetched: 0,
                    reused: true,
                });
            }
        }

        let partial_path = stager.partial_path(&relative);
        if let Some(parent) = partial_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating staging directory {parent:?}"))?;
        }

        // The whole fetch-assemble-verify cycle is one retryable unit (spec.md
        // §4.E: "any mismatch discards the .partial and signals a retryable
        // error to §4.C") - a checksum or size mismatch is not distinguished
        // from a network failure as far as the retry budget is concerned.
        let total_bytes = self.retry.run(
            |_attempt| {
                let resume_from = if self.resume {
                    std::fs::metadata(&partial_path).ok().map(|meta| meta.len())
                } else {
                    None
                };
                let condition = FetchCondition {
                    resume_from,
                    if_modified_since: None,
                };

                let mut outcome = self.transport.get(&url, &condition)?;
                if outcome.status == 416 {
                    // spec.md §4.C point 1 / §7: a range-reject means the
                    // existing partial can't be resumed - discard it and
                    // retry the whole fetch from zero.
                    let _ = std::fs::remove_file(&partial_path);
                    anyhow::bail!("HTTP 416 fetching {url}, restarting from zero");
                }
                if outcome.status >= 400 {
                    anyhow::bail!("HTTP {} fetching {url}", outcome.status);
                }

                // Stream straight onto disk as bytes arrive, appending to the
                // existing partial on a 206 or starting fresh otherwise - an
                // interrupted fetch leaves whatever has been written so far
                // in `<relative>.partial` for the next run's Range-resume,
                // rather than losing it to an in-memory buffer that is only
                // persisted after the whole download succeeds (spec.md §3
                // invariant 3 / §5).
                let mut file = if outcome.partial {
                    std::fs::OpenOptions::new().append(true).open(&partial_path)?
                } else {
                    std::fs::File::create(&partial_path)?
                };
                let written = std::io::copy(&mut outcome.body, &mut file)?;
                self.rate_limiter.acquire(written as usize);
                file.sync_all()?;
                drop(file);

                let total_len = std::fs::metadata(&partial_path)?.len();

                if let Some(expected_size) = task.artifact.byte_size {
                    if total_len != expected_size {
                        let _ = std::fs::remove_file(&partial_path);
                        anyhow::bail!(
                            "size mismatch fetching {url}: expected {expected_size}, got {total_len}"
                        );
                    }
                }
                if self.verify_checksums {
                    let data = std::fs::read(&partial_path)?;
                    if let Err(err) = verify::verify_bytes(&data, &task.artifact.checksums) {
                        let _ = std::fs::remove_file(&partial_path);
                        return Err(err);
                    }
                }

                Ok(total_len)
            },
            |err| {
                let msg = err.to_string();
                // spec.md §4.C: 401/403 are never retried; 404 on a required
                // metadata file or archive is fatal for its repository, not
                // a transient condition worth spending the retry budget on.
                !msg.contains("HTTP 404") && !msg.contains("HTTP 401") && !msg.contains("HTTP 403")
            },
        )?;

        stager.finalize_partial(&relative)?;

        Ok(DownloadOutcome {
            relative_path: relative,
            bytes_fetched: total_bytes as usize,
            reused: false,
        })
    }
}

/// Fold a batch of outcomes into a `Progress` accumulator for narration.
pub fn summarize(outcomes: &[DownloadOutcome]) -> Progress {
    let mut progress = Progress::new();
    for outcome in outcomes {
        if outcome.reused {
            progress.record_reused();
        } else {
            progress.record_fetched(outcome.bytes_fetched);
        }
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeTransport;

    fn repo(url: &str) -> Repository {
        let repository = crate::metadata::parse_repo_line(&format!("deb {url} noble main")).unwrap();
        Repository {
            repository,
            architectures: vec!["amd64".to_string()],
            source: false,
            signed_by: None,
        }
    }

    fn artifact(path: &str, data: &[u8]) -> Artifact {
        Artifact {
            relative_path: path.to_string(),
            byte_size: Some(data.len() as u64),
            checksums: proxmox_apt::deb822::CheckSums {
                sha256: Some(openssl::sha::sha256(data)),
                ..Default::default()
            },
            stage: crate::types::Stage::Archive,
        }
    }

    #[test]
    fn fetches_and_stages_new_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));
        let repo = repo("http://deb.debian.org/debian");
        let data = b"package bytes";
        let task = DownloadTask {
            artifact: artifact("pool/main/p.deb", data),
            repo: repo.clone(),
        };

        let transport = Arc::new(
            FakeTransport::new().with_response("http://deb.debian.org/debian/pool/main/p.deb", data.to_vec()),
        );
        let mut config = Config::default();
        config.nthreads = 2;
        let scheduler = Scheduler::new(&config, transport).unwrap();

        let (outcomes, failures) = scheduler.run(&stager, vec![task]);
        assert!(failures.is_empty());
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].reused);
    }

    #[test]
    fn reuses_already_staged_artifact_with_matching_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));
        let repo = repo("http://deb.debian.org/debian");
        let data = b"cached bytes";
        stager
            .write_staged(&artifact("pool/main/p.deb", data).tree_relative_path(&repo).unwrap(), data)
            .unwrap();

        let task = DownloadTask {
            artifact: artifact("pool/main/p.deb", data),
            repo,
        };
        let transport = Arc::new(FakeTransport::new());
        let config = Config::default();
        let scheduler = Scheduler::new(&config, transport).unwrap();

        let (outcomes, failures) = scheduler.run(&stager, vec![task]);
        assert!(failures.is_empty());
        assert!(outcomes[0].reused);
    }

    /// spec.md §8 property 1 (idempotence): once an artifact has been
    /// promoted into `mirror/` by an earlier run, `skel/` no longer holds a
    /// copy of it at all - the precondition check in `fetch_one` must still
    /// recognize it as already-present and issue zero HTTP requests.
    #[test]
    fn reuses_already_promoted_artifact_without_any_http_request() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));
        let repo = repo("http://deb.debian.org/debian");
        let data = b"already mirrored bytes";
        let relative = artifact("pool/main/p.deb", data).tree_relative_path(&repo).unwrap();
        stager.write_staged(&relative, data).unwrap();
        stager.promote(&relative).unwrap();
        assert!(!stager.has_staged(&relative));

        let task = DownloadTask {
            artifact: artifact("pool/main/p.deb", data),
            repo,
        };
        let transport = Arc::new(FakeTransport::new());
        let config = Config::default();
        let scheduler = Scheduler::new(&config, transport.clone()).unwrap();

        let (outcomes, failures) = scheduler.run(&stager, vec![task]);
        assert!(failures.is_empty());
        assert!(outcomes[0].reused);
        assert!(transport.calls().is_empty(), "no HTTP request should have been issued");
    }

    #[test]
    fn records_failure_without_stopping_other_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));
        let repo = repo("http://deb.debian.org/debian");
        let data = b"ok bytes";

        let tasks = vec![
            DownloadTask {
                artifact: artifact("pool/main/missing.deb", data),
                repo: repo.clone(),
            },
            DownloadTask {
                artifact: artifact("pool/main/present.deb", data),
                repo,
            },
        ];

        let transport = Arc::new(
            FakeTransport::new()
                .with_response("http://deb.debian.org/debian/pool/main/present.deb", data.to_vec()),
        );
        let mut config = Config::default();
        config.retry_attempts = 1;
        let scheduler = Scheduler::new(&config, transport).unwrap();

        let (outcomes, failures) = scheduler.run(&stager, tasks);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].relative_path, "deb.debian.org/debian/pool/main/missing.deb");
    }

    /// spec.md §4.C: a 401 must not be retried, unlike an ordinary 5xx/
    /// network failure - it costs exactly one attempt against the configured
    /// budget before the task is recorded as failed.
    #[test]
    fn unauthorized_response_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));
        let repo = repo("http://deb.debian.org/debian");
        let data = b"secret bytes";

        let task = DownloadTask {
            artifact: artifact("pool/main/locked.deb", data),
            repo,
        };
        let transport = Arc::new(
            FakeTransport::new().with_status("http://deb.debian.org/debian/pool/main/locked.deb", 401),
        );
        let mut config = Config::default();
        config.retry_attempts = 5;
        let scheduler = Scheduler::new(&config, transport.clone()).unwrap();

        let (outcomes, failures) = scheduler.run(&stager, vec![task]);
        assert!(outcomes.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(
            transport.calls().len(),
            1,
            "a 401 must fail on the first attempt, not exhaust the retry budget"
        );
    }

    /// spec.md §4.C point 1 / §7: a 416 range-reject (the staged partial no
    /// longer lines up with what the server has) must discard the partial
    /// and restart from zero rather than exhausting the retry budget stuck
    /// on the same unsatisfiable range.
    #[test]
    fn restarts_from_zero_after_range_reject() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));
        let repo = repo("http://deb.debian.org/debian");
        let data = b"the real full package bytes";

        // A stale .partial exactly as long as the real file: resuming from
        // its length asks for an empty remaining range, which the fake
        // transport (like a real server) answers with 416.
        let relative = artifact("pool/main/p.deb", data).tree_relative_path(&repo).unwrap();
        let partial_path = stager.partial_path(&relative);
        std::fs::create_dir_all(partial_path.parent().unwrap()).unwrap();
        std::fs::write(&partial_path, vec![0u8; data.len()]).unwrap();

        let task = DownloadTask {
            artifact: artifact("pool/main/p.deb", data),
            repo,
        };
        let transport = Arc::new(
            FakeTransport::new().with_response("http://deb.debian.org/debian/pool/main/p.deb", data.to_vec()),
        );
        let mut config = Config::default();
        config.retry_attempts = 2;
        config.retry_delay = 0.01;
        let scheduler = Scheduler::new(&config, transport).unwrap();

        let (outcomes, failures) = scheduler.run(&stager, vec![task]);
        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            std::fs::read(stager.staged_path(&relative)).unwrap(),
            data.to_vec()
        );
    }

    /// spec.md §3 invariant 3 / §5: a `.partial` left behind by an
    /// interrupted fetch is resumed from its actual on-disk length (a Range
    /// request for the remainder), not refetched from zero, and the
    /// assembled file matches the original exactly.
    #[test]
    fn resumes_an_interrupted_partial_from_its_on_disk_length() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("skel"), dir.path().join("mirror"));
        let repo = repo("http://deb.debian.org/debian");
        let data = b"the full contents of a large interrupted download";

        let relative = artifact("pool/main/p.deb", data).tree_relative_path(&repo).unwrap();
        let partial_path = stager.partial_path(&relative);
        std::fs::create_dir_all(partial_path.parent().unwrap()).unwrap();
        let already_fetched = &data[..10];
        std::fs::write(&partial_path, already_fetched).unwrap();

        let task = DownloadTask {
            artifact: artifact("pool/main/p.deb", data),
            repo,
        };
        let transport = Arc::new(
            FakeTransport::new().with_response("http://deb.debian.org/debian/pool/main/p.deb", data.to_vec()),
        );
        let config = Config::default();
        let scheduler = Scheduler::new(&config, transport.clone()).unwrap();

        let (outcomes, failures) = scheduler.run(&stager, vec![task]);
        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            transport.calls(),
            vec![(
                "http://deb.debian.org/debian/pool/main/p.deb".to_string(),
                Some(already_fetched.len() as u64)
            )]
        );
        assert_eq!(std::fs::read(stager.staged_path(&relative)).unwrap(), data.to_vec());
        assert!(!stager.partial_path(&relative).exists());
    }
}
