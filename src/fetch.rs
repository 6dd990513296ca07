//! Fetch worker: download, verify, and record remote observation files.
//!
//! Each sweep walks the calendar window from the resume point, re-queues
//! any outstanding partial downloads, and downloads candidates with
//! bounded parallelism. A file only becomes a File row after the full
//! stream has been received, verified, and atomically renamed into place;
//! every failure path lands in the partial-downloads table instead.

use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::assemble::Assembler;
use crate::config::Settings;
use crate::error::PipelineResult;
use crate::filename::ParsedFilename;
use crate::remote::walker::{Candidate, RemoteWalker};
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::state::{FileRecord, PartialDownload, StateStore};
use crate::supervisor::Heartbeat;

pub struct Fetcher {
    settings: Arc<Settings>,
    store: Arc<StateStore>,
    remote: Arc<dyn RemoteStore>,
    walker: RemoteWalker,
    assembler: Assembler,
    shutdown: watch::Receiver<bool>,
    drained: mpsc::Sender<()>,
    heartbeat: Heartbeat,
}

impl Fetcher {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<StateStore>,
        remote: Arc<dyn RemoteStore>,
        shutdown: watch::Receiver<bool>,
        drained: mpsc::Sender<()>,
        heartbeat: Heartbeat,
    ) -> Self {
        let walker = RemoteWalker::new(
            remote.clone(),
            &settings.connection.base_path,
            &settings.radar.name,
            &settings.radar.extension,
            settings.volumes.clone(),
        );
        let assembler = Assembler::new(store.clone(), settings.volumes.clone());
        Self {
            settings,
            store,
            remote,
            walker,
            assembler,
            shutdown,
            drained,
            heartbeat,
        }
    }

    /// Worker loop: sweep, report drain once the window is exhausted, sleep,
    /// repeat until the draining flag is raised.
    pub async fn run(mut self) {
        info!(radar = %self.settings.radar.name, "Starting fetch worker");
        let mut drained_signalled = false;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.sweep().await {
                Ok(()) => {
                    if !drained_signalled {
                        match self.window_drained() {
                            Ok(true) => {
                                info!("Calendar window exhausted with no outstanding partials");
                                let _ = self.drained.send(()).await;
                                drained_signalled = true;
                            }
                            Ok(false) => {}
                            Err(e) => warn!(error = %e, "Could not evaluate window state"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Fetch sweep failed, will retry"),
            }
            self.heartbeat.touch();

            tokio::select! {
                _ = tokio::time::sleep(self.settings.tuning.poll_interval()) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!("Fetch worker stopped");
    }

    /// One traversal cycle: walk the window, download what is missing.
    pub async fn sweep(&self) -> PipelineResult<()> {
        let start = self.settings.start_instant();
        let resume = match self.store.latest_observation_instant(&self.settings.radar.name)? {
            Some(latest) => latest.max(start),
            None => start,
        };

        let mut candidates = self
            .walker
            .collect_candidates(resume, self.settings.window.end_instant)
            .await?;

        // Partials may sit behind the resume point (a sibling file with a
        // later instant completed); re-queue them explicitly.
        let walked: HashSet<String> = candidates
            .iter()
            .map(|c| c.parsed.filename())
            .collect();
        for partial in self.store.pending_partials()? {
            if walked.contains(&partial.filename) {
                continue;
            }
            match ParsedFilename::parse(&partial.filename) {
                Ok(parsed) => candidates.push(Candidate {
                    remote_path: partial.remote_path.clone(),
                    parsed,
                }),
                Err(_) => warn!(filename = %partial.filename, "Partial row with unparseable name"),
            }
        }

        if candidates.is_empty() {
            debug!("No new files");
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.tuning.max_concurrent_downloads));
        let mut tasks = JoinSet::new();
        let mut queued = 0usize;
        for candidate in candidates {
            if *self.shutdown.borrow() {
                break;
            }
            if self.store.is_file_completed(&candidate.parsed.filename())? {
                continue;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let remote = self.remote.clone();
            let assembler = self.assembler.clone();
            let settings = self.settings.clone();
            queued += 1;
            tasks.spawn(async move {
                let _permit = permit;
                fetch_one(store, remote, assembler, settings, candidate).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Download task aborted");
            }
        }
        if queued > 0 {
            info!(queued, "Fetch sweep processed candidates");
        }
        Ok(())
    }

    /// True once the configured window is behind us and nothing is pending
    /// retry. Only meaningful when an end instant is configured.
    fn window_drained(&self) -> PipelineResult<bool> {
        let Some(end) = self.settings.window.end_instant else {
            return Ok(false);
        };
        Ok(Utc::now() >= end && self.store.pending_partial_count()? == 0)
    }
}

/// Download one candidate: stream to a `.part` temp path, verify, rename,
/// record, and feed the assembler. Transient failures retry in-sweep with
/// backoff; exhausted budgets land in the partial table for the next sweep.
async fn fetch_one(
    store: Arc<StateStore>,
    remote: Arc<dyn RemoteStore>,
    assembler: Assembler,
    settings: Arc<Settings>,
    candidate: Candidate,
) {
    let filename = candidate.parsed.filename();
    let final_path = candidate.parsed.local_path(&settings.directories.raw_root);
    let tmp_path = final_path.with_file_name(format!("{filename}.part"));
    let policy = RetryPolicy::new(
        settings.tuning.download_max_retries,
        std::time::Duration::from_millis(settings.tuning.download_base_delay_ms),
        std::time::Duration::from_millis(settings.tuning.download_max_delay_ms),
    );

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match remote.download(&candidate.remote_path, &tmp_path).await {
            Ok(fetched) => {
                if settings.tuning.verify_checksums {
                    if let Some(expected) = fetched.reported_size {
                        if expected != fetched.bytes {
                            warn!(
                                filename = %filename,
                                expected,
                                received = fetched.bytes,
                                attempt,
                                "Truncated transfer"
                            );
                            if policy.should_retry(attempt) {
                                tokio::time::sleep(policy.delay_for(attempt)).await;
                                continue;
                            }
                            give_up(&store, &settings, &candidate, &tmp_path, &final_path).await;
                            return;
                        }
                    }
                }

                let record = FileRecord {
                    filename: filename.clone(),
                    remote_path: candidate.remote_path.clone(),
                    local_path: final_path.clone(),
                    size: fetched.bytes,
                    digest: Some(fetched.digest.clone()),
                    radar: candidate.parsed.radar.clone(),
                    field: candidate.parsed.field.clone(),
                    vol_code: candidate.parsed.vol_code.clone(),
                    vol_num: candidate.parsed.vol_num.clone(),
                    observation_instant: candidate.parsed.instant,
                };
                if let Err(e) = finalize(&store, &assembler, &candidate, &tmp_path, &final_path, record)
                {
                    warn!(filename = %filename, error = %e, "Failed to finalize download");
                    give_up(&store, &settings, &candidate, &tmp_path, &final_path).await;
                    return;
                }
                info!(filename = %filename, bytes = fetched.bytes, "Downloaded");
                return;
            }
            Err(e) if e.is_not_found() => {
                // listed by the walker but gone by fetch time; the next
                // traversal cycle decides whether it reappears
                warn!(filename = %filename, "File listed but absent when fetched");
                let _ = std::fs::remove_file(&tmp_path);
                return;
            }
            Err(e) => {
                warn!(filename = %filename, attempt, error = %e, "Download failed");
                if policy.should_retry(attempt) {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    continue;
                }
                give_up(&store, &settings, &candidate, &tmp_path, &final_path).await;
                return;
            }
        }
    }
}

/// Atomic completion: rename the temp file into place, then commit the
/// File row and volume membership. The rename happens first so a crash
/// between the two steps leaves a re-downloadable file, never a row
/// pointing at nothing.
fn finalize(
    store: &StateStore,
    assembler: &Assembler,
    candidate: &Candidate,
    tmp_path: &PathBuf,
    final_path: &PathBuf,
    record: FileRecord,
) -> PipelineResult<()> {
    if let Some(parent) = final_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(tmp_path, final_path)?;
    store.record_completed_file(&record)?;
    assembler.on_file_recorded(&candidate.parsed)?;
    Ok(())
}

/// Record the exhausted attempt in the partial table for the next sweep.
async fn give_up(
    store: &StateStore,
    settings: &Settings,
    candidate: &Candidate,
    tmp_path: &PathBuf,
    final_path: &PathBuf,
) {
    let filename = candidate.parsed.filename();
    let bytes_downloaded = std::fs::metadata(tmp_path).map(|m| m.len()).unwrap_or(0);
    let attempts = store.partial_attempts(&filename).unwrap_or(0) + 1;
    let partial = PartialDownload {
        filename: filename.clone(),
        remote_path: candidate.remote_path.clone(),
        local_path: final_path.clone(),
        bytes_downloaded,
        total_bytes: None,
        attempt_count: attempts,
        last_attempt: Utc::now(),
    };
    if let Err(e) = store.record_partial(&partial) {
        warn!(filename = %filename, error = %e, "Failed to record partial download");
    }
    if !settings.tuning.resume_partial {
        let _ = std::fs::remove_file(tmp_path);
    }
}
