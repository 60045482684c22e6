//! Eviction.
//!
//! A trim lists the data directory once, works out which entries are the
//! oldest, and deletes them one by one (each under its own key lock) until
//! enough space has been freed. Broken entries found along the way are
//! removed as well.

use super::{Inspection, Shared};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use mediacache_storage::{EntryKey, EntryMeta, FileInfo, FileKind, now_millis};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::instrument;

/// Who asked for a trim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    /// Scheduled because the cache went over budget. Gives up after the
    /// configured time budget.
    Automatic,
    /// Requested explicitly. Runs to completion.
    Manual,
}

/// What a trim pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimReport {
    /// Files found in the data directory.
    pub scanned: usize,
    /// Entries deleted to free space.
    pub evicted: usize,
    /// Bytes of data files deleted, broken entries included.
    pub freed: u64,
    /// Broken entries and stray files deleted.
    pub removed_corrupt: usize,
    /// Entries left alone because somebody was using them.
    pub skipped_active: usize,
    /// Entries left alone because they were too new.
    pub skipped_young: usize,
    /// The time budget ran out before enough space was freed.
    pub stopped_early: bool,
    /// Size of the data files once the pass finished.
    pub size_after: u64,
}

#[derive(Default)]
pub(crate) struct TrimState {
    /// The automatic trim waiting (or running), if any.
    task: Mutex<Option<AbortHandle>>,
    running: AtomicBool,
    /// Only one pass at a time.
    gate: tokio::sync::Mutex<()>,
    last_finished: Mutex<Option<Instant>>,
}

impl TrimState {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Abort the automatic trim, whether it is still waiting or already
    /// running. Deletions already started finish in their own tasks.
    pub(crate) fn cancel_scheduled(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    fn remaining_interval(&self, interval: Duration) -> Duration {
        match *self.last_finished.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(finished) => interval.saturating_sub(finished.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn finished(&self) {
        *self.last_finished.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

/// Clears the running flag when dropped, including when the pass is aborted.
struct RunningFlag<'a>(&'a AtomicBool);
impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}
impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Candidate {
    key: EntryKey,
    meta: EntryMeta,
    size: u64,
}

enum Repaired {
    Healthy(Candidate),
    Removed(u64),
    Gone,
}

impl Shared {
    /// Start an automatic trim once the trim interval allows it, replacing
    /// any automatic trim still waiting.
    pub(crate) fn schedule_trim(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(cache = %self.name, "Cannot schedule trim outside of a runtime");
            return;
        };
        let mut task = self.trim.task.lock().unwrap_or_else(PoisonError::into_inner);
        if self.trim.is_running() {
            return;
        }
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let shared = self.clone();
        let delay = self.trim.remaining_interval(self.settings.trim_interval);
        tracing::debug!(cache = %self.name, ?delay, "Scheduling trim");
        let handle = runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            shared.trim(TrimMode::Automatic).await;
        });
        *task = Some(handle.abort_handle());
    }

    #[instrument(skip(self), fields(cache = %self.name))]
    pub(crate) async fn trim(self: &Arc<Self>, mode: TrimMode) -> TrimReport {
        let _gate = self.trim.gate.lock().await;
        // Declared after the gate so the flag drops first.
        let _running = RunningFlag::raise(&self.trim.running);
        let started = Instant::now();
        let mut report = TrimReport::default();
        if let Err(err) = self.trim_pass(mode, started, &mut report).await {
            tracing::warn!(error = %err, "Trim pass failed");
        }
        report.size_after = self.recompute_size().await;
        self.trim.finished();
        tracing::info!(
            evicted = report.evicted,
            freed = report.freed,
            removed_corrupt = report.removed_corrupt,
            size = report.size_after,
            budget = self.settings.budget,
            elapsed = ?started.elapsed(),
            stopped_early = report.stopped_early,
            "Trim finished",
        );
        report
    }

    async fn trim_pass(self: &Arc<Self>, mode: TrimMode, started: Instant, report: &mut TrimReport) -> Result<()> {
        let (files, active) = {
            let _global = self.locks.lock_global().await;
            let files = self.files.list().await.or_raise(|| ErrorKind::Storage)?;
            (files, self.locks.active_keys())
        };
        report.scanned = files.len();
        if files.len() < self.settings.min_trim_files {
            tracing::debug!(files = files.len(), min = self.settings.min_trim_files, "Too few files to trim");
            return Ok(());
        }
        let listed: u64 = files.iter().filter(|file| file.kind() == FileKind::Data).map(|file| file.size).sum();

        let mut candidates = self.collect_candidates(&files, &active, report).await;
        candidates.sort_by(|a, b| (a.meta.created_on, &a.key).cmp(&(b.meta.created_on, &b.key)));

        // Broken entries removed above no longer count against the budget.
        let current = listed.saturating_sub(report.freed);
        let to_free = self.settings.bytes_to_free(current);
        let min_age = i64::try_from(self.settings.min_lifetime.as_millis()).unwrap_or(i64::MAX);
        tracing::debug!(current, to_free, candidates = candidates.len(), "Trimming");
        let mut evicted_bytes = 0u64;
        for candidate in candidates {
            if evicted_bytes >= to_free {
                break;
            }
            if mode == TrimMode::Automatic && started.elapsed() >= self.settings.trim_time_budget {
                tracing::debug!(freed = report.freed, to_free, "Out of time");
                report.stopped_early = true;
                break;
            }
            if candidate.meta.age_millis(now_millis()) < min_age {
                report.skipped_young += 1;
                continue;
            }
            tracing::trace!(key = %candidate.key, size = candidate.size, created_on = candidate.meta.created_on, "Evicting");
            if let Some(freed) = self.evict(candidate.key, candidate.meta.created_on).await {
                report.evicted += 1;
                evicted_bytes = evicted_bytes.saturating_add(freed);
                report.freed = report.freed.saturating_add(freed);
            }
        }
        Ok(())
    }

    /// Turn the listing into eviction candidates, removing whatever can't be
    /// one.
    async fn collect_candidates(
        self: &Arc<Self>,
        files: &[FileInfo],
        active: &HashSet<EntryKey>,
        report: &mut TrimReport,
    ) -> Vec<Candidate> {
        let mut groups: BTreeMap<&str, Vec<&FileInfo>> = BTreeMap::new();
        for file in files {
            groups.entry(file.base_name()).or_default().push(file);
        }

        let mut candidates = Vec::with_capacity(groups.len());
        for (base, group) in groups {
            let Some(key) = EntryKey::from_file_name(base).ok().filter(|key| key.as_str() == base) else {
                report.freed = report.freed.saturating_add(self.remove_strays(&group).await);
                report.removed_corrupt += 1;
                continue;
            };
            if active.contains(&key) {
                report.skipped_active += 1;
                continue;
            }
            let data = group.iter().find(|file| file.kind() == FileKind::Data);
            let meta = group.iter().find(|file| file.kind() == FileKind::Meta);
            let (Some(data), Some(meta), 2) = (data, meta, group.len()) else {
                candidates.extend(self.repair(key, report).await);
                continue;
            };
            match self.files.read_meta(&meta.name).await {
                Ok(entry) => candidates.push(Candidate { key, meta: entry, size: data.size }),
                Err(err) => {
                    tracing::debug!(key = %key, error = %err, "Unreadable metadata");
                    candidates.extend(self.repair(key, report).await);
                },
            }
        }
        candidates
    }

    /// Files whose name isn't derived from a key belong to nobody; no lock
    /// protects them.
    async fn remove_strays(&self, group: &[&FileInfo]) -> u64 {
        let mut freed = 0;
        for file in group {
            match self.files.remove(&file.name).await {
                Ok(_) => {
                    tracing::debug!(file = %file.name, "Removed stray file");
                    if file.kind() == FileKind::Data {
                        freed += file.size;
                    }
                },
                Err(err) => tracing::warn!(file = %file.name, error = %err, "Failed to remove stray file"),
            }
        }
        freed
    }

    /// Re-examine a suspicious entry under its lock: drop leftover files
    /// (such as an interrupted metadata write), then delete the entry if
    /// what remains is still broken. An entry that turns out fine is
    /// returned so it can still be evicted in order.
    async fn repair(self: &Arc<Self>, key: EntryKey, report: &mut TrimReport) -> Option<Candidate> {
        let shared = self.clone();
        let task = tokio::spawn(async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            let leftovers = shared
                .files
                .list()
                .await
                .map(|files| {
                    files
                        .into_iter()
                        .filter(|file| file.base_name() == key.as_str() && file.kind() == FileKind::Unknown)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            for file in &leftovers {
                if let Err(err) = shared.files.remove(&file.name).await {
                    tracing::debug!(file = %file.name, error = %err, "Failed to remove leftover file");
                }
            }
            match shared.inspect(&key).await {
                Ok(Inspection::Absent) => Repaired::Gone,
                Ok(Inspection::InProgress(meta) | Inspection::Downloaded(meta)) => {
                    let size = shared.files.len(&key.data_file_name()).await.ok().flatten().unwrap_or(0);
                    Repaired::Healthy(Candidate { key, meta, size })
                },
                Err(err) => {
                    tracing::info!(key = %key, error = %err, "Deleting corrupt cache entry");
                    let length = shared.files.len(&key.data_file_name()).await.ok().flatten().unwrap_or(0);
                    shared.delete_locked(&key).await;
                    Repaired::Removed(length)
                },
            }
        });
        match task.await {
            Ok(Repaired::Healthy(candidate)) => Some(candidate),
            Ok(Repaired::Removed(freed)) => {
                report.removed_corrupt += 1;
                report.freed = report.freed.saturating_add(freed);
                None
            },
            Ok(Repaired::Gone) => None,
            Err(err) => {
                tracing::error!(error = %err, "Repair task failed");
                None
            },
        }
    }

    /// Delete one entry, unless it was recreated since the listing. Returns
    /// the bytes freed.
    async fn evict(self: &Arc<Self>, key: EntryKey, created_on: i64) -> Option<u64> {
        let shared = self.clone();
        let task = tokio::spawn(async move {
            let _guard = shared.locks.lock_local(key.clone()).await;
            match shared.files.read_meta(&key.meta_file_name()).await {
                Ok(meta) if meta.created_on == created_on => {},
                Ok(_) => {
                    tracing::debug!(key = %key, "Entry was recreated since listing; keeping it");
                    return None;
                },
                Err(err) if err.is_not_found() => return None,
                // Broken now; deleting it is right either way.
                Err(_) => {},
            }
            let length = shared.files.len(&key.data_file_name()).await.ok().flatten().unwrap_or(0);
            shared.delete_locked(&key).await.then_some(length)
        });
        match task.await {
            Ok(freed) => freed,
            Err(err) => {
                tracing::error!(error = %err, "Eviction task failed");
                None
            },
        }
    }
}
