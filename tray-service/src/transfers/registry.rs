// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;
use tray_sys::{LineBuffer, ProcessHandle, parse_stats_line};
use tray_types::{TransferInfo, TransferKind, TransferStatus};

/// One copy or sync job and the process running it
#[derive(Debug)]
pub struct TransferJob {
    pub info: TransferInfo,
    pub process: Option<Box<dyn ProcessHandle>>,
    lines: LineBuffer,
}

impl TransferJob {
    pub fn new(info: TransferInfo, process: Box<dyn ProcessHandle>) -> Self {
        Self {
            info,
            process: Some(process),
            lines: LineBuffer::new(),
        }
    }

    /// Feed raw output; stats lines update progress, anything else is ignored
    pub fn feed(&mut self, chunk: &[u8]) {
        for line in self.lines.push(chunk) {
            self.apply_line(&line);
        }
    }

    fn apply_line(&mut self, line: &str) {
        let Some(progress) = parse_stats_line(line) else {
            return;
        };
        self.info.apply_progress(&progress);
        if self.info.status == TransferStatus::Starting {
            self.info.status = TransferStatus::Running;
        }
    }

    /// Pull whatever the process produced and reap it if it exited.
    /// Returns true once the job reaches a terminal state in this call.
    pub fn poll(&mut self) -> bool {
        if self.info.status.is_terminal() {
            return false;
        }
        let Some(process) = self.process.as_mut() else {
            return false;
        };

        let running = process.is_running();
        let chunk = process.read_output_chunk();
        let exit_code = if running { None } else { process.exit_status() };
        self.feed(&chunk);

        if running {
            if self.info.status == TransferStatus::Starting {
                self.info.status = TransferStatus::Running;
            }
            return false;
        }

        // The output pumps may still hold the tail end
        if let Some(mut process) = self.process.take() {
            let tail = process.read_output_chunk();
            self.feed(&tail);
        }
        if let Some(line) = self.lines.finish() {
            self.apply_line(&line);
        }

        self.finish(exit_code);
        true
    }

    fn finish(&mut self, exit_code: Option<i32>) {
        self.info.exit_code = exit_code;
        self.info.finished_at = Some(Utc::now());
        if exit_code == Some(0) {
            self.info.status = TransferStatus::Completed;
            self.info.progress_percent = 100;
        } else {
            self.info.status = TransferStatus::Failed;
        }
        debug!(job = %self.info.id, status = %self.info.status, "Transfer finished");
    }

    /// Overrides any previous state, terminal or not
    pub fn mark_cancelled(&mut self) {
        self.info.status = TransferStatus::Cancelled;
        if self.info.finished_at.is_none() {
            self.info.finished_at = Some(Utc::now());
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<u64, TransferJob>,
    next_seq: u64,
    next_key: u64,
}

/// Transfer id to job, in creation order
///
/// Ids come from a counter advanced under the registry lock, so concurrent
/// starts with the same source and destination still get distinct ids.
/// Terminal jobs beyond `history_limit` are dropped oldest first.
#[derive(Debug)]
pub struct TransferRegistry {
    inner: Mutex<Inner>,
    history_limit: usize,
}

impl TransferRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `<kind>-<source>-<dest>-<seq>`
    pub fn reserve_id(&self, kind: TransferKind, source: &str, dest: &str) -> String {
        let mut inner = self.lock();
        inner.next_seq += 1;
        format!("{}-{}-{}-{}", kind, source, dest, inner.next_seq)
    }

    pub fn insert(&self, job: TransferJob) -> TransferInfo {
        let info = job.info.clone();
        let mut inner = self.lock();
        inner.next_key += 1;
        let key = inner.next_key;
        inner.jobs.insert(key, job);
        info
    }

    pub fn get(&self, id: &str) -> Option<TransferInfo> {
        self.lock()
            .jobs
            .values()
            .find(|job| job.info.id == id)
            .map(|job| job.info.clone())
    }

    pub fn list(&self) -> Vec<TransferInfo> {
        self.lock().jobs.values().map(|job| job.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Poll every live job, returning the ones that just finished
    pub fn poll(&self) -> Vec<TransferInfo> {
        let mut inner = self.lock();
        let finished: Vec<TransferInfo> = inner
            .jobs
            .values_mut()
            .filter_map(|job| job.poll().then(|| job.info.clone()))
            .collect();
        if !finished.is_empty() {
            prune(&mut inner.jobs, self.history_limit);
        }
        finished
    }

    /// Detach the job's process so it can be stopped without the lock held.
    /// `None` for an unknown id.
    pub fn take_process(&self, id: &str) -> Option<Option<Box<dyn ProcessHandle>>> {
        self.lock()
            .jobs
            .values_mut()
            .find(|job| job.info.id == id)
            .map(|job| job.process.take())
    }

    pub fn mark_cancelled(&self, id: &str) -> Option<TransferInfo> {
        let mut inner = self.lock();
        let info = inner
            .jobs
            .values_mut()
            .find(|job| job.info.id == id)
            .map(|job| {
                job.mark_cancelled();
                job.info.clone()
            });
        prune(&mut inner.jobs, self.history_limit);
        info
    }

    /// Send `line` to every running job, returning how many accepted it
    pub fn broadcast_running(&self, line: &str) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        for job in inner.jobs.values_mut() {
            if job.info.status != TransferStatus::Running {
                continue;
            }
            let Some(process) = job.process.as_mut() else {
                continue;
            };
            match process.write_input(line) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(job = %job.info.id, "Could not update transfer: {}", e),
            }
        }
        delivered
    }

    /// Drop every terminal job, returning how many went
    pub fn clear_finished(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| !job.info.status.is_terminal());
        before - inner.jobs.len()
    }

    /// Remove every job
    pub fn drain(&self) -> Vec<TransferJob> {
        std::mem::take(&mut self.lock().jobs).into_values().collect()
    }
}

fn prune(jobs: &mut BTreeMap<u64, TransferJob>, limit: usize) {
    let terminal: Vec<u64> = jobs
        .iter()
        .filter(|(_, job)| job.info.status.is_terminal())
        .map(|(key, _)| *key)
        .collect();
    if terminal.len() <= limit {
        return;
    }
    for key in &terminal[..terminal.len() - limit] {
        jobs.remove(key);
    }
}
