// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::warn;
use tray_sys::ProcessHandle;
use tray_types::{MountInfo, MountState};

/// One supervised mount
#[derive(Debug)]
pub struct MountEntry {
    pub remote: String,
    pub mount_point: PathBuf,
    pub state: MountState,
    pub launch_args: Vec<String>,
    /// `None` for mounts we found but cannot signal
    pub process: Option<Box<dyn ProcessHandle>>,
    pub owner_hint: Option<u32>,
    pub external: bool,
}

impl MountEntry {
    pub fn launched(
        remote: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        launch_args: Vec<String>,
        process: Box<dyn ProcessHandle>,
    ) -> Self {
        Self {
            remote: remote.into(),
            mount_point: mount_point.into(),
            state: MountState::Active,
            launch_args,
            process: Some(process),
            owner_hint: None,
            external: false,
        }
    }

    pub fn external(remote: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            mount_point: mount_point.into(),
            state: MountState::Active,
            launch_args: Vec::new(),
            process: None,
            owner_hint: None,
            external: true,
        }
    }

    pub fn info(&self) -> MountInfo {
        MountInfo {
            remote: self.remote.clone(),
            mount_point: self.mount_point.clone(),
            state: self.state.clone(),
            launch_args: self.launch_args.clone(),
            pid: self.process.as_ref().and_then(|process| process.pid()),
            owner_hint: self.owner_hint,
            external: self.external,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    mount_point: PathBuf,
    state: MountState,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, MountEntry>,
    in_flight: HashMap<String, InFlight>,
}

/// Remote name to its mount, plus the mounts currently being brought up
///
/// Holds at most one entry and at most one in-flight attempt per remote.
/// Entries are only ever inserted in the `Active` state.
#[derive(Debug, Default)]
pub struct MountRegistry {
    inner: Mutex<Inner>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the remote for a mount attempt. `None` if one is already running.
    pub fn begin(&self, remote: &str, mount_point: &Path) -> Option<MountAttempt<'_>> {
        let mut inner = self.lock();
        if inner.in_flight.contains_key(remote) {
            return None;
        }
        let cancel = CancellationToken::new();
        inner.in_flight.insert(
            remote.to_string(),
            InFlight {
                mount_point: mount_point.to_path_buf(),
                state: MountState::Starting,
                cancel: cancel.clone(),
            },
        );
        Some(MountAttempt {
            registry: self,
            remote: remote.to_string(),
            cancel,
        })
    }

    /// Cancel an in-flight attempt
    pub fn cancel(&self, remote: &str) -> bool {
        match self.lock().in_flight.get(remote) {
            Some(attempt) => {
                attempt.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let inner = self.lock();
        for attempt in inner.in_flight.values() {
            attempt.cancel.cancel();
        }
        inner.in_flight.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn get(&self, remote: &str) -> Option<MountInfo> {
        self.lock().entries.get(remote).map(MountEntry::info)
    }

    /// Insert, replacing (and returning) any previous entry for the remote
    pub fn insert(&self, entry: MountEntry) -> (MountInfo, Option<MountEntry>) {
        let info = entry.info();
        let previous = self.lock().entries.insert(entry.remote.clone(), entry);
        (info, previous)
    }

    pub fn take(&self, remote: &str) -> Option<MountEntry> {
        self.lock().entries.remove(remote)
    }

    pub fn set_state(&self, remote: &str, state: MountState) {
        if let Some(entry) = self.lock().entries.get_mut(remote) {
            entry.state = state;
        }
    }

    pub fn remotes(&self) -> Vec<String> {
        let mut remotes: Vec<String> = self.lock().entries.keys().cloned().collect();
        remotes.sort();
        remotes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Registered mounts followed by in-flight attempts, sorted by remote
    pub fn snapshot(&self) -> Vec<MountInfo> {
        let inner = self.lock();
        let mut infos: Vec<MountInfo> = inner.entries.values().map(MountEntry::info).collect();
        for (remote, attempt) in &inner.in_flight {
            if inner.entries.contains_key(remote) {
                continue;
            }
            infos.push(MountInfo {
                remote: remote.clone(),
                mount_point: attempt.mount_point.clone(),
                state: attempt.state.clone(),
                launch_args: Vec::new(),
                pid: None,
                owner_hint: None,
                external: false,
            });
        }
        infos.sort_by(|a, b| a.remote.cmp(&b.remote));
        infos
    }

    /// Swap in a freshly discovered set of entries, returning the old ones
    pub fn replace_all(&self, entries: Vec<MountEntry>) -> Vec<MountEntry> {
        let mut inner = self.lock();
        let old = std::mem::take(&mut inner.entries);
        for entry in entries {
            if let Some(previous) = inner.entries.insert(entry.remote.clone(), entry) {
                warn!("Duplicate mount entry for {} during rebuild", previous.remote);
            }
        }
        old.into_values().collect()
    }

    /// Remove every entry
    pub fn drain(&self) -> Vec<MountEntry> {
        self.lock().entries.drain().map(|(_, entry)| entry).collect()
    }
}

/// Exclusive claim on mounting one remote, released on drop
#[derive(Debug)]
pub struct MountAttempt<'a> {
    registry: &'a MountRegistry,
    remote: String,
    cancel: CancellationToken,
}

impl MountAttempt<'_> {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_state(&self, state: MountState) {
        if let Some(attempt) = self.registry.lock().in_flight.get_mut(&self.remote) {
            attempt.state = state;
        }
    }
}

impl Drop for MountAttempt<'_> {
    fn drop(&mut self) {
        self.registry.lock().in_flight.remove(&self.remote);
    }
}
