//! Registry of supervised process trees.
//!
//! One record per admitted run, inserted when the pipeline spawns and
//! removed during structured cleanup. The snapshot feeds diagnostics and
//! lets the startup path see how many trees a crashed predecessor left
//! unaccounted for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::proc;

/// One supervised process tree.
#[derive(Debug, Clone)]
pub struct ActiveProcessRecord {
    /// Root pid of the tree.
    pub pid: u32,
    /// The run this tree belongs to.
    pub run_id: Uuid,
    /// Sandbox hosting the tree.
    pub sandbox_id: Uuid,
    /// When the tree was spawned.
    pub started_at: DateTime<Utc>,
    /// Memory ceiling the monitor enforces, in MB.
    pub memory_limit_mb: u64,
    /// CPU ceiling the monitor enforces, in percent.
    pub cpu_limit_percent: u32,
}

/// Thread-safe registry of active process trees.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    records: Mutex<HashMap<u32, ActiveProcessRecord>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, keyed by root pid.
    pub fn register(&self, record: ActiveProcessRecord) {
        self.records.lock().unwrap().insert(record.pid, record);
    }

    /// Remove a record. Returns it when present.
    pub fn deregister(&self, pid: u32) -> Option<ActiveProcessRecord> {
        self.records.lock().unwrap().remove(&pid)
    }

    /// Number of active trees.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether no trees are registered.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Snapshot of all records, for diagnostics.
    pub fn snapshot(&self) -> Vec<ActiveProcessRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// Start the background reaper over this registry.
    ///
    /// The reaper is a backstop behind the per-run supervisors: it drops
    /// records whose pid has already exited, and hard-kills any tree that
    /// somehow outlived the wall-clock ceiling plus slack. The handle stops
    /// the loop on drop.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        wall_clock_ceiling: Duration,
    ) -> ReaperHandle {
        let registry = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => registry.reap_once(wall_clock_ceiling),
                }
            }
        });
        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// One reaper pass. Split out for testing.
    fn reap_once(&self, wall_clock_ceiling: Duration) {
        let now = Utc::now();
        for record in self.snapshot() {
            if proc::sample_process(record.pid).is_none() {
                debug!(
                    pid = record.pid,
                    run_id = %record.run_id,
                    "Reaping record for exited process"
                );
                self.deregister(record.pid);
                continue;
            }

            let age = (now - record.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > wall_clock_ceiling {
                // Its supervisor should have killed it long ago.
                warn!(
                    pid = record.pid,
                    run_id = %record.run_id,
                    age_secs = age.as_secs(),
                    "Process tree outlived its ceiling, force-killing"
                );
                let _ = killpg(Pid::from_raw(record.pid as i32), Signal::SIGKILL);
                self.deregister(record.pid);
            }
        }
    }
}

/// Running reaper task; stops on drop.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.join.abort();
    }
}
