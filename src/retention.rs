//! Enforces age / count / disk-usage caps over snapshots, both inline
//! after every `create_snapshot` and periodically on a cancellable
//! background worker. Also runs the orphan-blob mark-and-sweep GC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::config::RewindConfig;
use crate::engine::SnapshotEngine;
use crate::errors::Result;
use crate::model::TimelineFilters;
use crate::utils::dir_size_bytes;

#[derive(Debug, Clone, Default)]
pub struct RetentionStats {
    pub total_snapshots: u64,
    pub max_snapshots: u32,
    pub current_disk_usage_mb: f64,
    pub max_disk_usage_mb: u64,
    pub oldest_timestamp: Option<chrono::DateTime<Utc>>,
    pub newest_timestamp: Option<chrono::DateTime<Utc>>,
}

struct StopSignal {
    stopped: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn wait_timeout(&self, timeout: Duration) {
        let guard = self.mutex.lock().unwrap();
        let _ = self.condvar.wait_timeout(guard, timeout);
    }
}

pub struct RetentionController {
    reserved_dir: std::path::PathBuf,
    stop: Arc<StopSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

const BACKGROUND_PERIOD: Duration = Duration::from_secs(5 * 60);

impl RetentionController {
    pub fn new(reserved_dir: std::path::PathBuf) -> Self {
        Self {
            reserved_dir,
            stop: Arc::new(StopSignal::new()),
            worker: Mutex::new(None),
        }
    }

    /// Run age → count → disk enforcement once, then the orphan sweep.
    /// Called after every successful `create_snapshot`, and from the
    /// background worker on its interval tick.
    #[instrument(skip(self, engine))]
    pub fn enforce(&self, engine: &SnapshotEngine, config: &RewindConfig) -> Result<RetentionStats> {
        self.enforce_age(engine, config)?;
        self.enforce_count(engine, config)?;
        self.enforce_disk(engine, config)?;
        self.reclaim_orphans(engine)?;
        self.stats(engine, config)
    }

    /// Convenience entry point called right after a snapshot is
    /// created; clears the engine's incremental baseline if the sweep
    /// happened to delete the snapshot just written.
    pub fn enforce_after_snapshot(
        &self,
        engine: &SnapshotEngine,
        config: &RewindConfig,
        just_created: &str,
    ) -> Result<()> {
        self.enforce(engine, config)?;
        engine.reset_baseline_if(just_created);
        Ok(())
    }

    fn enforce_age(&self, engine: &SnapshotEngine, config: &RewindConfig) -> Result<()> {
        if config.storage.cleanup_after_days == 0 {
            return Ok(());
        }
        let cutoff = Utc::now() - chrono::Duration::days(config.storage.cleanup_after_days as i64);
        let snapshots = engine.list_snapshots(&TimelineFilters::default())?;
        for snapshot in snapshots {
            if snapshot.timestamp < cutoff {
                debug!(id = %snapshot.id, "retention: deleting aged-out snapshot");
                engine.delete_snapshot(&snapshot.id)?;
            }
        }
        Ok(())
    }

    fn enforce_count(&self, engine: &SnapshotEngine, config: &RewindConfig) -> Result<()> {
        let mut snapshots = engine.list_snapshots(&TimelineFilters::default())?;
        // newest-first already; drop everything past the cap.
        if snapshots.len() as u32 <= config.storage.max_snapshots {
            return Ok(());
        }
        let keep = config.storage.max_snapshots as usize;
        let overflow = snapshots.split_off(keep);
        for snapshot in overflow {
            debug!(id = %snapshot.id, "retention: deleting over-count snapshot");
            engine.delete_snapshot(&snapshot.id)?;
        }
        Ok(())
    }

    fn enforce_disk(&self, engine: &SnapshotEngine, config: &RewindConfig) -> Result<()> {
        let limit = config.max_disk_usage_bytes();
        loop {
            let used = dir_size_bytes(&self.reserved_dir)?;
            if used <= limit {
                return Ok(());
            }
            let mut snapshots = engine.list_snapshots(&TimelineFilters::default())?;
            let Some(oldest) = snapshots.pop() else {
                return Ok(());
            };
            debug!(id = %oldest.id, used, limit, "retention: deleting snapshot to satisfy disk cap");
            engine.delete_snapshot(&oldest.id)?;
        }
    }

    /// Collect every hash referenced by any manifest, then delete any
    /// blob in the content store that is not in that set. Skips a blob
    /// whose temp-file sibling is present (mid-write).
    #[instrument(skip(self, engine))]
    pub fn reclaim_orphans(&self, engine: &SnapshotEngine) -> Result<u64> {
        let snapshots = engine.list_snapshots(&TimelineFilters::default())?;
        let referenced = DashSet::new();
        snapshots.par_iter().for_each(|snapshot| {
            if let Ok(Some(full)) = engine.get_snapshot(&snapshot.id) {
                for state in full.file_states.values() {
                    if let Some(hash) = state.content_hash {
                        referenced.insert(hash);
                    }
                }
            }
        });

        let all_blobs = engine.content_store().iter_blobs()?;
        let removed: u64 = all_blobs
            .into_par_iter()
            .map(|hash| {
                if referenced.contains(&hash) {
                    return 0;
                }
                match engine.content_store().delete(&hash) {
                    Ok(true) => 1,
                    _ => 0,
                }
            })
            .sum();
        if removed > 0 {
            info!(removed, "orphan sweep reclaimed blobs");
        }
        Ok(removed)
    }

    pub fn stats(&self, engine: &SnapshotEngine, config: &RewindConfig) -> Result<RetentionStats> {
        let snapshots = engine.list_snapshots(&TimelineFilters::default())?;
        let used = dir_size_bytes(&self.reserved_dir)?;
        Ok(RetentionStats {
            total_snapshots: snapshots.len() as u64,
            max_snapshots: config.storage.max_snapshots,
            current_disk_usage_mb: used as f64 / (1024.0 * 1024.0),
            max_disk_usage_mb: config.storage.max_disk_usage_mb,
            oldest_timestamp: snapshots.last().map(|s| s.timestamp),
            newest_timestamp: snapshots.first().map(|s| s.timestamp),
        })
    }

    /// Spawn the background worker. Joined cleanly by `stop`. Only one
    /// worker may run per controller.
    pub fn start_background(self: &Arc<Self>, engine: Arc<SnapshotEngine>, config: RewindConfig) {
        let mut guard = self.worker.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let controller = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while !controller.stop.is_stopped() {
                controller.stop.wait_timeout(BACKGROUND_PERIOD);
                if controller.stop.is_stopped() {
                    break;
                }
                if let Err(e) = controller.enforce(&engine, &config) {
                    warn!(error = %e, "background retention sweep failed");
                }
            }
        });
        *guard = Some(handle);
    }

    /// Signal the background worker to stop and join it.
    pub fn stop(&self) {
        self.stop.signal();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetentionController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_wakes_waiter() {
        let signal = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            waiter.wait_timeout(Duration::from_secs(30));
            waiter.is_stopped()
        });
        std::thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(handle.join().unwrap());
    }
}
