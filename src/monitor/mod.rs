//! Per-run resource monitoring.
//!
//! Each admitted run gets one sampling task that observes the supervised
//! workload at a fixed cadence, tracks peak usage, and reports limit
//! breaches over a channel so the supervisor can terminate the run. Host
//! process trees are polled over `/proc`; container-backed runs are sampled
//! through the runtime's cgroup accounting, since their processes are not
//! descendants of the gateway. Enforcement is cooperative: the monitor
//! never signals processes itself, it only observes and reports.

mod container;
mod proc;
mod registry;

pub use container::{sample_container, ContainerSample};
pub use proc::{clock_ticks_per_second, sample_tree, TreeSample};
pub use registry::{ActiveProcessRecord, ProcessRegistry, ReaperHandle};

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::MonitorConfig;

/// A resource limit the supervised tree has crossed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceBreach {
    /// Resident memory of the tree exceeded its ceiling.
    Memory {
        /// Observed resident memory in MB.
        used_mb: u64,
        /// Configured ceiling in MB.
        limit_mb: u64,
    },
    /// CPU usage of the tree exceeded its ceiling.
    Cpu {
        /// Observed usage in percent of one core.
        used_percent: f64,
        /// Configured ceiling in percent of one core.
        limit_percent: u32,
    },
}

impl ResourceBreach {
    /// Short label for audit events and metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Cpu { .. } => "cpu",
        }
    }
}

impl std::fmt::Display for ResourceBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory { used_mb, limit_mb } => {
                write!(f, "memory {}MB exceeded limit {}MB", used_mb, limit_mb)
            }
            Self::Cpu {
                used_percent,
                limit_percent,
            } => write!(
                f,
                "cpu {:.1}% exceeded limit {}%",
                used_percent, limit_percent
            ),
        }
    }
}

/// Peak usage observed over one supervised run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsageSummary {
    /// Highest resident memory seen, in MB.
    pub peak_memory_mb: u64,
    /// Highest CPU usage seen, in percent of one core.
    pub peak_cpu_percent: f64,
    /// Largest number of live processes in the tree.
    pub max_process_count: usize,
    /// Number of samples taken.
    pub samples: u64,
}

/// What a sampling task observes.
#[derive(Debug, Clone)]
pub enum MonitorTarget {
    /// A host process tree rooted at `pid`.
    Tree {
        /// Root pid of the tree.
        pid: u32,
    },
    /// A container, accounted by the container runtime.
    Container {
        /// Container name.
        name: String,
    },
}

/// A running sampling task.
///
/// Dropping the task without calling [`stop`](MonitorTask::stop) aborts the
/// sampler; the summary is then lost but nothing leaks.
pub struct MonitorTask {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<ResourceUsageSummary>,
}

impl MonitorTask {
    /// Stop sampling and return the usage summary.
    pub async fn stop(self) -> ResourceUsageSummary {
        let _ = self.shutdown.send(true);
        self.join.await.unwrap_or_else(|e| {
            warn!("Monitor task panicked: {}", e);
            ResourceUsageSummary::default()
        })
    }
}

/// Spawns sampling tasks for supervised process trees.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    config: MonitorConfig,
}

impl ResourceMonitor {
    /// Create a monitor with the given thresholds.
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Start sampling a target.
    ///
    /// Breaches arrive on the returned receiver. When monitoring is disabled
    /// in configuration the receiver never fires and the task idles until
    /// stopped.
    pub fn start(&self, target: MonitorTarget) -> (MonitorTask, mpsc::Receiver<ResourceBreach>) {
        let (breach_tx, breach_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();

        let join = tokio::spawn(async move {
            if !config.enable_resource_monitoring {
                idle_until_shutdown(shutdown_rx).await
            } else {
                match target {
                    MonitorTarget::Tree { pid } => {
                        sample_loop(pid, config, breach_tx, shutdown_rx).await
                    }
                    MonitorTarget::Container { name } => {
                        container_sample_loop(name, config, breach_tx, shutdown_rx).await
                    }
                }
            }
        });

        (
            MonitorTask {
                shutdown: shutdown_tx,
                join,
            },
            breach_rx,
        )
    }
}

async fn idle_until_shutdown(mut shutdown: watch::Receiver<bool>) -> ResourceUsageSummary {
    let _ = shutdown.changed().await;
    ResourceUsageSummary::default()
}

async fn sample_loop(
    pid: u32,
    config: MonitorConfig,
    breach_tx: mpsc::Sender<ResourceBreach>,
    mut shutdown: watch::Receiver<bool>,
) -> ResourceUsageSummary {
    let mut summary = ResourceUsageSummary::default();
    let ticks_per_second = clock_ticks_per_second() as f64;
    let mut baseline: Option<(u64, Instant)> = None;

    let mut interval = tokio::time::interval(config.sample_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately and only establishes the baseline.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let Some(tree) = sample_tree(pid) else {
            debug!("Process tree {} gone, monitor finishing", pid);
            break;
        };

        summary.samples += 1;
        let rss_mb = tree.rss_kb / 1024;
        summary.peak_memory_mb = summary.peak_memory_mb.max(rss_mb);
        summary.max_process_count = summary.max_process_count.max(tree.process_count);

        let now = Instant::now();
        if let Some((prev_ticks, prev_at)) = baseline {
            let elapsed = now.duration_since(prev_at).as_secs_f64();
            if elapsed > 0.0 {
                let delta = tree.cpu_ticks.saturating_sub(prev_ticks) as f64;
                let cpu_percent = delta / ticks_per_second / elapsed * 100.0;
                if cpu_percent > summary.peak_cpu_percent {
                    summary.peak_cpu_percent = cpu_percent;
                }
                trace!(
                    pid,
                    rss_mb,
                    cpu_percent,
                    processes = tree.process_count,
                    "resource sample"
                );
                if cpu_percent > f64::from(config.max_cpu_percent) {
                    report(
                        &breach_tx,
                        ResourceBreach::Cpu {
                            used_percent: cpu_percent,
                            limit_percent: config.max_cpu_percent,
                        },
                    );
                }
            }
        }
        baseline = Some((tree.cpu_ticks, now));

        if rss_mb > config.max_memory_mb {
            report(
                &breach_tx,
                ResourceBreach::Memory {
                    used_mb: rss_mb,
                    limit_mb: config.max_memory_mb,
                },
            );
        }
    }

    summary
}

async fn container_sample_loop(
    name: String,
    config: MonitorConfig,
    breach_tx: mpsc::Sender<ResourceBreach>,
    mut shutdown: watch::Receiver<bool>,
) -> ResourceUsageSummary {
    let mut summary = ResourceUsageSummary::default();

    let mut interval = tokio::time::interval(config.sample_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick fires immediately; sampling starts one interval in.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let Some(sample) = sample_container(&name).await else {
            debug!("Container {} gone, monitor finishing", name);
            break;
        };

        summary.samples += 1;
        summary.peak_memory_mb = summary.peak_memory_mb.max(sample.rss_mb);
        summary.max_process_count = summary.max_process_count.max(sample.process_count);
        // The runtime reports CPU over its own window; no baseline math.
        if sample.cpu_percent > summary.peak_cpu_percent {
            summary.peak_cpu_percent = sample.cpu_percent;
        }
        trace!(
            container = name,
            rss_mb = sample.rss_mb,
            cpu_percent = sample.cpu_percent,
            processes = sample.process_count,
            "resource sample"
        );

        if sample.rss_mb > config.max_memory_mb {
            report(
                &breach_tx,
                ResourceBreach::Memory {
                    used_mb: sample.rss_mb,
                    limit_mb: config.max_memory_mb,
                },
            );
        }
        if sample.cpu_percent > f64::from(config.max_cpu_percent) {
            report(
                &breach_tx,
                ResourceBreach::Cpu {
                    used_percent: sample.cpu_percent,
                    limit_percent: config.max_cpu_percent,
                },
            );
        }
    }

    summary
}

fn report(tx: &mpsc::Sender<ResourceBreach>, breach: ResourceBreach) {
    // A full channel means the supervisor already has an unhandled breach
    // queued; dropping this one loses nothing.
    if let Err(e) = tx.try_send(breach) {
        trace!("Breach not queued: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            enable_resource_monitoring: true,
            max_memory_mb: 1024 * 1024,
            max_cpu_percent: 6400,
            sample_interval_ms: 100,
        }
    }

    fn own_tree() -> MonitorTarget {
        MonitorTarget::Tree {
            pid: std::process::id(),
        }
    }

    #[tokio::test]
    async fn test_monitor_own_process_and_stop() {
        let monitor = ResourceMonitor::new(fast_config());
        let (task, _breach_rx) = monitor.start(own_tree());
        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        let summary = task.stop().await;
        assert!(summary.samples >= 1);
        assert!(summary.peak_memory_mb > 0);
    }

    #[tokio::test]
    async fn test_memory_breach_reported() {
        let config = MonitorConfig {
            max_memory_mb: 0,
            ..fast_config()
        };
        let monitor = ResourceMonitor::new(config);
        let (task, mut breach_rx) = monitor.start(own_tree());
        let breach = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            breach_rx.recv(),
        )
        .await
        .expect("breach expected within sampling window")
        .expect("channel open");
        assert!(matches!(breach, ResourceBreach::Memory { .. }));
        assert_eq!(breach.kind(), "memory");
        task.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_monitor_idles() {
        let config = MonitorConfig {
            enable_resource_monitoring: false,
            ..fast_config()
        };
        let monitor = ResourceMonitor::new(config);
        let (task, mut breach_rx) = monitor.start(own_tree());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let summary = task.stop().await;
        assert_eq!(summary.samples, 0);
        assert!(breach_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_monitor_vanished_tree_finishes() {
        let monitor = ResourceMonitor::new(fast_config());
        let (task, _breach_rx) = monitor.start(MonitorTarget::Tree { pid: u32::MAX - 1 });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let summary = task.stop().await;
        assert_eq!(summary.samples, 0);
    }

    #[tokio::test]
    async fn test_monitor_vanished_container_finishes() {
        let monitor = ResourceMonitor::new(fast_config());
        let (task, _breach_rx) = monitor.start(MonitorTarget::Container {
            name: "audio-gate-does-not-exist".to_string(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let summary = task.stop().await;
        assert_eq!(summary.samples, 0);
    }

    #[test]
    fn test_breach_display() {
        let breach = ResourceBreach::Cpu {
            used_percent: 93.5,
            limit_percent: 80,
        };
        assert!(breach.to_string().contains("93.5%"));
        assert!(breach.to_string().contains("80%"));
    }
}
