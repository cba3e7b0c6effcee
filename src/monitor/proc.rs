//! Process tree accounting from `/proc`.
//!
//! The supervised pipeline forks freely (model loaders, ffmpeg helpers), so
//! limits are enforced against the whole descendant tree of the root pid,
//! not just the root. All parsing is split into pure functions over the raw
//! file contents so it can be tested without live processes.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

/// One sample of a single process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcSample {
    /// Resident set size in kilobytes.
    pub rss_kb: u64,
    /// Cumulative user + system CPU time in clock ticks.
    pub cpu_ticks: u64,
}

/// Aggregated sample of a whole process tree.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TreeSample {
    /// Summed resident set size in kilobytes.
    pub rss_kb: u64,
    /// Summed cumulative CPU ticks.
    pub cpu_ticks: u64,
    /// Number of live processes in the tree.
    pub process_count: usize,
}

/// Clock ticks per second on this host.
pub fn clock_ticks_per_second() -> u64 {
    // Always positive on Linux; 100 is the universal default.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// Parse cumulative CPU ticks (utime + stime) out of `/proc/<pid>/stat`.
///
/// The comm field is parenthesized and may itself contain spaces and
/// parentheses, so fields are counted from after the last `)`.
pub fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: field 0 is state, utime and stime are fields 11 and 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Parse resident memory in kB out of `/proc/<pid>/status`.
pub fn parse_status_rss_kb(status: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok();
        }
    }
    None
}

/// Parse a whitespace-separated pid list (`/proc/<pid>/task/<tid>/children`).
pub fn parse_children(children: &str) -> Vec<u32> {
    children
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect()
}

/// Sample one process. Returns `None` when it has already exited.
pub fn sample_process(pid: u32) -> Option<ProcSample> {
    let proc_dir = PathBuf::from(format!("/proc/{}", pid));
    let stat = fs::read_to_string(proc_dir.join("stat")).ok()?;
    let status = fs::read_to_string(proc_dir.join("status")).ok()?;
    Some(ProcSample {
        rss_kb: parse_status_rss_kb(&status).unwrap_or(0),
        cpu_ticks: parse_stat_cpu_ticks(&stat).unwrap_or(0),
    })
}

/// Collect the pids of `root` and all its live descendants.
///
/// Walks `/proc/<pid>/task/<tid>/children` breadth-first. Races with exiting
/// processes are benign: a vanished pid simply contributes nothing.
pub fn collect_tree_pids(root: u32) -> Vec<u32> {
    let mut pids = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        pids.push(pid);
        let task_dir = PathBuf::from(format!("/proc/{}/task", pid));
        let Ok(tasks) = fs::read_dir(&task_dir) else {
            continue;
        };
        for task in tasks.flatten() {
            if let Ok(children) = fs::read_to_string(task.path().join("children")) {
                for child in parse_children(&children) {
                    if !pids.contains(&child) {
                        queue.push_back(child);
                    }
                }
            }
        }
    }
    pids
}

/// Sample the whole tree rooted at `root`.
///
/// Returns `None` when the root itself is gone, the signal that the
/// supervised run has finished.
pub fn sample_tree(root: u32) -> Option<TreeSample> {
    let root_sample = sample_process(root)?;
    let mut tree = TreeSample {
        rss_kb: root_sample.rss_kb,
        cpu_ticks: root_sample.cpu_ticks,
        process_count: 1,
    };
    for pid in collect_tree_pids(root) {
        if pid == root {
            continue;
        }
        if let Some(sample) = sample_process(pid) {
            tree.rss_kb += sample.rss_kb;
            tree.cpu_ticks += sample.cpu_ticks;
            tree.process_count += 1;
        }
    }
    Some(tree)
}
