//! Peer instance discovery and termination

#[cfg(test)]
use mockall::automock;

use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::update::error::UpdateError;

/// Poll interval while waiting for a terminated process to go away
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running process, as seen during peer enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub image_name: String,
}

/// Outcome of terminating peer instances
#[derive(Debug, Default)]
pub struct TerminationReport {
    /// Number of peers that were terminated
    pub terminated: usize,
    /// Per-pid failures, informational only
    pub failures: Vec<UpdateError>,
}

/// Trait for enumerating and killing operating-system processes
#[cfg_attr(test, automock)]
pub trait ProcessTable: Send + Sync {
    /// Snapshot of all running processes
    fn list(&self) -> Vec<ProcessRecord>;

    /// Forcefully terminate `pid`, waiting at most `timeout` for it to exit
    fn terminate(&self, pid: u32, timeout: Duration) -> Result<(), UpdateError>;
}

/// `ProcessTable` backed by sysinfo
#[derive(Debug, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn list(&self) -> Vec<ProcessRecord> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All);

        sys.processes()
            .iter()
            .filter_map(|(pid, process)| {
                // Linux lists every thread as a task sharing the process image.
                if process.thread_kind().is_some() {
                    return None;
                }
                // Prefer the executable's file name: Linux truncates `name()` to 15 bytes.
                let image_name = process
                    .exe()
                    .and_then(|exe| exe.file_name())
                    .unwrap_or_else(|| process.name())
                    .to_string_lossy()
                    .into_owned();
                if image_name.is_empty() {
                    return None;
                }
                Some(ProcessRecord {
                    pid: pid.as_u32(),
                    image_name,
                })
            })
            .collect()
    }

    fn terminate(&self, pid: u32, timeout: Duration) -> Result<(), UpdateError> {
        let sys_pid = Pid::from_u32(pid);
        let mut sys = System::new();
        // A full refresh is needed to tell a thread id from a process id.
        sys.refresh_processes(ProcessesToUpdate::All);

        let Some(process) = sys.process(sys_pid) else {
            debug!("Process {} already exited", pid);
            return Ok(());
        };

        // A signal to a thread id reaches the whole owning process.
        if process.thread_kind().is_some() {
            return Err(UpdateError::ProcessKill {
                pid,
                reason: "pid belongs to a thread, not a process".to_string(),
            });
        }

        if !process.kill() {
            return Err(UpdateError::ProcessKill {
                pid,
                reason: "kill signal was rejected (insufficient permissions?)".to_string(),
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]));
            if sys.process(sys_pid).is_none() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UpdateError::ProcessKill {
                    pid,
                    reason: format!("still running after {:?}", timeout),
                });
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

fn image_matches(candidate: &str, image_name: &str) -> bool {
    if cfg!(windows) {
        candidate.eq_ignore_ascii_case(image_name)
    } else {
        candidate == image_name
    }
}

/// Select processes running `image_name`, never including `self_pid`
pub fn select_peers(
    processes: Vec<ProcessRecord>,
    image_name: &str,
    self_pid: u32,
) -> Vec<ProcessRecord> {
    processes
        .into_iter()
        .filter(|p| p.pid != self_pid)
        .filter(|p| image_matches(&p.image_name, image_name))
        .collect()
}

/// List other running instances of `image_name`
pub fn find_peer_instances(
    table: &dyn ProcessTable,
    image_name: &str,
    self_pid: u32,
) -> Vec<ProcessRecord> {
    select_peers(table.list(), image_name, self_pid)
}

/// Terminate every other running instance of `image_name`
///
/// Failures are collected per pid and never abort the remaining kills.
pub fn terminate_other_instances(
    table: &dyn ProcessTable,
    image_name: &str,
    self_pid: u32,
    timeout: Duration,
) -> TerminationReport {
    let peers = find_peer_instances(table, image_name, self_pid);
    let mut report = TerminationReport::default();

    if peers.is_empty() {
        debug!("No other instances of {} running", image_name);
        return report;
    }

    info!(
        "Terminating {} other instance(s) of {}",
        peers.len(),
        image_name
    );

    for peer in peers {
        match table.terminate(peer.pid, timeout) {
            Ok(()) => report.terminated += 1,
            Err(e) => {
                warn!("{}", e);
                report.failures.push(e);
            }
        }
    }

    report
}
