//! Worker process supervision.
//!
//! Each session owns exactly one worker process. [`WorkerSupervisor`] is the
//! seam the session manager uses to start, probe and stop workers;
//! [`ProcessSupervisor`] implements it with `tokio::process` for launching,
//! `sysinfo` for probing and, on Unix, `nix` for signalling.
//!
//! # Process groups
//!
//! Every worker leads its own process group. Stopping a worker signals the
//! whole group, so helpers it forked are stopped too, including ones that
//! were reparented after their parent exited. A stop is complete once the
//! worker has exited and the group has no members left.
//!
//! # Pid reuse
//!
//! A [`WorkerHandle`] records the pid together with the OS start time of the
//! process. A probe only reports a worker alive when a process with that pid
//! exists, is not a zombie, and started at the recorded time, so a recycled
//! pid is never mistaken for the original worker.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cyberrange_types::{GameConfig, SessionId, WorkerHandle};
use sysinfo::{Pid, Process, ProcessStatus, System};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::error::SupervisorError;

/// A readable worker output stream.
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Poll interval while waiting for a signalled worker to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A freshly launched worker and its output streams.
pub struct SpawnedWorker {
    /// Handle recorded in the session registry.
    pub handle: WorkerHandle,
    /// Worker stdout, if captured.
    pub stdout: Option<OutputReader>,
    /// Worker stderr, if captured.
    pub stderr: Option<OutputReader>,
}

impl std::fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("handle", &self.handle)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Starts, probes and stops worker processes.
#[async_trait]
pub trait WorkerSupervisor: Send + Sync + 'static {
    /// Launch a worker for `session_id` running `config`.
    async fn spawn(
        &self,
        session_id: SessionId,
        config: &GameConfig,
    ) -> Result<SpawnedWorker, SupervisorError>;

    /// Whether the worker identified by `handle` is still running. Never
    /// blocks on the worker.
    fn is_alive(&self, handle: &WorkerHandle) -> bool;

    /// Stop the worker and everything it spawned: graceful signal, bounded
    /// wait, forced kill, bounded wait. A worker that is already gone is
    /// not an error.
    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), SupervisorError>;
}

/// How hard to ask a worker group to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Graceful,
    Forced,
}

#[cfg(unix)]
mod group {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    use super::Stop;

    /// Deliver `stop` to every member of group `pgid`, or only check that
    /// the group exists when `stop` is `None`. Returns `false` once the
    /// group has no members.
    pub(super) fn signal(pgid: u32, stop: Option<Stop>) -> bool {
        // 0 and 1 would address our own group and init's.
        let Some(raw) = i32::try_from(pgid).ok().filter(|raw| *raw > 1) else {
            return false;
        };
        let signal = stop.map(|stop| match stop {
            Stop::Graceful => Signal::SIGTERM,
            Stop::Forced => Signal::SIGKILL,
        });
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                tracing::warn!(pgid, error = %e, ?stop, "process group signal failed");
                true
            }
        }
    }
}

/// Without process groups only the worker itself is signalled.
#[cfg(not(unix))]
mod group {
    use sysinfo::{Pid, ProcessStatus, Signal, System};

    use super::Stop;

    pub(super) fn signal(pid: u32, stop: Option<Stop>) -> bool {
        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return false;
        }
        let Some(process) = system.process(pid) else {
            return false;
        };
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return false;
        }
        match stop {
            Some(Stop::Graceful) => process.kill_with(Signal::Term).unwrap_or(false),
            Some(Stop::Forced) => process.kill(),
            None => true,
        }
    }
}

/// [`WorkerSupervisor`] backed by real OS processes.
#[derive(Debug)]
pub struct ProcessSupervisor {
    worker: WorkerConfig,
    bus_url: String,
    children: Mutex<HashMap<u32, Child>>,
    /// Groups launched here that may still have members.
    groups: Mutex<HashSet<u32>>,
    system: Mutex<System>,
}

impl ProcessSupervisor {
    /// Create a supervisor launching `worker.program`, telling each worker
    /// to connect to `bus_url`.
    pub fn new(worker: WorkerConfig, bus_url: impl Into<String>) -> Self {
        Self {
            worker,
            bus_url: bus_url.into(),
            children: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashSet::new()),
            system: Mutex::new(System::new()),
        }
    }

    fn command(&self, session_id: SessionId, config: &GameConfig) -> Command {
        let mut command = Command::new(&self.worker.program);
        command
            .args(&self.worker.args)
            .arg("--session-id")
            .arg(session_id.to_string())
            .arg("--num-steps")
            .arg(config.steps.to_string())
            .arg("--wrapper-type")
            .arg(config.wrapper.as_str())
            .arg("--red-agent-type")
            .arg(config.red_agent.as_str())
            .arg("--blue-agent-type")
            .arg(config.blue_agent.as_str())
            .arg("--bus-url")
            .arg(&self.bus_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// OS start time of `pid`, if it exists.
    fn start_time(&self, pid: u32) -> Option<u64> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(Process::start_time)
    }

    /// Probe a worker this process did not spawn (or no longer holds).
    fn probe(&self, handle: &WorkerHandle) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(handle.pid);
        if !system.refresh_process(pid) {
            return false;
        }
        system.process(pid).is_some_and(|process| {
            !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                && (handle.started_at == 0 || process.start_time() == handle.started_at)
        })
    }

    fn owns_group(&self, pgid: u32) -> bool {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pgid)
    }

    fn forget_group(&self, pgid: u32) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pgid);
    }

    /// Wait until the worker and its group are gone or `grace` runs out.
    async fn wait_for_exit(&self, handle: &WorkerHandle, grace: Duration) -> bool {
        let deadline = Instant::now().checked_add(grace);
        loop {
            // Probe the worker first so an exited worker is reaped and
            // leaves the group.
            if !self.is_alive(handle) && !group::signal(handle.pgid, None) {
                self.forget_group(handle.pgid);
                return true;
            }
            if deadline.is_none_or(|deadline| Instant::now() >= deadline) {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl WorkerSupervisor for ProcessSupervisor {
    async fn spawn(
        &self,
        session_id: SessionId,
        config: &GameConfig,
    ) -> Result<SpawnedWorker, SupervisorError> {
        let program = self.worker.program.clone();
        let mut child = self
            .command(session_id, config)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                program: program.clone(),
                source,
            })?;
        let pid = child.id().ok_or(SupervisorError::MissingPid { program })?;
        let started_at = self.start_time(pid).unwrap_or_else(|| {
            tracing::warn!(
                session_id = %session_id,
                pid,
                "worker start time unavailable, liveness probes cannot detect pid reuse"
            );
            0
        });

        let stdout = child.stdout.take().map(|s| Box::new(s) as OutputReader);
        let stderr = child.stderr.take().map(|s| Box::new(s) as OutputReader);
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, child);
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid);

        tracing::info!(session_id = %session_id, pid, started_at, "worker spawned");
        Ok(SpawnedWorker {
            handle: WorkerHandle {
                pid,
                pgid: pid,
                started_at,
            },
            stdout,
            stderr,
        })
    }

    fn is_alive(&self, handle: &WorkerHandle) -> bool {
        {
            let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(child) = children.get_mut(&handle.pid) {
                match child.try_wait() {
                    Ok(None) => return true,
                    Ok(Some(status)) => {
                        tracing::debug!(pid = handle.pid, %status, "worker exited");
                        children.remove(&handle.pid);
                        return false;
                    }
                    Err(e) => {
                        tracing::warn!(pid = handle.pid, error = %e, "try_wait failed, probing instead");
                    }
                }
            }
        }
        self.probe(handle)
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        // A group id is only trusted while its leader is the recorded worker
        // or the group was launched here.
        if !self.is_alive(handle) && (!self.owns_group(handle.pgid) || !group::signal(handle.pgid, None)) {
            self.forget_group(handle.pgid);
            tracing::debug!(pid = handle.pid, "terminate: worker already gone");
            return Ok(());
        }

        tracing::info!(pid = handle.pid, pgid = handle.pgid, "stopping worker");
        group::signal(handle.pgid, Some(Stop::Graceful));
        if self.wait_for_exit(handle, self.worker.terminate_grace()).await {
            return Ok(());
        }

        tracing::warn!(
            pid = handle.pid,
            pgid = handle.pgid,
            grace_ms = self.worker.terminate_grace_ms,
            "worker ignored graceful stop, killing"
        );
        group::signal(handle.pgid, Some(Stop::Forced));
        if self.wait_for_exit(handle, self.worker.kill_grace()).await {
            return Ok(());
        }
        if self.is_alive(handle) {
            return Err(SupervisorError::StillRunning { pid: handle.pid });
        }
        // Killed members can linger as zombies until their new parent reaps them.
        tracing::warn!(pgid = handle.pgid, "process group not empty after forced kill");
        self.forget_group(handle.pgid);
        Ok(())
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    use super::*;

    /// Whether `pid` is a running, non-zombie process.
    fn running(pid: u32) -> bool {
        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_process(pid)
            && system
                .process(pid)
                .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    fn shell(script: &str) -> ProcessSupervisor {
        ProcessSupervisor::new(
            WorkerConfig {
                program: "sh".to_owned(),
                args: vec!["-c".to_owned(), script.to_owned(), "sh".to_owned()],
                terminate_grace_ms: 2_000,
                kill_grace_ms: 2_000,
            },
            "redis://unused:6379",
        )
    }

    async fn wait_dead(supervisor: &ProcessSupervisor, handle: &WorkerHandle) {
        for _ in 0..200 {
            if !supervisor.is_alive(handle) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!supervisor.is_alive(handle), "worker {} never exited", handle.pid);
    }

    #[tokio::test]
    async fn spawn_passes_session_arguments() {
        let supervisor = shell(r#"echo "$@""#);
        let session = SessionId::new();
        let mut spawned = supervisor
            .spawn(session, &GameConfig::default())
            .await
            .unwrap();

        let mut out = String::new();
        spawned
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert!(out.contains(&format!("--session-id {session}")));
        assert!(out.contains("--num-steps 10"));
        assert!(out.contains("--red-agent-type B_lineAgent"));
        assert!(out.contains("--bus-url redis://unused:6379"));
        assert_eq!(spawned.handle.pgid, spawned.handle.pid);
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let supervisor = ProcessSupervisor::new(
            WorkerConfig {
                program: "/nonexistent/cyberrange-worker".to_owned(),
                ..WorkerConfig::default()
            },
            "redis://unused:6379",
        );
        let result = supervisor.spawn(SessionId::new(), &GameConfig::default()).await;
        assert!(matches!(result, Err(SupervisorError::Launch { .. })));
    }

    #[tokio::test]
    async fn terminate_stops_a_running_worker() {
        let supervisor = shell("sleep 30");
        let spawned = supervisor
            .spawn(SessionId::new(), &GameConfig::default())
            .await
            .unwrap();
        assert!(supervisor.is_alive(&spawned.handle));

        supervisor.terminate(&spawned.handle).await.unwrap();
        assert!(!supervisor.is_alive(&spawned.handle));
    }

    #[tokio::test]
    async fn terminate_is_idempotent_for_exited_worker() {
        let supervisor = shell("exit 0");
        let spawned = supervisor
            .spawn(SessionId::new(), &GameConfig::default())
            .await
            .unwrap();
        wait_dead(&supervisor, &spawned.handle).await;

        assert!(supervisor.terminate(&spawned.handle).await.is_ok());
        assert!(supervisor.terminate(&spawned.handle).await.is_ok());
    }

    #[tokio::test]
    async fn reused_pid_is_not_reported_alive() {
        let supervisor = shell("sleep 30");
        let spawned = supervisor
            .spawn(SessionId::new(), &GameConfig::default())
            .await
            .unwrap();

        // Same pid, different start time: a foreign process, as seen by a
        // supervisor that did not spawn it.
        assert_ne!(spawned.handle.started_at, 0);
        let foreign = WorkerHandle {
            started_at: spawned.handle.started_at.saturating_add(1),
            ..spawned.handle
        };
        let observer = shell("true");
        assert!(observer.is_alive(&spawned.handle));
        assert!(!observer.is_alive(&foreign));

        supervisor.terminate(&spawned.handle).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_stops_reparented_group_members() {
        // The subshell exits right away, leaving its `sleep` orphaned but
        // still in the worker's process group.
        let supervisor = shell("(sleep 3000 & echo $!); sleep 30; true");
        let mut spawned = supervisor
            .spawn(SessionId::new(), &GameConfig::default())
            .await
            .unwrap();
        let mut stdout = BufReader::new(spawned.stdout.take().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        let orphan: u32 = line.trim().parse().unwrap();
        assert!(running(orphan));

        supervisor.terminate(&spawned.handle).await.unwrap();
        assert!(!supervisor.is_alive(&spawned.handle));
        for _ in 0..200 {
            if !running(orphan) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!running(orphan), "group member {orphan} outlived terminate");
    }

    #[tokio::test]
    async fn terminate_sweeps_the_group_of_an_exited_worker() {
        let supervisor = shell("(sleep 3000 >/dev/null 2>&1 & echo $!)");
        let mut spawned = supervisor
            .spawn(SessionId::new(), &GameConfig::default())
            .await
            .unwrap();
        let mut out = String::new();
        spawned
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        let orphan: u32 = out.trim().parse().unwrap();
        wait_dead(&supervisor, &spawned.handle).await;
        assert!(running(orphan));

        supervisor.terminate(&spawned.handle).await.unwrap();
        assert!(!running(orphan));
    }

    #[test]
    fn reserved_group_ids_are_never_signalled() {
        assert!(!group::signal(0, None));
        assert!(!group::signal(1, None));
    }
}
