//! Child-process stage management for the transfer pipeline.
//!
//! Every stage is a running child whose stderr is drained concurrently. The
//! pool is a scope guard: whatever path leaves the pipeline (success,
//! failure, cancellation, panic) reaps every child, escalating TERM to KILL
//! after the drain window.

use std::io::Read;
use std::process::{Child, ExitStatus};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_DRAIN_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Stage {
    pub name: &'static str,
    pub child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl Stage {
    /// Wrap a spawned child; its piped stderr (if any) is drained on a
    /// thread so a chatty stage can never deadlock the pipeline.
    pub fn new(name: &'static str, mut child: Child) -> Self {
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        Self {
            name,
            child,
            stderr,
        }
    }

    fn collect_stderr(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .unwrap_or_default()
    }
}

/// Outcome of one stage after the pool settles.
#[derive(Clone, Debug)]
pub struct StageResult {
    pub name: &'static str,
    /// `None` when the stage had to be killed.
    pub status: Option<ExitStatus>,
    pub stderr: String,
}

impl StageResult {
    pub fn failed(&self) -> bool {
        match self.status {
            Some(status) => !status.success(),
            None => true,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

#[derive(Debug, Default)]
pub struct StagePool {
    stages: Vec<Stage>,
}

impl StagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Wait for every stage within `window`; stages still running at the
    /// deadline are terminated. Returns results in spawn order.
    pub fn settle(&mut self, window: Duration) -> Vec<StageResult> {
        let deadline = Instant::now() + window;
        let mut results = Vec::with_capacity(self.stages.len());
        let mut stages = std::mem::take(&mut self.stages);
        for mut stage in stages.drain(..) {
            let status = wait_until(&mut stage.child, deadline);
            let status = match status {
                Some(status) => Some(status),
                None => {
                    terminate(&mut stage.child, DEFAULT_DRAIN_WINDOW);
                    None
                }
            };
            results.push(StageResult {
                name: stage.name,
                status,
                stderr: stage.collect_stderr(),
            });
        }
        results
    }

    /// Cancel path: TERM every stage now, KILL what survives the window.
    pub fn abort(&mut self, window: Duration) -> Vec<StageResult> {
        let mut results = Vec::with_capacity(self.stages.len());
        let mut stages = std::mem::take(&mut self.stages);
        for stage in &mut stages {
            send_term(&stage.child);
        }
        let deadline = Instant::now() + window;
        for mut stage in stages.drain(..) {
            let status = wait_until(&mut stage.child, deadline);
            if status.is_none() {
                let _ = stage.child.kill();
                let _ = stage.child.wait();
            }
            results.push(StageResult {
                name: stage.name,
                status,
                stderr: stage.collect_stderr(),
            });
        }
        results
    }
}

impl Drop for StagePool {
    fn drop(&mut self) {
        for stage in &mut self.stages {
            send_term(&stage.child);
        }
        for stage in &mut self.stages {
            if wait_until(&mut stage.child, Instant::now() + Duration::from_secs(1)).is_none() {
                let _ = stage.child.kill();
                let _ = stage.child.wait();
            }
        }
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> Option<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(_) => return None,
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// SIGTERM first; `Child::kill` is reserved for escalation.
fn send_term(child: &Child) {
    let _ = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}

fn terminate(child: &mut Child, window: Duration) {
    send_term(child);
    if wait_until(child, Instant::now() + window).is_none() {
        let _ = child.kill();
        let _ = child.wait();
    }
}
