//! External Tool Runner
//!
//! Session managers are driven through their CLIs (`pw-dump`, `pw-metadata`,
//! `pactl`). The runner is a trait so the parsers and retry loops can be
//! exercised against scripted output.

use std::env;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::{PlatformError, PlatformResult};

/// Upper bound on one session-manager CLI call
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

const WAIT_POLL: Duration = Duration::from_millis(10);

/// Runs a tool and returns its stdout
pub trait CommandRunner: Send + Sync {
    fn run(&self, tool: &str, args: &[&str]) -> PlatformResult<String>;
}

/// Runs tools with `std::process::Command`, killing any that overrun
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl SystemRunner {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn wait(&self, tool: &str, child: &mut Child) -> PlatformResult<ExitStatus> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    warn!("{} still running after {:?}, killing it", tool, self.timeout);
                    if let Err(e) = child.kill() {
                        trace!("kill {}: {}", tool, e);
                    }
                    // Reap so no zombie is left behind
                    let _ = child.wait();
                    return Err(PlatformError::command(tool, "timed out"));
                }
                Ok(None) => thread::sleep(WAIT_POLL),
                Err(e) => return Err(PlatformError::command(tool, e.to_string())),
            }
        }
    }
}

/// Drains a pipe on its own thread so a chatty tool never blocks on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut out = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut out);
        }
        out
    })
}

impl CommandRunner for SystemRunner {
    fn run(&self, tool: &str, args: &[&str]) -> PlatformResult<String> {
        trace!("exec {} {:?}", tool, args);
        let mut child = Command::new(tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PlatformError::command(tool, e.to_string()))?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        // On timeout the drain threads finish once the killed child's pipes close
        let status = self.wait(tool, &mut child)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exit code {:?}", status.code())
            } else {
                stderr
            };
            return Err(PlatformError::command(tool, message));
        }

        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

/// Whether `tool` resolves to a file on `PATH`
pub fn tool_on_path(tool: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| is_file(&dir.join(tool)))
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// Replays canned stdout keyed by `"tool arg1 arg2"` and records calls
    #[derive(Default)]
    pub struct ScriptedRunner {
        pub responses: Mutex<HashMap<String, Vec<PlatformResult<String>>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn push(&self, cmdline: &str, result: PlatformResult<String>) {
            self.responses
                .lock()
                .entry(cmdline.to_string())
                .or_default()
                .push(result);
        }

        pub fn calls_matching(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, tool: &str, args: &[&str]) -> PlatformResult<String> {
            let key = std::iter::once(tool)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().push(key.clone());
            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                // The last response repeats once the queue drains
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) => match queue.first() {
                    Some(Ok(s)) => Ok(s.clone()),
                    Some(Err(e)) => Err(PlatformError::command(tool, e.to_string())),
                    None => Err(PlatformError::command(tool, "no scripted response")),
                },
                None => Err(PlatformError::command(tool, "no scripted response")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool_is_error() {
        let err = SystemRunner::default()
            .run("hiresti-definitely-not-a-tool", &[])
            .unwrap_err();
        assert!(matches!(err, PlatformError::CommandFailed { .. }));
        assert!(!tool_on_path("hiresti-definitely-not-a-tool"));
    }

    #[test]
    fn test_captures_stdout() {
        if !tool_on_path("echo") {
            return;
        }
        let out = SystemRunner::default().run("echo", &["hires"]).unwrap();
        assert_eq!(out.trim(), "hires");
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        if !tool_on_path("false") {
            return;
        }
        let err = SystemRunner::default().run("false", &[]).unwrap_err();
        assert!(err.to_string().contains("exit code"), "{}", err);
    }

    #[test]
    fn test_hung_tool_is_killed() {
        if !tool_on_path("sleep") {
            return;
        }
        let runner = SystemRunner::with_timeout(Duration::from_millis(150));
        let started = Instant::now();
        let err = runner.run("sleep", &["5"]).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        match err {
            PlatformError::CommandFailed { tool, message } => {
                assert_eq!(tool, "sleep");
                assert_eq!(message, "timed out");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_scripted_runner_repeats_last() {
        let runner = testing::ScriptedRunner::default();
        runner.push("pactl info", Ok("a".into()));
        runner.push("pactl info", Ok("b".into()));
        assert_eq!(runner.run("pactl", &["info"]).unwrap(), "a");
        assert_eq!(runner.run("pactl", &["info"]).unwrap(), "b");
        assert_eq!(runner.run("pactl", &["info"]).unwrap(), "b");
        assert_eq!(runner.calls_matching("pactl"), 3);
    }
}
