use std::time::Duration;

use crate::context::Context;

use super::error::CommandError;

#[cfg(target_family = "unix")]
use nix::{sys::signal, unistd::Pid};

pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminates a worker process: SIGTERM first, SIGKILL when the grace period
/// elapses without the process exiting.
pub struct ProcessTerminator {
    pid: u32,
    exit_timeout: Duration,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    /// Sends SIGTERM and calls `wait_exited` with the grace period; when it
    /// returns false the process is still alive and gets SIGKILL.
    #[cfg(target_family = "unix")]
    pub fn shutdown<W>(self, wait_exited: W) -> Result<(), CommandError>
    where
        W: FnOnce(Duration) -> bool,
    {
        signal::kill(Pid::from_raw(self.pid as i32), signal::SIGTERM)?;

        if !wait_exited(self.exit_timeout) {
            // still running after the grace period
            let _ = signal::kill(Pid::from_raw(self.pid as i32), signal::SIGKILL);
        }

        Ok(())
    }

    #[cfg(not(target_family = "unix"))]
    pub fn shutdown<W>(self, _wait_exited: W) -> Result<(), CommandError>
    where
        W: FnOnce(Duration) -> bool,
    {
        unimplemented!("process shutdown is unix-only")
    }
}

/// Blocks on `ctx` up to `timeout`; true when the context was signalled,
/// false on timeout.
pub fn wait_exit_timeout(ctx: Context<bool>, timeout: Duration) -> bool {
    ctx.wait_timeout(timeout)
}

#[cfg(target_family = "unix")]
#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::thread::sleep;
    use std::time::Duration;

    fn spawn_trap(term_delay_secs: u32) -> std::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(format!(
                "trap \"sleep {term_delay_secs};exit 0\" TERM;while true; do sleep 1; done"
            ))
            .spawn()
            .unwrap()
    }

    #[test]
    fn shutdown_kills_after_grace_period() {
        let mut child = spawn_trap(35);
        let pid = child.id();
        sleep(Duration::from_millis(300));

        let exit_ctx = Context::<bool>::new();
        let terminator = ProcessTerminator::new(pid).with_exit_timeout(Duration::from_millis(200));
        terminator
            .shutdown(|grace| wait_exit_timeout(exit_ctx, grace))
            .unwrap();

        let status = child.wait().unwrap();
        assert_eq!("signal: 9 (SIGKILL)", status.to_string());
    }

    #[test]
    fn shutdown_is_graceful_when_process_exits_in_time() {
        let mut child = spawn_trap(0);
        let pid = child.id();
        sleep(Duration::from_millis(300));

        let exit_ctx = Context::<bool>::new();

        // pretend the exit watcher saw the process leave within the grace period
        let watcher_ctx = exit_ctx.clone();
        std::thread::spawn(move || {
            sleep(Duration::from_millis(100));
            watcher_ctx.cancel_all(true).unwrap();
        });

        let terminator = ProcessTerminator::new(pid).with_exit_timeout(Duration::from_secs(5));
        terminator
            .shutdown(|grace| wait_exit_timeout(exit_ctx, grace))
            .unwrap();

        let status = child.wait().unwrap();
        assert_eq!("exit status: 0", status.to_string());
    }
}
