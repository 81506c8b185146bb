//! Process liveness checks.

/// Answers whether a process id is still running.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
///
/// - **Unix**: `kill(pid, 0)`; `EPERM` means the process exists but belongs to
///   someone else, so it counts as alive.
/// - **Elsewhere**: every process is assumed alive, so no record is ever pruned.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        tracing::warn!("Process liveness check not implemented for this platform");
        true
    }
}
