//! OS process table probes.

pub fn current_pid() -> u32 {
    std::process::id()
}

/// Signal-0 probe. `EPERM` means the process exists under another user, so it
/// counts as alive; pid 0 and values outside `i32` are never alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a portable probe, assume alive so a live holder is never taken over.
#[cfg(not(unix))]
pub fn is_pid_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(is_pid_alive(current_pid()));
    }

    #[test]
    fn zero_is_never_alive() {
        assert!(!is_pid_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn out_of_range_pid_is_dead() {
        assert!(!is_pid_alive(u32::MAX));
        assert!(!is_pid_alive(99_999_999));
    }
}
