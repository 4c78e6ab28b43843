//! Process inspection and signalling for worker PIDs and job process groups.

use std::io;
use sysinfo::{Pid, ProcessStatus, System};

/// What the OS says about a PID right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Something is running under this PID, started at `start_time`
    /// (seconds since the Unix epoch).
    Alive { start_time: u64 },
    /// No process, or only a zombie waiting to be reaped.
    Gone,
}

pub fn inspect(pid: u32) -> ProcessState {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return ProcessState::Gone;
    }
    match sys.process(pid) {
        Some(proc) if !matches!(proc.status(), ProcessStatus::Zombie | ProcessStatus::Dead) => {
            ProcessState::Alive {
                start_time: proc.start_time(),
            }
        }
        _ => ProcessState::Gone,
    }
}

/// Start time of `pid` in seconds since the Unix epoch, if it is running.
pub fn start_time(pid: u32) -> Option<u64> {
    match inspect(pid) {
        ProcessState::Alive { start_time } => Some(start_time),
        ProcessState::Gone => None,
    }
}

pub fn terminate(pid: u32) -> io::Result<()> {
    send_signal(to_pid(pid)?, libc::SIGTERM)
}

pub fn kill(pid: u32) -> io::Result<()> {
    send_signal(to_pid(pid)?, libc::SIGKILL)
}

/// SIGKILL every member of process group `pgid`.
pub fn kill_group(pgid: u32) -> io::Result<()> {
    send_signal(-to_pid(pgid)?, libc::SIGKILL)
}

fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 1 => Ok(pid),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )),
    }
}

fn send_signal(target: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(target, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
