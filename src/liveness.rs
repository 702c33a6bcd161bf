//! Process-liveness probe and signal delivery.
//!
//! The probe sends the null signal, which checks for existence and
//! permission without affecting the target. On Linux a zombie (exited but
//! not yet reaped by its parent) counts as dead: it will never run again,
//! and waiting on it would only burn the full exit timeout.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Returns true if `pid` refers to a running process.
///
/// Non-positive PIDs are never alive: `kill(0, ..)` and `kill(-n, ..)`
/// address process groups, not a single session.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        // EPERM: the process exists but belongs to someone else
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Send `sig` to `pid`.
pub fn send_signal(pid: i32, sig: Signal) -> nix::Result<()> {
    if pid <= 0 {
        return Err(Errno::EINVAL);
    }
    signal::kill(Pid::from_raw(pid), sig)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    process_state(&stat) == Some('Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}

/// Extract the state letter from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the state is the first field after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn process_state(stat: &str) -> Option<char> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.trim_start().chars().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
    }

    #[test]
    fn test_non_positive_pids_are_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
        assert!(send_signal(0, Signal::SIGTERM).is_err());
    }

    #[test]
    fn test_reaped_child_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unreaped_child_counts_as_dead() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        assert!(is_alive(pid));

        send_signal(pid, Signal::SIGKILL).unwrap();
        // Exited but not reaped: a zombie until wait() below
        let mut dead = false;
        for _ in 0..50 {
            if !is_alive(pid) {
                dead = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(dead, "killed child should not be reported alive");
        child.wait().unwrap();
    }

    #[test]
    fn test_process_state_parsing() {
        assert_eq!(process_state("123 (sleep) S 1 2 3"), Some('S'));
        assert_eq!(process_state("123 (we ird) name) Z 1 2"), Some('Z'));
        assert_eq!(process_state("garbage"), None);
    }
}
