/// Signal handling for graceful daemon shutdown.
///
/// SIGINT and SIGTERM both request a cooperative stop: the daemon finishes
/// any in-flight termination or restart sequence, then leaves its loop.
use crate::daemon::DaemonHandle;
use tokio::signal::unix::{signal, SignalKind};

/// Spawn a task that stops the daemon on the first SIGINT or SIGTERM.
pub fn install(handle: DaemonHandle) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(signal = name, "shutdown requested, finishing current cycle");
        handle.stop();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness;
    use nix::sys::signal::Signal;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_stops_daemon_handle() {
        let handle = DaemonHandle::new();
        handle.set_running(true);
        install(handle.clone()).unwrap();

        liveness::send_signal(std::process::id() as i32, Signal::SIGTERM).unwrap();

        for _ in 0..100 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_running());
    }
}
