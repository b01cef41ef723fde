//! Target process exit detection

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::domain::Pid;
use crate::engine::live;

/// Reports whether a process is still running
pub type LivenessProbe = Arc<dyn Fn(Pid) -> bool + Send + Sync>;

/// Probe that checks for `/proc/<pid>`
#[must_use]
pub fn proc_liveness() -> LivenessProbe {
    Arc::new(|pid: Pid| live::process_alive(pid.0))
}

/// Polls a process and runs a callback once when it exits
///
/// Dropping the watcher stops it; the callback never runs after that.
pub(crate) struct ExitWatcher {
    stop: Arc<AtomicBool>,
}

impl ExitWatcher {
    pub(crate) fn spawn<F>(
        pid: Pid,
        interval: Duration,
        probe: LivenessProbe,
        on_exit: F,
    ) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        thread::Builder::new().name(format!("heapscope-watch-{}", pid.0)).spawn(move || {
            while !flag.load(Ordering::Acquire) {
                if !probe(pid) {
                    if !flag.load(Ordering::Acquire) {
                        info!("{pid} exited");
                        on_exit();
                    }
                    return;
                }
                thread::sleep(interval);
            }
            debug!("Stopped watching {pid}");
        })?;
        Ok(Self { stop })
    }
}

impl Drop for ExitWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_exit_fires_once() {
        let (tx, rx) = mpsc::channel();
        let probe: LivenessProbe = Arc::new(|_: Pid| false);
        let _watcher = ExitWatcher::spawn(Pid(1), Duration::from_millis(5), probe, move || {
            tx.send(()).unwrap();
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_dropped_watcher_never_fires() {
        let (tx, rx) = mpsc::channel::<()>();
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let probe: LivenessProbe = Arc::new(move |_: Pid| flag.load(Ordering::Acquire));
        let watcher =
            ExitWatcher::spawn(Pid(1), Duration::from_millis(5), probe, move || {
                let _ = tx.send(());
            })
            .unwrap();
        drop(watcher);
        alive.store(false, Ordering::Release);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
