//! Background dirty-ring reaper.
//!
//! Ring entries accumulate while the guest runs; without periodic draining a busy vCPU would hit
//! ring-full exits constantly. The reaper wakes on a coarse fixed interval and drains every ring.
//! It skips a cycle entirely (keeps sleeping, not merely delaying) while the external dirty-rate
//! limiter is in service: the limiter does its own finer-grained per-vCPU reaping, and the
//! reaper's lock acquisition would interfere with it.
//!
//! The thread is owned by the engine and signalled and joined when the engine drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::engine::{self, EngineShared};

struct ReaperCtl {
    stop: Mutex<bool>,
    wake: Condvar,
    iterations: AtomicU64,
}

pub(crate) struct Reaper {
    ctl: Arc<ReaperCtl>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn spawn(shared: Arc<EngineShared>) -> Self {
        let ctl = Arc::new(ReaperCtl {
            stop: Mutex::new(false),
            wake: Condvar::new(),
            iterations: AtomicU64::new(0),
        });
        let thread_ctl = ctl.clone();
        let interval = shared.config.reaper_interval;
        let handle = std::thread::Builder::new()
            .name("hv-reaper".into())
            .spawn(move || loop {
                let stopped = thread_ctl
                    .stop
                    .lock()
                    .expect("reaper stop lock poisoned");
                let (stopped, _) = thread_ctl
                    .wake
                    .wait_timeout(stopped, interval)
                    .expect("reaper stop lock poisoned");
                if *stopped {
                    break;
                }
                drop(stopped);

                if shared.limiter.in_service() {
                    continue;
                }
                match engine::reap_all(&shared) {
                    Ok(pages) => {
                        if pages > 0 {
                            tracing::trace!(pages, "reaper drained dirty rings");
                        }
                    }
                    Err(err) => tracing::error!(%err, "reaper drain failed"),
                }
                thread_ctl.iterations.fetch_add(1, Ordering::Relaxed);
            })
            .expect("failed to spawn hv-reaper thread");
        Self {
            ctl,
            handle: Some(handle),
        }
    }

    pub(crate) fn iterations(&self) -> u64 {
        self.ctl.iterations.load(Ordering::Relaxed)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        *self.ctl.stop.lock().expect("reaper stop lock poisoned") = true;
        self.ctl.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
