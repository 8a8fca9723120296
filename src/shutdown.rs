use anyhow::Result;
use log::info;
use log::warn;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crate::orchestrator::Pause;

/// Cooperative cancellation flag shared between the signal listener and the
/// control loop.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn trigger(&self) {
        let (triggered, condvar) = &*self.inner;
        *triggered.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (triggered, _) = &*self.inner;
        *triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks for `duration` or until triggered. Returns true if triggered.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        // too far out to be represented, wait for the trigger only
        let deadline = Instant::now().checked_add(duration);
        let (triggered, condvar) = &*self.inner;
        let mut guard = triggered.lock().unwrap_or_else(PoisonError::into_inner);
        while !*guard {
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => condvar.wait(guard).unwrap_or_else(PoisonError::into_inner),
            };
        }
        *guard
    }
}

impl Pause for Shutdown {
    fn pause(&mut self, duration: Duration) -> bool {
        !self.wait_timeout(duration)
    }

    fn is_cancelled(&self) -> bool {
        self.is_triggered()
    }
}

/// Triggers `shutdown` on Ctrl+C, and on SIGTERM on unix.
pub fn listen_for_signals(shutdown: Shutdown) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name(String::from("signals"))
        .spawn(move || {
            runtime.block_on(wait_for_signal());
            shutdown.trigger();
        })?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down"),
        Err(e) => {
            warn!("Unable to listen for Ctrl+C: {}", e);
            // keep running without a handler
            std::future::pending::<()>().await
        }
    }
}
