//! Graceful and forced stop flags, and the OS signals that set them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    force: AtomicBool,
}

/// Shared stop flags. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flags: Arc<Flags>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until a stop of any kind is requested.
    pub fn is_running(&self) -> bool {
        !self.flags.stop.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.flags.force.load(Ordering::SeqCst)
    }

    /// Stops dispatching new jobs and lets running ones finish.
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    /// Stops immediately; in-flight jobs are requeued.
    pub fn force(&self) {
        self.flags.force.store(true, Ordering::SeqCst);
        self.flags.stop.store(true, Ordering::SeqCst);
    }
}

/// Spawns the signal listener.
///
/// SIGTERM and SIGINT request a graceful stop; a second one, or SIGQUIT,
/// forces it.
pub fn install_signal_handlers(shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                _ = sigquit.recv() => {
                    warn!("Received SIGQUIT, forcing shutdown");
                    shutdown.force();
                    return;
                }
            };
            if shutdown.is_running() {
                info!(signal = name, "Received signal, initiating graceful shutdown");
                shutdown.request_stop();
            } else {
                warn!(signal = name, "Received second signal, forcing shutdown");
                shutdown.force();
                return;
            }
        }
    }))
}
