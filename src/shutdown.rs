// Two-stage shutdown: the first signal asks the orchestrator to wind down,
// the second exits immediately

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces the process down
pub const FORCED_EXIT_CODE: i32 = 130;

/// What a received signal should lead to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Stop dispatching, drain, persist
    Graceful,
    /// Skip cleanup and exit now
    Force,
}

/// Shutdown state shared by the orchestrator and the signal handlers
#[derive(Clone)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
    signals_received: Arc<AtomicUsize>,
    /// Cancelled together with the flag, for async waiters
    token: CancellationToken,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            signals_received: Arc::new(AtomicUsize::new(0)),
            token: CancellationToken::new(),
        }
    }

    /// Request a graceful shutdown. Returns true for the first request.
    pub fn request_shutdown(&self) -> bool {
        let first = !self.shutdown_requested.swap(true, Ordering::SeqCst);
        if first {
            log::info!("Shutdown requested");
            self.token.cancel();
        }
        first
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Cancelled as soon as shutdown is requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Count a signal and decide what it means
    pub fn record_signal(&self) -> SignalAction {
        let previous = self.signals_received.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            self.request_shutdown();
            SignalAction::Graceful
        } else {
            SignalAction::Force
        }
    }

    fn handle_signal(&self, name: &str) {
        log::info!("Received {}", name);
        if self.record_signal() == SignalAction::Force {
            log::warn!("Second shutdown signal, exiting without cleanup");
            std::process::exit(FORCED_EXIT_CODE);
        }
        log::info!("Finishing in-flight work, send the signal again to force exit");
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => state.handle_signal("SIGINT (Ctrl+C)"),
                SIGTERM => state.handle_signal("SIGTERM"),
                SIGHUP => state.handle_signal("SIGHUP"),
                _ => {}
            }
        }
    });

    log::info!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || state.handle_signal("Ctrl+C"))
        .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("Signal handler registered (Ctrl+C)");
    Ok(())
}
