//! Interrupt handling.
//!
//! The signal handler only flips an atomic flag; all real work happens at
//! loop-top checks on the main thread, which turn the flag into a fatal
//! error so the normal cleanup path runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};

static INTERRUPTED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Register SIGINT/SIGTERM/SIGQUIT to set the interrupt flag. Call once at
/// process start.
pub fn install_interrupt_handlers() -> anyhow::Result<()> {
    for sig in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(sig, Arc::clone(&INTERRUPTED))?;
    }
    Ok(())
}

/// True once any of the registered signals has been received.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Error raised at loop tops when the interrupt flag is observed.
#[derive(Debug, thiserror::Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Check the flag and fail if it is set. Suspension points (WAL scan, file
/// copy, archive polling) call this at every iteration.
pub fn check_interrupt() -> Result<(), Interrupted> {
    if interrupted() {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub fn set_interrupted_for_tests(value: bool) {
    INTERRUPTED.store(value, Ordering::Relaxed);
}
