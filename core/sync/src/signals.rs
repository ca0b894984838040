//! Shutdown signal handling.
//!
//! SIGINT/SIGTERM flip a shared flag; the supervisor loop observes it within
//! one scheduler slice, so a pending reconnect wait never delays shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_signal: libc::c_int) {
    // Only the atomic store is allowed here; anything else is not
    // async-signal-safe.
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Registers the handlers and returns the flag they flip.
pub fn install() -> Arc<AtomicBool> {
    let flag = Arc::clone(SHUTDOWN.get_or_init(|| Arc::new(AtomicBool::new(false))));
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
    flag
}
