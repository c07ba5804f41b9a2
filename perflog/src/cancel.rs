// Cooperative cancellation for the sampling loops.
//
// The loop owns a token and checks it once per iteration.  The only OS glue is `cancel_on_signals`,
// which arranges for SIGTERM and SIGINT to set the token; both signals take the same path.

use anyhow::{bail, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// The handler can only reach the token through a static.  It does nothing but an atomic store.
static SIGNAL_TOKEN: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_shutdown_signal(_signo: libc::c_int) {
    if let Some(token) = SIGNAL_TOKEN.get() {
        token.cancel();
    }
}

/// Make SIGTERM and SIGINT cancel `token`.  Can be called once per process.

pub fn cancel_on_signals(token: &CancelToken) -> Result<()> {
    if SIGNAL_TOKEN.set(token.clone()).is_err() {
        bail!("Shutdown signals are already bound to a token");
    }
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only performs an atomic store through an already-initialized static.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

#[test]
fn test_cancel_token() {
    let token = CancelToken::new();
    let other = token.clone();
    assert!(!token.is_cancelled());
    other.cancel();
    assert!(token.is_cancelled());
    other.cancel();
    assert!(token.is_cancelled());
}
