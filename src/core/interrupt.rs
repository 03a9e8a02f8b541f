//! User interruption (SIGINT) as a pollable flag.
//!
//! While a [`SigintGuard`] is alive, Ctrl-C sets a process-wide flag instead
//! of killing the process, so the batch orchestrator can stop its workers
//! before giving up. Once the last guard is dropped, SIGINT terminates the
//! process again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use signal_hook::consts::SIGINT;
use signal_hook::flag;

static ACTIVE_GUARDS: Mutex<usize> = Mutex::new(0);

fn sigint_received() -> &'static Arc<AtomicBool> {
    static RECEIVED: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    RECEIVED.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// True while no guard is alive: SIGINT then takes its default action.
fn sigint_terminates() -> &'static Arc<AtomicBool> {
    static TERMINATES: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    TERMINATES.get_or_init(|| Arc::new(AtomicBool::new(true)))
}

/// Register the SIGINT actions once per process.
fn register_handlers() -> bool {
    static REGISTERED: OnceLock<bool> = OnceLock::new();
    *REGISTERED.get_or_init(|| {
        let registered = flag::register_conditional_default(SIGINT, Arc::clone(sigint_terminates()))
            .and_then(|_| flag::register(SIGINT, Arc::clone(sigint_received())));
        match registered {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGINT handler");
                false
            }
        }
    })
}

/// Where an interruption request comes from.
#[derive(Debug, Clone, Default)]
pub enum Interrupt {
    /// SIGINT delivered to this process while a [`SigintGuard`] is installed.
    #[default]
    Signal,
    /// A flag set in-process, e.g. by an embedding application or a test.
    Manual(Arc<AtomicBool>),
}

impl Interrupt {
    pub fn manual() -> Self {
        Interrupt::Manual(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        match self {
            Interrupt::Signal => sigint_received().store(true, Ordering::SeqCst),
            Interrupt::Manual(flag) => flag.store(true, Ordering::SeqCst),
        }
    }

    pub fn is_requested(&self) -> bool {
        match self {
            Interrupt::Signal => sigint_received().load(Ordering::SeqCst),
            Interrupt::Manual(flag) => flag.load(Ordering::SeqCst),
        }
    }
}

/// Routes SIGINT to the [`Interrupt::Signal`] flag until dropped.
pub struct SigintGuard {
    registered: bool,
}

impl SigintGuard {
    pub fn install() -> Self {
        sigint_received().store(false, Ordering::SeqCst);
        let registered = register_handlers();
        let mut active = ACTIVE_GUARDS.lock();
        *active += 1;
        sigint_terminates().store(false, Ordering::SeqCst);
        Self { registered }
    }

    /// False when the handlers could not be registered; SIGINT then keeps
    /// its default action.
    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        let mut active = ACTIVE_GUARDS.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            sigint_terminates().store(true, Ordering::SeqCst);
        }
    }
}
