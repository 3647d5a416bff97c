//! Software interrupt flag for targets without privileged interrupt control
//! (host test builds, unsupported architectures). Keeps the nesting logic in
//! `super` fully exercisable off-target.

use core::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy)]
pub struct State {
    enabled: bool,
}

impl State {
    pub const fn new() -> Self {
        Self { enabled: false }
    }
}

pub fn read_and_disable() -> State {
    State {
        enabled: ENABLED.swap(false, Ordering::AcqRel),
    }
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

pub fn enable() {
    ENABLED.store(true, Ordering::Release);
}

pub fn restore(state: State) {
    assert!(!is_enabled());
    if state.enabled {
        ENABLED.store(true, Ordering::Release);
    }
}
