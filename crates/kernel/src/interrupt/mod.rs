//! Scoped interrupt control.
//!
//! Interrupt handlers allocate, so every mutation of shared kernel state
//! happens with interrupts masked. [`push_disabled`] hands out a [`Guard`];
//! guards nest, and only the outermost one restores the state the CPU was in
//! before the section was entered; an early return or panic inside the
//! section cannot leave interrupts off by accident.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

mod imp;

static STATE: IntrState = IntrState::new();

/// Disables interrupts and returns a guard for the critical section.
pub fn push_disabled() -> Guard {
    let state = imp::read_and_disable();
    STATE.push(state);
    Guard {
        _not_send: PhantomData,
    }
}

/// Whether the CPU currently accepts interrupts.
#[must_use]
pub fn is_enabled() -> bool {
    imp::is_enabled()
}

/// Turns interrupts on.
///
/// The boot sequence calls this once, after the devices and the heap are
/// ready.
///
/// # Panics
///
/// Panics when called inside a critical section.
pub fn enable() {
    assert_eq!(
        STATE.depth(),
        0,
        "enabling interrupts inside a critical section"
    );
    imp::enable();
}

/// Active critical section. Dropping the outermost guard restores the
/// interrupt state saved when the section was entered.
#[derive(Debug)]
pub struct Guard {
    _not_send: PhantomData<*mut ()>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(initial_state) = STATE.pop() {
            imp::restore(initial_state);
        }
    }
}

struct IntrState {
    disabled_depth: AtomicUsize,
    initial_state: UnsafeCell<imp::State>,
}

unsafe impl Sync for IntrState {}

impl IntrState {
    const fn new() -> Self {
        Self {
            disabled_depth: AtomicUsize::new(0),
            initial_state: UnsafeCell::new(imp::State::new()),
        }
    }

    fn depth(&self) -> usize {
        self.disabled_depth.load(Ordering::Relaxed)
    }

    fn push(&self, state: imp::State) {
        assert!(!is_enabled());
        let depth = self.disabled_depth.fetch_add(1, Ordering::Acquire);
        if depth == 0 {
            unsafe {
                *self.initial_state.get() = state;
            }
        }
    }

    fn pop(&self) -> Option<imp::State> {
        assert!(!is_enabled());
        let depth = self.disabled_depth.fetch_sub(1, Ordering::Release);
        if depth == 1 {
            unsafe { Some(*self.initial_state.get()) }
        } else {
            None
        }
    }
}
