use core::arch::asm;

const EFLAGS_IF: usize = 1 << 9;

#[derive(Debug, Clone, Copy)]
pub struct State {
    enabled: bool,
}

impl State {
    pub const fn new() -> Self {
        Self { enabled: false }
    }
}

fn read_flags() -> usize {
    let flags: usize;
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe {
                asm!("pushfq", "pop {rd}", rd = out(reg) flags);
            }
        } else {
            unsafe {
                asm!("pushfd", "pop {rd}", rd = out(reg) flags);
            }
        }
    }
    flags
}

pub fn read_and_disable() -> State {
    let flags = read_flags();
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
    State {
        enabled: (flags & EFLAGS_IF) != 0,
    }
}

pub fn is_enabled() -> bool {
    (read_flags() & EFLAGS_IF) != 0
}

pub fn enable() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

pub fn restore(state: State) {
    assert!(!is_enabled());
    if state.enabled {
        enable();
    }
}
