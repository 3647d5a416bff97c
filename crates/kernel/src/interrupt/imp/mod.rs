cfg_if::cfg_if! {
    if #[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_os = "none"))] {
        mod x86;
        pub use self::x86::*;
    } else {
        mod emulated;
        pub use self::emulated::*;
    }
}
