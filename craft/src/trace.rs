//! Feature-gated tracing macros.
//!
//! Every toggle here compiles to nothing unless its Cargo feature is enabled,
//! so a default build carries zero tracing overhead. This replaces the
//! `#define` / `#undef` toggles of the original implementation with explicit,
//! composable build flags.

#[macro_export]
macro_rules! trace_parser {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace_parser")]
        eprintln!("[parser] {}", format!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_interpreter {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace_interpreter")]
        eprintln!("[vm] {}", format!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_interpreter_stack {
    ($($arg:tt)*) => {
        #[cfg(feature = "trace_interpreter_stack")]
        eprintln!("[stack] {}", format!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_gc {
    ($($arg:tt)*) => {
        #[cfg(feature = "gc_log")]
        eprintln!("[gc] {}", format!($($arg)*));
    };
}
