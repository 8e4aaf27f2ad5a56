// src/macros.rs
//
// Crate-internal logging.
//
// Every level funnels through `emit!`:
//
// `logging` feature enabled  → a `tracing` event at that level
// `logging` feature disabled → errors go to stderr; other levels become
//                              dead code that still type-checks its
//                              arguments, so values only logged are not
//                              reported as unused
//
// Never pass a `Token` value to these macros. Keys and operation ids are fine.
//

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! emit {
    ($level:ident, $($arg:tt)*) => {
        tracing::event!(tracing::Level::$level, $($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! emit {
    (ERROR, $($arg:tt)*) => {
        eprintln!("esub: {}", format_args!($($arg)*))
    };
    ($level:ident, $($arg:tt)*) => {
        if false {
            let _ = format!($($arg)*);
        }
    };
}

macro_rules! log_error {
    ($($arg:tt)*) => { $crate::macros::emit!(ERROR, $($arg)*) };
}

macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::macros::emit!(WARN, $($arg)*) };
}

macro_rules! log_info {
    ($($arg:tt)*) => { $crate::macros::emit!(INFO, $($arg)*) };
}

macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::macros::emit!(DEBUG, $($arg)*) };
}

pub(crate) use emit;
pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
