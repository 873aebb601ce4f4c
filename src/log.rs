//! Logging shims.
//!
//! These forward to the `log` crate when the `log` feature is enabled. Without
//! it they still type-check their arguments but emit nothing.

#![allow(unused_macros)]

#[cfg(feature = "log")]
macro_rules! trace {
    ($($arg:tt)+) => { ::log::trace!($($arg)+) };
}

#[cfg(feature = "log")]
macro_rules! debug {
    ($($arg:tt)+) => { ::log::debug!($($arg)+) };
}

#[cfg(feature = "log")]
macro_rules! info {
    ($($arg:tt)+) => { ::log::info!($($arg)+) };
}

#[cfg(feature = "log")]
macro_rules! warn {
    ($($arg:tt)+) => { ::log::warn!($($arg)+) };
}

#[cfg(feature = "log")]
macro_rules! error {
    ($($arg:tt)+) => { ::log::error!($($arg)+) };
}

#[cfg(not(feature = "log"))]
macro_rules! discard {
    ($($arg:tt)+) => {
        if false {
            let _ = ::core::format_args!($($arg)+);
        }
    };
}

#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)+) => { discard!($($arg)+) };
}

#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)+) => { discard!($($arg)+) };
}

#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)+) => { discard!($($arg)+) };
}

#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)+) => { discard!($($arg)+) };
}

#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)+) => { discard!($($arg)+) };
}
