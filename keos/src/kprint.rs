//! Kernel print utilities.
//!
//! Messages are handed to the [`log`] facade under the `keos` target; the
//! logger installed by the kernel decides where they end up (serial console,
//! ring buffer, test output).

/// Display an information message.
///
/// Use the format! syntax to write data to the kernel log.
#[macro_export]
macro_rules! info {
    () => ($crate::log::info!(target: "keos", ""));
    ($($arg:tt)*) => ($crate::log::info!(target: "keos", $($arg)*));
}

/// Display a warning message.
///
/// Use the format! syntax to write data to the kernel log.
#[macro_export]
macro_rules! warning {
    () => ($crate::log::warn!(target: "keos", ""));
    ($($arg:tt)*) => ($crate::log::warn!(target: "keos", $($arg)*));
}

/// Display a debug message.
///
/// Use the format! syntax to write data to the kernel log.
#[macro_export]
macro_rules! debug {
    () => ($crate::log::debug!(target: "keos", ""));
    ($($arg:tt)*) => ($crate::log::debug!(target: "keos", $($arg)*));
}
