//! Abort with diagnostic.
//!
//! Contract violations (compositor state-machine misuse, a broken batch
//! invariant) leave GPU command state that cannot be trusted, so they are not
//! reported as errors. [`fatal`] logs the message and the blamed call site,
//! then aborts the process. Unwinding is never used, so the failure cannot be
//! caught and turned into a recoverable error.
//!
//! Test builds panic instead of aborting so contract checks can be exercised
//! with `#[should_panic]`.

use std::fmt;
use std::panic::Location;

/// Log `message` and terminate the process.
///
/// The location reported is the caller's (`#[track_caller]`), so helpers that
/// validate state on behalf of a public method blame the method's caller.
#[track_caller]
#[cold]
#[inline(never)]
pub fn fatal(message: fmt::Arguments<'_>) -> ! {
    let location = Location::caller();
    tracing::error!(
        file = location.file(),
        line = location.line(),
        column = location.column(),
        "FATAL: {message}"
    );
    terminate(message, location)
}

#[cfg(not(test))]
fn terminate(message: fmt::Arguments<'_>, location: &Location<'_>) -> ! {
    // stderr may be the only channel left if no subscriber is installed.
    eprintln!("FATAL at {location}: {message}");
    std::process::abort()
}

#[cfg(test)]
fn terminate(message: fmt::Arguments<'_>, location: &Location<'_>) -> ! {
    panic!("FATAL at {location}: {message}")
}

/// `format!`-style wrapper around [`fatal`].
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::fatal(::std::format_args!($($arg)*))
    };
}
