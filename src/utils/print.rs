//! Helper macros for logging (console printing).
//!
//! Every macro takes a prefix expression before the `;`, typically the
//! replica or client ID, so that multiple endpoints running within the same
//! process (e.g., in tests) produce distinguishable lines.

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # #[macro_use] extern crate canopy;
/// # let (id, peer) = (0, 1);
/// pf_trace!(id; "got PrepareOk <- {}", peer);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # #[macro_use] extern crate canopy;
/// # let (id, op) = (0, 1);
/// pf_debug!(id; "broadcast Prepare for op {}", op);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # #[macro_use] extern crate canopy;
/// # let (id, view) = (0, 1);
/// pf_info!(id; "becoming master @ view {}", view);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # #[macro_use] extern crate canopy;
/// # let (id, nonce) = (0, 1);
/// pf_warn!(id; "recovery stalled, retrying nonce {}", nonce);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # #[macro_use] extern crate canopy;
/// # let (id, err) = (0, "boom");
/// pf_error!(id; "error handling peer request: {}", err);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `CanopyError` containing
/// the string.
///
/// Example:
/// ```no_run
/// # #[macro_use] extern crate canopy;
/// # let (id, index) = (0, 1);
/// let e: Result<(), canopy::CanopyError> = logged_err!(id; "log entry {} missing", index);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {{
        $crate::pf_error!($prefix; $fmt_str);
        Err($crate::utils::CanopyError(format!(
            concat!("({}) ", $fmt_str),
            $prefix
        )))
    }};

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {{
        $crate::pf_error!($prefix; $fmt_str, $($fmt_arg)*);
        Err($crate::utils::CanopyError(format!(
            concat!("({}) ", $fmt_str),
            $prefix, $($fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::CanopyError;

    #[test]
    fn refusal_no_args() {
        assert_eq!(
            logged_err!(2; "not in normal mode"),
            Err::<(), CanopyError>(CanopyError(
                "(2) not in normal mode".into()
            ))
        );
        assert_eq!(
            logged_err!("client"; "not connected"),
            Err::<(), CanopyError>(CanopyError(
                "(client) not connected".into()
            ))
        );
    }

    #[test]
    fn refusal_with_args() {
        assert_eq!(
            logged_err!(0; "log entry {} missing", 42),
            Err::<(), CanopyError>(CanopyError(
                "(0) log entry 42 missing".into()
            ))
        );
    }
}
