//! Device-prefixed logging macros.
//!
//! Every message goes to the `devlink` target and starts with the device name.

/// Debug message about a device, only compiled in debug mode.
macro_rules! dev_dbg {
    ($dev:expr, $($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            use log::{log, Level};
            log!(target: "devlink", Level::Debug, "{}: {}", $dev.name(), format_args!($($arg)+))
        }
    };
}

macro_rules! dev_info {
    ($dev:expr, $($arg:tt)+) => {{
        use log::{log, Level};
        log!(target: "devlink", Level::Info, "{}: {}", $dev.name(), format_args!($($arg)+))
    }};
}

macro_rules! dev_warn {
    ($dev:expr, $($arg:tt)+) => {{
        use log::{log, Level};
        log!(target: "devlink", Level::Warn, "{}: {}", $dev.name(), format_args!($($arg)+))
    }};
}
