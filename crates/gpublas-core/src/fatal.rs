//! Unrecoverable failures.
//!
//! Backend execution failures, cleanup failures and startup configuration
//! errors cannot be reported through a BLAS entry point, which has no error
//! channel. They are logged as a `fatal` event and the process aborts.

use std::fmt::Display;

use gpublas_membrane::{LogEvent, LogLevel, Logger};

/// Log `message` under `domain` and abort.
pub fn fatal(logger: &Logger, domain: &str, message: impl Display) -> ! {
    logger.emit(
        &LogEvent::new(LogLevel::Fatal, "fatal")
            .with_symbol(domain)
            .with_message(message.to_string()),
    );
    std::process::abort()
}
