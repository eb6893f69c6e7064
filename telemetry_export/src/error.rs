use std::sync::atomic::{AtomicBool, Ordering};

/// Whether to log (verbose) error output.
/// Use the `DEBUG` env var or `--debug` to enable it.
static ERROR_LOGGER: AtomicBool = AtomicBool::new(false);

pub fn debug_error_enabled(enabled: bool) {
    ERROR_LOGGER.store(enabled, Ordering::Relaxed);
}

/// Logs an error, including its cause chain when verbose errors are enabled
pub fn debug_error(err: anyhow::Error) {
    tracing::warn!("{}", err);
    if ERROR_LOGGER.load(Ordering::Relaxed) {
        for err in err.chain().skip(1) {
            tracing::warn!("caused by: {}", err);
        }
    }
}
