//! Logging initialization for binaries and tests.

/// Initializes the global logger from the environment (`RUST_LOG`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let _ = env_logger::builder().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        log::debug!("logger initialized twice without panicking");
    }
}
