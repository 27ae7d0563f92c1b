use std::{
    sync::Once,
    time::{Duration, Instant},
};

use strom_shared::{log::LevelFilter, spin_sleep};

pub mod fixtures;

pub use spectral;

static LOGGER: Once = Once::new();

/// Installs a logger for the tests. Can be called by every test because only the first call has an effect.
pub fn setup_logger() {
    LOGGER.call_once(|| {
        simple_logger::SimpleLogger::new()
            .with_level(LevelFilter::Info)
            .env()
            .init()
            .expect("failed to initialize the logger");
    });
}

/// Calls `step` and then checks `condition` until the condition holds or the `timeout` elapsed.
///
/// Returns whether the condition holds. This is used for observing the background threads
/// without sleeping for a fixed amount of time in the tests.
pub fn poll_until(timeout: Duration, mut step: impl FnMut(), mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        step();
        if condition() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        spin_sleep::sleep(Duration::from_millis(1));
    }
}

/// Same as [`poll_until`] but panics with the given `message` when the condition doesn't hold in time.
pub fn expect_within(timeout: Duration, step: impl FnMut(), condition: impl FnMut() -> bool, message: &str) {
    assert!(poll_until(timeout, step, condition), "timeout after {timeout:?}: {message}");
}
