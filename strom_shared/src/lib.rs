mod config;
mod debug_info;
pub mod handle;

pub use config::*;
pub use debug_info::*;
pub use handle::{Handle, SlotArena};

pub use ahash;
pub use byteorder;
pub use chrono;
pub use crossbeam_channel;
pub use derive_where;
pub use indoc;
pub use log;
pub use nalgebra;
pub use num_cpus;
pub use parking_lot;
pub use rand;
pub use serde_yaml;
pub use spin_sleep;
pub use thiserror;
pub use thread_id;
pub use tracy_client;
pub use tracy_client::span;

/// Whether the `assertions` feature of this crate is active.
pub const ASSERTIONS_ENABLED: bool = cfg!(feature = "assertions");

/// Asserts only when the `assertions` feature is active.
///
/// Used in code that runs for every transfer fragment where the checks would be too expensive.
#[macro_export]
macro_rules! assert {
    ($($arg:tt)*) => {
        if $crate::ASSERTIONS_ENABLED {
            std::assert!($($arg)*);
        }
    };
}
