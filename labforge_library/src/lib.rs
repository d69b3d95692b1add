//! Labforge Library
//!
//! Shared code and utilities that are not specific to any executable in the Labforge stack.

pub mod transaction;
pub mod utils;
#[macro_use]
pub mod macros;
pub mod clock;
pub mod config;
pub mod continuation;
pub mod logging;
pub mod threading;
pub mod tokio_utils;
pub mod types;

pub use labforge_derive::ToAny;
