//! `camwatch-core`: foundation primitives shared by the job subsystem.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns).

pub mod clock;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id::JobId;
