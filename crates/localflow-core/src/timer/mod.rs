//! Durable timer scheduling.
//!
//! - `clock` -- time source abstraction (system clock, manual clock for tests)
//! - `scheduler` -- binary min-heap of pending timers with lazy deletion

pub mod clock;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{TimerError, TimerScheduler};
