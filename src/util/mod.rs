//! Small shared utilities: the monotonic clock and the entropy source.

pub mod clock;
pub mod rng;

pub use clock::{wire_time, Clock, ClockError, WIRE_TIME_LIMIT};
pub use rng::Entropy;
