//! Token bucket admission control and per-key state management.

mod bucket;
mod clock;
mod limiter;
mod sweeper;

pub use bucket::{BucketState, Decision};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::Limiter;
pub use sweeper::Sweeper;
