pub mod backfill;
pub mod resample;
pub mod rolling;

pub use backfill::backfill;
pub use resample::{resample, BucketWindow};
pub use rolling::{tick, WindowState};
