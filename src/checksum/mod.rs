//! Checksum primitives: the rolling block sum and the truncated strong hash

pub mod rolling;
pub mod strong;

pub use rolling::{truncate_rsum, RollingSum};
pub use strong::{strong_matches, strong_sum, FileDigest, STRONG_SUM_LEN};
