//! Small helpers shared across modules

pub mod duration;

pub use duration::{format_duration, parse_duration, DurationParseError};
