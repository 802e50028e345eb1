//! Append-only watchdog log with rotation and graceful degradation.

pub mod sink;
