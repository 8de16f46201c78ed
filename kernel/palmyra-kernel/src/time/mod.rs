//! Timing: HPET driver, microsecond delays, TSC calibration.

pub mod hpet;

pub use hpet::Hpet;
