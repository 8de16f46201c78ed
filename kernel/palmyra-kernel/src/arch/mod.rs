//! Architecture primitives: typed port I/O, MMIO accessors, and the handful
//! of special instructions the kernel core needs.

pub mod instructions;
pub mod mmio;
pub mod port;

pub use port::{Port, PortIo, PortRead, PortWrite, X86PortIo};
