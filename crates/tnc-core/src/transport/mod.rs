//! Transport layer module.

pub mod mock;
pub mod serial;
pub mod traits;

pub use mock::{BootloaderFaults, BootloaderLog, MockTransport, SimulatedBootloader};
pub use serial::SerialTransport;
pub use traits::{Transport, TransportError};
