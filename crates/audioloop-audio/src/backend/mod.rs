//! Device backends.

#[cfg(feature = "cpal")]
mod cpal_host;
pub mod memory;

#[cfg(feature = "cpal")]
pub use cpal_host::CpalBackend;
pub use memory::MemoryBackend;
