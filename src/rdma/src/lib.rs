//! Verbs-level vocabulary shared by the SMC-R link layer and its providers.
//!
//! The link layer never touches an RNIC directly. Everything it needs from the hardware is
//! expressed by the [`Verbs`] trait: device and port queries, completion queues, protection
//! domains, queue pairs, memory regions, DMA mapping and asynchronous event delivery.
//! [`sim::SimVerbs`] is a software RNIC implementing the trait in-process.

pub mod ibv;
pub mod sim;
pub mod verbs;

mod error;

pub use error::Error;
pub use ibv::*;
pub use verbs::{EventHandler, Verbs};

pub type Result<T> = std::result::Result<T, Error>;
