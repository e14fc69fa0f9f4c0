//! SMC-R style RDMA link layer.
//!
//! Discovers RDMA devices, sets up their completion queues and event handling, creates links
//! (a protection domain plus a reliable-connection queue pair) grouped into link groups, drives
//! each link's queue pair to a ready state, prepares buffers for DMA and remote access, and
//! tears links down when ports fail or devices disappear.
//!
//! All hardware access goes through [`rdma::Verbs`].

pub mod buf;
pub mod config;
pub mod systemid;

mod device;
mod error;
mod event;
mod ib;
mod lgr;
mod link;
mod resource;
mod workqueue;
mod wr;

pub use buf::BufferSlot;
pub use device::{DeviceId, DeviceInfo, PortStatus};
pub use error::Error;
pub use ib::{SmcIb, LOCAL_SYSTEMID};
pub use lgr::{LgrId, Role};
pub use link::{LinkId, LinkInfo, LinkRef, PeerInfo};
pub use systemid::SystemId;

pub type Result<T> = std::result::Result<T, Error>;
