use std::io;

use thiserror::Error;

use rdma::{DeviceHandle, DmaDirection, QpState};

use crate::device::DeviceId;
use crate::lgr::LgrId;
use crate::resource::Error as ResourceError;

#[derive(Debug, Error)]
pub enum Error {
    // Resource exhaustion. Reported to the caller after rolling back the same setup call.
    #[error("Failed to create completion queue: {0}")]
    CreateCq(rdma::Error),
    #[error("Failed to register event handler: {0}")]
    EventHandler(rdma::Error),
    #[error("Failed to allocate protection domain: {0}")]
    AllocPd(rdma::Error),
    #[error("Failed to create queue pair: {0}")]
    CreateQp(rdma::Error),
    #[error("Failed to allocate memory region: {0}")]
    AllocMr(rdma::Error),
    #[error("Failed to allocate buffer memory: {0}")]
    Alloc(io::Error),
    #[error("Invalid buffer size class {0}")]
    BufferSize(u8),

    // Mapping failures.
    #[error("No DMA segment could be mapped")]
    NoDmaSegments,
    #[error("Memory region maps {mapped} segments, expected exactly one")]
    FragmentedRegion { mapped: usize },
    #[error("Buffer is DMA-mapped {dir:?} for {device:?}")]
    DmaMismatch {
        device: DeviceHandle,
        dir: DmaDirection,
    },

    // State transition failures. The link stays in the last state it reached.
    #[error("QP transition to {to:?} failed: {source}")]
    Transition { to: QpState, source: rdma::Error },
    #[error("Link is in {from:?}, cannot move to {to:?}")]
    InvalidState { from: QpState, to: QpState },
    #[error("Failed to arm receive completion queue: {0}")]
    NotifyCq(rdma::Error),
    #[error("Failed to post receive buffer: {0}")]
    PostRecv(rdma::Error),

    #[error("Port {port} of device {device} is not active")]
    PortDown { device: DeviceId, port: u8 },
    #[error("Invalid port number {0}")]
    InvalidPort(u8),
    #[error("No network device behind port {0}")]
    NoNetDevice(u8),
    #[error("Device {0} has been removed")]
    DeviceGone(DeviceId),
    #[error("Device {0} is not set up")]
    NotInitialized(DeviceId),
    #[error("Link group {0} has been terminated")]
    Terminated(LgrId),
    #[error("Resource not found in table")]
    NotFound,
    #[error("Resource exists in table")]
    Exists,
    #[error("Work queue: {0}")]
    WorkQueue(io::Error),
    #[error("ibv internal error: {0}")]
    Verbs(#[from] rdma::Error),
}

impl From<ResourceError> for Error {
    fn from(other: ResourceError) -> Self {
        match other {
            ResourceError::NotFound => Error::NotFound,
            ResourceError::Exists => Error::Exists,
        }
    }
}

impl Error {
    /// Mapping failures mean the buffer could not be described to the device, as opposed to the
    /// device rejecting an operation.
    #[inline]
    pub fn is_mapping(&self) -> bool {
        matches!(self, Error::NoDmaSegments | Error::FragmentedRegion { .. })
    }

    /// The errno-style code of the failing step.
    pub fn errno(&self) -> i32 {
        match self {
            Error::CreateCq(e)
            | Error::EventHandler(e)
            | Error::AllocPd(e)
            | Error::CreateQp(e)
            | Error::AllocMr(e)
            | Error::NotifyCq(e)
            | Error::PostRecv(e)
            | Error::Verbs(e)
            | Error::Transition { source: e, .. } => e.errno(),
            Error::Alloc(e) | Error::WorkQueue(e) => e.raw_os_error().unwrap_or(libc::ENOMEM),
            Error::NoDmaSegments => libc::ENOMEM,
            Error::FragmentedRegion { .. }
            | Error::DmaMismatch { .. }
            | Error::InvalidState { .. }
            | Error::InvalidPort(_)
            | Error::BufferSize(_) => libc::EINVAL,
            Error::PortDown { .. } => libc::ENETDOWN,
            Error::NoNetDevice(_) | Error::DeviceGone(_) | Error::NotInitialized(_) => libc::ENODEV,
            Error::Terminated(_) => libc::ECONNRESET,
            Error::NotFound => libc::ENOENT,
            Error::Exists => libc::EEXIST,
        }
    }
}
