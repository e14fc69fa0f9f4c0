use std::io;

use thiserror::Error;

use crate::ibv::{QpAttrMask, QpState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("ibv internal error: {0}")]
    Os(#[from] io::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid QP transition {from:?} -> {to:?}")]
    InvalidTransition { from: QpState, to: QpState },
    #[error("QP transition to {to:?} is missing attributes {missing:?}")]
    MissingAttributes { to: QpState, missing: QpAttrMask },
}

impl Error {
    #[inline]
    pub fn from_errno(errno: i32) -> Self {
        Error::Os(io::Error::from_raw_os_error(errno))
    }

    /// The errno a kernel verbs call would have reported for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Os(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotFound(_) => libc::ENODEV,
            Error::InvalidTransition { .. } | Error::MissingAttributes { .. } => libc::EINVAL,
        }
    }
}
