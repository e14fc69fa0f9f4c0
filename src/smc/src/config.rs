//! Fixed protocol and resource constants.
//!
//! None of these are tunable at runtime; peers rely on the transport timers having exactly
//! these values.
use static_assertions::const_assert;

/// Ports per device the link layer tracks.
pub const SMC_MAX_PORTS: usize = 2;

/// Work request buffers per link and direction.
pub const SMC_WR_BUF_CNT: u32 = 16;
/// Size of one work request buffer in bytes.
pub const SMC_WR_BUF_SIZE: u32 = 48;
/// Depth of the per-device send and receive completion queues.
pub const SMC_WR_MAX_CQE: u32 = 32768;
pub const SMC_IB_MAX_SEND_SGE: u32 = 2;

pub const SMC_QP_MIN_RNR_TIMER: u8 = 5;
/// Local ack timeout, 4096 * 2^timeout usec.
pub const SMC_QP_TIMEOUT: u8 = 15;
/// 7 means infinite.
pub const SMC_QP_RETRY_CNT: u8 = 7;
/// 7 means infinite.
pub const SMC_QP_RNR_RETRY: u8 = 7;
/// Incoming and outstanding RDMA read/atomic operations per QP.
pub const SMC_QP_MAX_RD_ATOMIC: u8 = 1;

/// Smallest buffer, size class 0.
pub const SMC_BUF_MIN_SIZE: usize = 16384;
/// Number of buffer size classes.
pub const SMC_RMBE_SIZES: u8 = 16;
pub const SMC_PAGE_SIZE: usize = 4096;

/// Threads serving deferred port-event work for all devices.
pub const SMC_WQ_THREADS: usize = 2;

const_assert!(SMC_MAX_PORTS <= 64);
const_assert!(SMC_BUF_MIN_SIZE % SMC_PAGE_SIZE == 0);
