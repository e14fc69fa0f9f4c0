//! Plain-data verbs types: handles, attributes, events.
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u64);

impl Handle {
    pub const INVALID: Handle = Handle(u64::MAX);
}

assert_eq_size!(Handle, u64);

pub trait AsHandle {
    #[must_use]
    fn as_handle(&self) -> Handle;
}

macro_rules! verbs_object {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Handle);

        impl AsHandle for $name {
            #[inline]
            fn as_handle(&self) -> Handle {
                self.0
            }
        }
    };
}

verbs_object!(
    /// An opened RDMA device.
    DeviceHandle
);
verbs_object!(CompletionQueue);
verbs_object!(ProtectionDomain);
verbs_object!(QueuePair);
verbs_object!(MemoryRegion);
verbs_object!(
    /// Returned by `Verbs::register_event_handler`, consumed by `unregister_event_handler`.
    EventHandlerToken
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// IB channel adapter.
    Ca,
    Switch,
    Router,
    Rnic,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DeviceAttr {
    pub node_type: NodeType,
    pub phys_port_cnt: u8,
    pub max_cqe: u32,
    pub max_qp_wr: u32,
    pub local_dma_lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    #[default]
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Mtu {
    #[serde(rename = "256")]
    Mtu256 = 1,
    #[serde(rename = "512")]
    Mtu512 = 2,
    #[default]
    #[serde(rename = "1024")]
    Mtu1024 = 3,
    #[serde(rename = "2048")]
    Mtu2048 = 4,
    #[serde(rename = "4096")]
    Mtu4096 = 5,
}

impl Mtu {
    /// Decode the IB wire encoding (1..=5).
    pub fn from_ib(v: u8) -> Option<Mtu> {
        match v {
            1 => Some(Mtu::Mtu256),
            2 => Some(Mtu::Mtu512),
            3 => Some(Mtu::Mtu1024),
            4 => Some(Mtu::Mtu2048),
            5 => Some(Mtu::Mtu4096),
            _ => None,
        }
    }

    #[inline]
    pub fn bytes(self) -> usize {
        128 << (self as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkLayer {
    #[default]
    Infiniband,
    Ethernet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    pub max_mtu: Mtu,
    pub active_mtu: Mtu,
    pub gid_tbl_len: u32,
    pub lid: u16,
    pub link_layer: LinkLayer,
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// The RoCE GID derived from a MAC address (link-local, EUI-64).
    pub fn from_mac(mac: MacAddr) -> Self {
        let m = mac.0;
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[8] = m[0] ^ 0x02;
        raw[9] = m[1];
        raw[10] = m[2];
        raw[11] = 0xff;
        raw[12] = 0xfe;
        raw[13] = m[3];
        raw[14] = m[4];
        raw[15] = m[5];
        Gid(raw)
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<String> = self
            .0
            .chunks(2)
            .map(|c| format!("{:02x}{:02x}", c[0], c[1]))
            .collect();
        write!(f, "{}", words.join(":"))
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl std::str::FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = s.split(':');
        for b in mac.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("short MAC address: {}", s))?;
            *b = u8::from_str_radix(part, 16).map_err(|e| format!("{}: {}", s, e))?;
        }
        if parts.next().is_some() {
            return Err(format!("long MAC address: {}", s));
        }
        Ok(MacAddr(mac))
    }
}

/// One entry of a port's GID table together with the MAC of the netdev it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GidEntry {
    pub gid: Gid,
    /// `None` when no network device backs this GID.
    pub ndev_mac: Option<MacAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    /// Ready to receive.
    Rtr,
    /// Ready to send.
    Rts,
    /// Send queue drained.
    Sqd,
    /// Send queue error.
    Sqe,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// Reliable connection.
    Rc,
    /// Unreliable datagram.
    Ud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigType {
    AllWr,
    ReqWr,
}

bitflags! {
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b0000_0001;
        const REMOTE_WRITE = 0b0000_0010;
        const REMOTE_READ = 0b0000_0100;
        const REMOTE_ATOMIC = 0b0000_1000;
    }

    /// Selects which fields of a [`QpAttr`] a modify call applies.
    #[derive(Default)]
    pub struct QpAttrMask: u32 {
        const STATE = 1 << 0;
        const CUR_STATE = 1 << 1;
        const EN_SQD_ASYNC_NOTIFY = 1 << 2;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const QKEY = 1 << 6;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const ALT_PATH = 1 << 14;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const PATH_MIG_STATE = 1 << 18;
        const CAP = 1 << 19;
        const DEST_QPN = 1 << 20;
    }
}

impl QpAttrMask {
    /// Attributes a reliable-connection QP must be given when moving from `from` to `to`.
    pub fn required(from: QpState, to: QpState) -> QpAttrMask {
        match (from, to) {
            (QpState::Reset, QpState::Init) => {
                QpAttrMask::STATE
                    | QpAttrMask::PKEY_INDEX
                    | QpAttrMask::PORT
                    | QpAttrMask::ACCESS_FLAGS
            }
            (QpState::Init, QpState::Rtr) => {
                QpAttrMask::STATE
                    | QpAttrMask::AV
                    | QpAttrMask::PATH_MTU
                    | QpAttrMask::DEST_QPN
                    | QpAttrMask::RQ_PSN
                    | QpAttrMask::MAX_DEST_RD_ATOMIC
                    | QpAttrMask::MIN_RNR_TIMER
            }
            (QpState::Rtr, QpState::Rts) => {
                QpAttrMask::STATE
                    | QpAttrMask::SQ_PSN
                    | QpAttrMask::TIMEOUT
                    | QpAttrMask::RETRY_CNT
                    | QpAttrMask::RNR_RETRY
                    | QpAttrMask::MAX_QP_RD_ATOMIC
            }
            _ => QpAttrMask::STATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// RoCE address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhAttr {
    pub port_num: u8,
    pub grh: GlobalRoute,
    pub dmac: MacAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpCap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub path_mtu: Mtu,
    pub qp_access_flags: AccessFlags,
    pub pkey_index: u16,
    pub port_num: u8,
    pub ah_attr: AhAttr,
    pub dest_qp_num: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub max_dest_rd_atomic: u8,
    pub max_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub cap: QpCap,
}

pub type QpEventHandler = Arc<dyn Fn(&AsyncEvent) + Send + Sync>;

#[derive(Clone)]
pub struct QpInitAttr {
    pub send_cq: CompletionQueue,
    pub recv_cq: CompletionQueue,
    pub cap: QpCap,
    pub sq_sig_type: SigType,
    pub qp_type: QpType,
    /// Invoked in event context for affiliated asynchronous errors of this QP.
    pub event_handler: Option<QpEventHandler>,
}

impl fmt::Debug for QpInitAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QpInitAttr")
            .field("send_cq", &self.send_cq)
            .field("recv_cq", &self.recv_cq)
            .field("cap", &self.cap)
            .field("sq_sig_type", &self.sq_sig_type)
            .field("qp_type", &self.qp_type)
            .field("event_handler", &self.event_handler.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqInitAttr {
    pub cqe: u32,
    pub comp_vector: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqNotify {
    Solicited,
    NextComp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CqErr,
    QpFatal,
    QpReqErr,
    QpAccessErr,
    CommEst,
    SqDrained,
    PathMig,
    PathMigErr,
    DeviceFatal,
    PortActive,
    PortErr,
    LidChange,
    PkeyChange,
    SmChange,
    SrqErr,
    SrqLimitReached,
    QpLastWqeReached,
    ClientReregister,
    GidChange,
}

/// The object an asynchronous event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventElement {
    Device,
    Port(u8),
    Qp(QueuePair),
    Cq(CompletionQueue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEvent {
    pub device: DeviceHandle,
    pub kind: EventKind,
    pub element: EventElement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmaDirection {
    /// The device reads from host memory.
    ToDevice,
    /// The device writes into host memory.
    FromDevice,
    Bidirectional,
}

impl DmaDirection {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One scatter-gather element: a CPU-visible span plus the DMA span it is mapped to.
///
/// A zero `dma_address` means the element is not mapped; a zero `dma_length` terminates the
/// mapped part of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SgEntry {
    pub addr: u64,
    pub length: u32,
    pub dma_address: u64,
    pub dma_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}
