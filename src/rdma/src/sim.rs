//! A software RNIC.
//!
//! `SimVerbs` keeps every verbs object in tables behind one spin lock, applies the same QP state
//! rules a reliable-connection QP obeys on real hardware, and lets a test inject one-shot
//! failures, flip port states and deliver asynchronous events. Event handlers and the modify
//! hook are always invoked with the table lock released.
use std::sync::Arc;

use fnv::FnvHashMap as HashMap;

use crate::ibv::*;
use crate::verbs::{EventHandler, Verbs};
use crate::{Error, Result};

const SIM_PAGE_SIZE: u64 = 4096;
const SIM_IOVA_BASE: u64 = 0x1000_0000;
const SIM_MAX_CQE: u32 = 65536;
const SIM_MAX_QP_WR: u32 = 16384;
const SIM_GID_TBL_LEN: u32 = 16;

/// Operations a test can make fail once with [`SimVerbs::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    QueryPort,
    QueryGid,
    CreateCq,
    ReqNotifyCq,
    RegisterEventHandler,
    AllocPd,
    CreateQp,
    ModifyQp(QpState),
    PostRecv,
    DmaMap,
    AllocMr,
    MapMrSg,
}

#[derive(Debug, Clone)]
pub struct SimPortSpec {
    pub state: PortState,
    pub active_mtu: Mtu,
    /// MAC of the netdev bound to the port, `None` for a port without one.
    pub mac: Option<MacAddr>,
}

impl SimPortSpec {
    pub fn active(mac: MacAddr) -> Self {
        SimPortSpec {
            state: PortState::Active,
            active_mtu: Mtu::Mtu1024,
            mac: Some(mac),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub name: String,
    pub node_type: NodeType,
    pub ports: Vec<SimPortSpec>,
}

impl SimDeviceSpec {
    /// A RoCE adapter with one active port per MAC.
    pub fn roce(name: &str, macs: &[MacAddr]) -> Self {
        SimDeviceSpec {
            name: name.to_owned(),
            node_type: NodeType::Ca,
            ports: macs.iter().copied().map(SimPortSpec::active).collect(),
        }
    }
}

/// Live objects and call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub cqs: usize,
    pub pds: usize,
    pub qps: usize,
    pub mrs: usize,
    pub event_handlers: usize,
    pub dma_mappings: usize,
    pub mr_allocs: u64,
    pub dma_unmaps: u64,
    pub syncs_for_cpu: u64,
    pub syncs_for_device: u64,
    pub modify_qp_calls: u64,
}

/// Called at the start of every `modify_qp` with the QP and its requested state.
pub type ModifyHook = Arc<dyn Fn(QueuePair, QpState) + Send + Sync>;

struct SimPort {
    attr: PortAttr,
    mac: Option<MacAddr>,
}

struct SimDevice {
    name: String,
    node_type: NodeType,
    ports: Vec<SimPort>,
    present: bool,
}

struct SimCq {
    dev: DeviceHandle,
    armed: Option<CqNotify>,
}

struct SimQp {
    dev: DeviceHandle,
    pd: ProtectionDomain,
    send_cq: CompletionQueue,
    recv_cq: CompletionQueue,
    attr: QpAttr,
    handler: Option<QpEventHandler>,
    posted_recvs: u32,
}

struct SimMr {
    pd: ProtectionDomain,
    max_num_sg: u32,
    mapped: usize,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    next_iova: u64,
    devices: HashMap<Handle, SimDevice>,
    cqs: HashMap<Handle, SimCq>,
    pds: HashMap<Handle, DeviceHandle>,
    qps: HashMap<Handle, SimQp>,
    mrs: HashMap<Handle, SimMr>,
    handlers: HashMap<Handle, (DeviceHandle, EventHandler)>,
    dma: HashMap<u64, u32>,
    faults: HashMap<SimOp, i32>,
    stats: SimStats,
}

impl Inner {
    fn new_handle(&mut self) -> Handle {
        self.next_handle += 1;
        Handle(self.next_handle)
    }

    fn take_fault(&mut self, op: SimOp) -> Result<()> {
        match self.faults.remove(&op) {
            Some(errno) => {
                log::debug!("sim: injected failure for {:?}, errno {}", op, errno);
                Err(Error::from_errno(errno))
            }
            None => Ok(()),
        }
    }

    fn device(&self, dev: DeviceHandle) -> Result<&SimDevice> {
        match self.devices.get(&dev.0) {
            Some(d) if d.present => Ok(d),
            _ => Err(Error::NotFound("device")),
        }
    }

    fn port(&self, dev: DeviceHandle, port: u8) -> Result<&SimPort> {
        let d = self.device(dev)?;
        if port == 0 || port as usize > d.ports.len() {
            return Err(Error::from_errno(libc::EINVAL));
        }
        Ok(&d.ports[port as usize - 1])
    }
}

pub struct SimVerbs {
    inner: spin::Mutex<Inner>,
    modify_hook: spin::Mutex<Option<ModifyHook>>,
}

impl Default for SimVerbs {
    fn default() -> Self {
        SimVerbs::new()
    }
}

impl SimVerbs {
    pub fn new() -> Self {
        SimVerbs {
            inner: spin::Mutex::new(Inner {
                next_iova: SIM_IOVA_BASE,
                ..Default::default()
            }),
            modify_hook: spin::Mutex::new(None),
        }
    }

    pub fn add_device(&self, spec: SimDeviceSpec) -> DeviceHandle {
        let mut inner = self.inner.lock();
        let handle = DeviceHandle(inner.new_handle());
        let ports = spec
            .ports
            .into_iter()
            .map(|p| SimPort {
                attr: PortAttr {
                    state: p.state,
                    max_mtu: Mtu::Mtu4096,
                    active_mtu: p.active_mtu,
                    gid_tbl_len: SIM_GID_TBL_LEN,
                    lid: 0,
                    link_layer: LinkLayer::Ethernet,
                },
                mac: p.mac,
            })
            .collect();
        log::debug!("sim: add device {} as {:?}", spec.name, handle);
        inner.devices.insert(
            handle.0,
            SimDevice {
                name: spec.name,
                node_type: spec.node_type,
                ports,
                present: true,
            },
        );
        handle
    }

    /// Hot-unplug: the device disappears from `devices()` and rejects new calls.
    pub fn remove_device(&self, dev: DeviceHandle) {
        if let Some(d) = self.inner.lock().devices.get_mut(&dev.0) {
            d.present = false;
        }
    }

    pub fn device_by_name(&self, name: &str) -> Option<DeviceHandle> {
        self.inner
            .lock()
            .devices
            .iter()
            .find(|(_, d)| d.present && d.name == name)
            .map(|(h, _)| DeviceHandle(*h))
    }

    pub fn set_port_state(&self, dev: DeviceHandle, port: u8, state: PortState) {
        let mut inner = self.inner.lock();
        if let Some(p) = inner
            .devices
            .get_mut(&dev.0)
            .and_then(|d| d.ports.get_mut((port as usize).wrapping_sub(1)))
        {
            p.attr.state = state;
        }
    }

    pub fn set_port_mac(&self, dev: DeviceHandle, port: u8, mac: Option<MacAddr>) {
        let mut inner = self.inner.lock();
        if let Some(p) = inner
            .devices
            .get_mut(&dev.0)
            .and_then(|d| d.ports.get_mut((port as usize).wrapping_sub(1)))
        {
            p.mac = mac;
        }
    }

    /// Change a port's state and raise the matching port event.
    pub fn change_port_state(&self, dev: DeviceHandle, port: u8, state: PortState) {
        self.set_port_state(dev, port, state);
        let kind = if state == PortState::Active {
            EventKind::PortActive
        } else {
            EventKind::PortErr
        };
        self.dispatch(AsyncEvent {
            device: dev,
            kind,
            element: EventElement::Port(port),
        });
    }

    /// Deliver an asynchronous event.
    ///
    /// QP-affiliated events reach the QP's handler, everything else reaches the device's
    /// registered handlers.
    pub fn dispatch(&self, event: AsyncEvent) {
        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock();
            match event.element {
                EventElement::Qp(qp) => inner
                    .qps
                    .get(&qp.0)
                    .and_then(|q| q.handler.clone())
                    .into_iter()
                    .collect(),
                _ => inner
                    .handlers
                    .values()
                    .filter(|(dev, _)| *dev == event.device)
                    .map(|(_, h)| Arc::clone(h))
                    .collect(),
            }
        };
        log::trace!("sim: dispatch {:?} to {} handlers", event, handlers.len());
        for h in handlers {
            h(&event);
        }
    }

    /// Make the next call of `op` fail with `errno`.
    pub fn fail_next(&self, op: SimOp, errno: i32) {
        self.inner.lock().faults.insert(op, errno);
    }

    pub fn set_modify_hook(&self, hook: Option<ModifyHook>) {
        *self.modify_hook.lock() = hook;
    }

    pub fn stats(&self) -> SimStats {
        let inner = self.inner.lock();
        SimStats {
            cqs: inner.cqs.len(),
            pds: inner.pds.len(),
            qps: inner.qps.len(),
            mrs: inner.mrs.len(),
            event_handlers: inner.handlers.len(),
            dma_mappings: inner.dma.len(),
            ..inner.stats.clone()
        }
    }

    pub fn qp_state(&self, qp: QueuePair) -> Option<QpState> {
        self.inner.lock().qps.get(&qp.0).map(|q| q.attr.qp_state)
    }

    pub fn qp_attr(&self, qp: QueuePair) -> Option<QpAttr> {
        self.inner.lock().qps.get(&qp.0).map(|q| q.attr)
    }

    pub fn posted_recvs(&self, qp: QueuePair) -> Option<u32> {
        self.inner.lock().qps.get(&qp.0).map(|q| q.posted_recvs)
    }

    pub fn cq_armed(&self, cq: CompletionQueue) -> Option<CqNotify> {
        self.inner.lock().cqs.get(&cq.0).and_then(|c| c.armed)
    }

    pub fn mr_mapped(&self, mr: MemoryRegion) -> Option<usize> {
        self.inner.lock().mrs.get(&mr.0).map(|m| m.mapped)
    }
}

fn transition_allowed(from: QpState, to: QpState) -> bool {
    use QpState::*;
    matches!(
        (from, to),
        (_, Reset)
            | (_, Err)
            | (Reset, Init)
            | (Init, Init)
            | (Init, Rtr)
            | (Rtr, Rts)
            | (Rts, Rts)
            | (Rts, Sqd)
            | (Sqd, Sqd)
            | (Sqd, Rts)
    )
}

fn apply_qp_attr(dst: &mut QpAttr, src: &QpAttr, mask: QpAttrMask) {
    if mask.contains(QpAttrMask::ACCESS_FLAGS) {
        dst.qp_access_flags = src.qp_access_flags;
    }
    if mask.contains(QpAttrMask::PKEY_INDEX) {
        dst.pkey_index = src.pkey_index;
    }
    if mask.contains(QpAttrMask::PORT) {
        dst.port_num = src.port_num;
    }
    if mask.contains(QpAttrMask::AV) {
        dst.ah_attr = src.ah_attr;
    }
    if mask.contains(QpAttrMask::PATH_MTU) {
        dst.path_mtu = src.path_mtu;
    }
    if mask.contains(QpAttrMask::TIMEOUT) {
        dst.timeout = src.timeout;
    }
    if mask.contains(QpAttrMask::RETRY_CNT) {
        dst.retry_cnt = src.retry_cnt;
    }
    if mask.contains(QpAttrMask::RNR_RETRY) {
        dst.rnr_retry = src.rnr_retry;
    }
    if mask.contains(QpAttrMask::RQ_PSN) {
        dst.rq_psn = src.rq_psn;
    }
    if mask.contains(QpAttrMask::SQ_PSN) {
        dst.sq_psn = src.sq_psn;
    }
    if mask.contains(QpAttrMask::MAX_QP_RD_ATOMIC) {
        dst.max_rd_atomic = src.max_rd_atomic;
    }
    if mask.contains(QpAttrMask::MAX_DEST_RD_ATOMIC) {
        dst.max_dest_rd_atomic = src.max_dest_rd_atomic;
    }
    if mask.contains(QpAttrMask::MIN_RNR_TIMER) {
        dst.min_rnr_timer = src.min_rnr_timer;
    }
    if mask.contains(QpAttrMask::DEST_QPN) {
        dst.dest_qp_num = src.dest_qp_num;
    }
}

impl Verbs for SimVerbs {
    fn devices(&self) -> Result<Vec<DeviceHandle>> {
        let inner = self.inner.lock();
        let mut devs: Vec<_> = inner
            .devices
            .iter()
            .filter(|(_, d)| d.present)
            .map(|(h, _)| DeviceHandle(*h))
            .collect();
        devs.sort_by_key(|d| d.0);
        Ok(devs)
    }

    fn query_device(&self, dev: DeviceHandle) -> Result<DeviceAttr> {
        let inner = self.inner.lock();
        let d = inner.device(dev)?;
        Ok(DeviceAttr {
            node_type: d.node_type,
            phys_port_cnt: d.ports.len() as u8,
            max_cqe: SIM_MAX_CQE,
            max_qp_wr: SIM_MAX_QP_WR,
            local_dma_lkey: 0,
        })
    }

    fn query_port(&self, dev: DeviceHandle, port: u8) -> Result<PortAttr> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::QueryPort)?;
        Ok(inner.port(dev, port)?.attr.clone())
    }

    fn query_gid(&self, dev: DeviceHandle, port: u8, index: u32) -> Result<GidEntry> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::QueryGid)?;
        let p = inner.port(dev, port)?;
        if index >= p.attr.gid_tbl_len {
            return Err(Error::from_errno(libc::EINVAL));
        }
        Ok(GidEntry {
            gid: p.mac.map(Gid::from_mac).unwrap_or_default(),
            ndev_mac: p.mac,
        })
    }

    fn create_cq(&self, dev: DeviceHandle, attr: &CqInitAttr) -> Result<CompletionQueue> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::CreateCq)?;
        inner.device(dev)?;
        if attr.cqe == 0 || attr.cqe > SIM_MAX_CQE {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let cq = CompletionQueue(inner.new_handle());
        inner.cqs.insert(cq.0, SimCq { dev, armed: None });
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CompletionQueue) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .qps
            .values()
            .any(|q| q.send_cq == cq || q.recv_cq == cq)
        {
            return Err(Error::from_errno(libc::EBUSY));
        }
        inner
            .cqs
            .remove(&cq.0)
            .map(|_| ())
            .ok_or(Error::NotFound("cq"))
    }

    fn req_notify_cq(&self, cq: CompletionQueue, notify: CqNotify) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::ReqNotifyCq)?;
        let c = inner.cqs.get_mut(&cq.0).ok_or(Error::NotFound("cq"))?;
        c.armed = Some(notify);
        Ok(())
    }

    fn register_event_handler(
        &self,
        dev: DeviceHandle,
        handler: EventHandler,
    ) -> Result<EventHandlerToken> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::RegisterEventHandler)?;
        inner.device(dev)?;
        let token = EventHandlerToken(inner.new_handle());
        inner.handlers.insert(token.0, (dev, handler));
        Ok(token)
    }

    fn unregister_event_handler(&self, token: EventHandlerToken) -> Result<()> {
        self.inner
            .lock()
            .handlers
            .remove(&token.0)
            .map(|_| ())
            .ok_or(Error::NotFound("event handler"))
    }

    fn alloc_pd(&self, dev: DeviceHandle) -> Result<ProtectionDomain> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::AllocPd)?;
        inner.device(dev)?;
        let pd = ProtectionDomain(inner.new_handle());
        inner.pds.insert(pd.0, dev);
        Ok(pd)
    }

    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<()> {
        let mut inner = self.inner.lock();
        let in_use =
            inner.qps.values().any(|q| q.pd == pd) || inner.mrs.values().any(|m| m.pd == pd);
        if in_use {
            return Err(Error::from_errno(libc::EBUSY));
        }
        inner
            .pds
            .remove(&pd.0)
            .map(|_| ())
            .ok_or(Error::NotFound("pd"))
    }

    fn create_qp(&self, pd: ProtectionDomain, attr: QpInitAttr) -> Result<QueuePair> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::CreateQp)?;
        let dev = *inner.pds.get(&pd.0).ok_or(Error::NotFound("pd"))?;
        inner.device(dev)?;
        for cq in [attr.send_cq, attr.recv_cq] {
            match inner.cqs.get(&cq.0) {
                Some(c) if c.dev == dev => {}
                _ => return Err(Error::NotFound("cq")),
            }
        }
        if attr.cap.max_send_wr > SIM_MAX_QP_WR || attr.cap.max_recv_wr > SIM_MAX_QP_WR {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let qp = QueuePair(inner.new_handle());
        inner.qps.insert(
            qp.0,
            SimQp {
                dev,
                pd,
                send_cq: attr.send_cq,
                recv_cq: attr.recv_cq,
                attr: QpAttr {
                    cap: attr.cap,
                    ..Default::default()
                },
                handler: attr.event_handler,
                posted_recvs: 0,
            },
        );
        Ok(qp)
    }

    fn destroy_qp(&self, qp: QueuePair) -> Result<()> {
        self.inner
            .lock()
            .qps
            .remove(&qp.0)
            .map(|_| ())
            .ok_or(Error::NotFound("qp"))
    }

    fn modify_qp(&self, qp: QueuePair, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        let hook = self.modify_hook.lock().clone();
        if let Some(hook) = hook {
            hook(qp, attr.qp_state);
        }

        let mut inner = self.inner.lock();
        inner.stats.modify_qp_calls += 1;
        inner.take_fault(SimOp::ModifyQp(attr.qp_state))?;
        let dev = inner.qps.get(&qp.0).ok_or(Error::NotFound("qp"))?.dev;
        inner.device(dev)?;
        let q = inner.qps.get_mut(&qp.0).ok_or(Error::NotFound("qp"))?;
        let (from, to) = (q.attr.qp_state, attr.qp_state);
        if !mask.contains(QpAttrMask::STATE) || !transition_allowed(from, to) {
            return Err(Error::InvalidTransition { from, to });
        }
        let missing = QpAttrMask::required(from, to) - mask;
        if !missing.is_empty() {
            return Err(Error::MissingAttributes { to, missing });
        }
        if to == QpState::Reset {
            q.attr = QpAttr {
                cap: q.attr.cap,
                ..Default::default()
            };
            q.posted_recvs = 0;
        } else {
            apply_qp_attr(&mut q.attr, attr, mask);
            q.attr.qp_state = to;
        }
        Ok(())
    }

    fn query_qp(&self, qp: QueuePair) -> Result<QpAttr> {
        self.inner
            .lock()
            .qps
            .get(&qp.0)
            .map(|q| q.attr)
            .ok_or(Error::NotFound("qp"))
    }

    fn post_recv(&self, qp: QueuePair, _wr: &RecvWr) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::PostRecv)?;
        let q = inner.qps.get_mut(&qp.0).ok_or(Error::NotFound("qp"))?;
        if q.attr.qp_state == QpState::Reset {
            return Err(Error::from_errno(libc::EINVAL));
        }
        if q.posted_recvs >= q.attr.cap.max_recv_wr {
            return Err(Error::from_errno(libc::ENOMEM));
        }
        q.posted_recvs += 1;
        Ok(())
    }

    fn dma_map_sg(&self, dev: DeviceHandle, sgl: &mut [SgEntry], _dir: DmaDirection) -> usize {
        let mut inner = self.inner.lock();
        if inner.take_fault(SimOp::DmaMap).is_err() || inner.device(dev).is_err() {
            return 0;
        }
        for e in sgl.iter_mut() {
            let iova = inner.next_iova;
            let span = (e.length as u64 + SIM_PAGE_SIZE - 1) / SIM_PAGE_SIZE * SIM_PAGE_SIZE;
            // leave a guard page so separate elements never look contiguous
            inner.next_iova += span + SIM_PAGE_SIZE;
            e.dma_address = iova;
            e.dma_length = e.length;
            inner.dma.insert(iova, e.length);
        }
        sgl.len()
    }

    fn dma_unmap_sg(&self, _dev: DeviceHandle, sgl: &mut [SgEntry], _dir: DmaDirection) {
        let mut inner = self.inner.lock();
        inner.stats.dma_unmaps += 1;
        for e in sgl.iter().filter(|e| e.dma_address != 0) {
            inner.dma.remove(&e.dma_address);
        }
    }

    fn dma_sync_single_for_cpu(&self, _dev: DeviceHandle, addr: u64, _len: u32, _dir: DmaDirection) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.dma.contains_key(&addr));
        inner.stats.syncs_for_cpu += 1;
    }

    fn dma_sync_single_for_device(
        &self,
        _dev: DeviceHandle,
        addr: u64,
        _len: u32,
        _dir: DmaDirection,
    ) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.dma.contains_key(&addr));
        inner.stats.syncs_for_device += 1;
    }

    fn alloc_mr(&self, pd: ProtectionDomain, max_num_sg: u32) -> Result<MemoryRegion> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::AllocMr)?;
        if !inner.pds.contains_key(&pd.0) {
            return Err(Error::NotFound("pd"));
        }
        let mr = MemoryRegion(inner.new_handle());
        inner.mrs.insert(
            mr.0,
            SimMr {
                pd,
                max_num_sg,
                mapped: 0,
            },
        );
        inner.stats.mr_allocs += 1;
        Ok(mr)
    }

    fn map_mr_sg(&self, mr: MemoryRegion, sgl: &[SgEntry], page_size: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.take_fault(SimOp::MapMrSg)?;
        let m = inner.mrs.get_mut(&mr.0).ok_or(Error::NotFound("mr"))?;
        let page_size = page_size as u64;
        let mut pages = 0u64;
        let mut mapped = 0;
        for e in sgl {
            if e.dma_length == 0 {
                break;
            }
            let n = (e.dma_length as u64 + page_size - 1) / page_size;
            if pages + n > m.max_num_sg as u64 {
                break;
            }
            pages += n;
            mapped += 1;
        }
        m.mapped = mapped;
        Ok(mapped)
    }

    fn dereg_mr(&self, mr: MemoryRegion) -> Result<()> {
        self.inner
            .lock()
            .mrs
            .remove(&mr.0)
            .map(|_| ())
            .ok_or(Error::NotFound("mr"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    fn qp_on(sim: &SimVerbs) -> (DeviceHandle, ProtectionDomain, QueuePair) {
        let dev = sim.add_device(SimDeviceSpec::roce("mlx0", &[MAC]));
        let cq_attr = CqInitAttr {
            cqe: 16,
            comp_vector: 0,
        };
        let scq = sim.create_cq(dev, &cq_attr).unwrap();
        let rcq = sim.create_cq(dev, &cq_attr).unwrap();
        let pd = sim.alloc_pd(dev).unwrap();
        let qp = sim
            .create_qp(
                pd,
                QpInitAttr {
                    send_cq: scq,
                    recv_cq: rcq,
                    cap: QpCap {
                        max_send_wr: 4,
                        max_recv_wr: 4,
                        max_send_sge: 1,
                        max_recv_sge: 1,
                        max_inline_data: 0,
                    },
                    sq_sig_type: SigType::ReqWr,
                    qp_type: QpType::Rc,
                    event_handler: None,
                },
            )
            .unwrap();
        (dev, pd, qp)
    }

    fn to(state: QpState) -> QpAttr {
        QpAttr {
            qp_state: state,
            ..Default::default()
        }
    }

    #[test]
    fn skipping_init_is_rejected() {
        let sim = SimVerbs::new();
        let (_, _, qp) = qp_on(&sim);
        let err = sim
            .modify_qp(qp, &to(QpState::Rtr), QpAttrMask::all())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(sim.qp_state(qp), Some(QpState::Reset));
    }

    #[test]
    fn partial_mask_is_rejected() {
        let sim = SimVerbs::new();
        let (_, _, qp) = qp_on(&sim);
        let err = sim
            .modify_qp(qp, &to(QpState::Init), QpAttrMask::STATE | QpAttrMask::PORT)
            .unwrap_err();
        match err {
            Error::MissingAttributes { missing, .. } => {
                assert!(missing.contains(QpAttrMask::ACCESS_FLAGS));
                assert!(missing.contains(QpAttrMask::PKEY_INDEX));
            }
            e => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn pd_busy_while_qp_alive() {
        let sim = SimVerbs::new();
        let (_, pd, qp) = qp_on(&sim);
        assert_eq!(sim.dealloc_pd(pd).unwrap_err().errno(), libc::EBUSY);
        sim.destroy_qp(qp).unwrap();
        sim.dealloc_pd(pd).unwrap();
    }

    #[test]
    fn recv_needs_init() {
        let sim = SimVerbs::new();
        let (_, _, qp) = qp_on(&sim);
        let wr = RecvWr {
            wr_id: 0,
            addr: 0,
            length: 48,
            lkey: 0,
        };
        assert!(sim.post_recv(qp, &wr).is_err());
        sim.modify_qp(qp, &to(QpState::Init), QpAttrMask::required(QpState::Reset, QpState::Init))
            .unwrap();
        for _ in 0..4 {
            sim.post_recv(qp, &wr).unwrap();
        }
        assert_eq!(sim.post_recv(qp, &wr).unwrap_err().errno(), libc::ENOMEM);
    }

    #[test]
    fn injected_fault_fires_once() {
        let sim = SimVerbs::new();
        let dev = sim.add_device(SimDeviceSpec::roce("mlx0", &[MAC]));
        sim.fail_next(SimOp::AllocPd, libc::ENOMEM);
        assert_eq!(sim.alloc_pd(dev).unwrap_err().errno(), libc::ENOMEM);
        assert!(sim.alloc_pd(dev).is_ok());
    }

    #[test]
    fn port_events_reach_device_handlers_only() {
        let sim = SimVerbs::new();
        let dev = sim.add_device(SimDeviceSpec::roce("mlx0", &[MAC]));
        let other = sim.add_device(SimDeviceSpec::roce("mlx1", &[MAC]));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        sim.register_event_handler(
            dev,
            Arc::new(move |_: &AsyncEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        sim.change_port_state(dev, 1, PortState::Down);
        sim.change_port_state(other, 1, PortState::Down);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sim.query_port(dev, 1).unwrap().state, PortState::Down);
    }

    #[test]
    fn separate_elements_get_disjoint_dma_spans() {
        let sim = SimVerbs::new();
        let dev = sim.add_device(SimDeviceSpec::roce("mlx0", &[MAC]));
        let mut sgl = [
            SgEntry {
                addr: 0x1000,
                length: 4096,
                ..Default::default()
            },
            SgEntry {
                addr: 0x2000,
                length: 4096,
                ..Default::default()
            },
        ];
        assert_eq!(sim.dma_map_sg(dev, &mut sgl, DmaDirection::FromDevice), 2);
        assert_ne!(sgl[0].dma_address + sgl[0].dma_length as u64, sgl[1].dma_address);
        sim.dma_unmap_sg(dev, &mut sgl, DmaDirection::FromDevice);
        assert_eq!(sim.stats().dma_mappings, 0);
    }
}
