//! Links and the queue-pair state machine.
//!
//! A link moves `Reset -> Init -> Rtr -> Rts`; a reset is allowed from anywhere. Each step is one
//! `modify_qp` carrying the full attribute set the step needs. A failed step leaves the link in
//! the state it had reached.
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use rdma::{
    AccessFlags, AhAttr, CqNotify, Gid, GlobalRoute, MacAddr, Mtu, ProtectionDomain, QpAttr,
    QpAttrMask, QpCap, QpInitAttr, QpState, QpType, QueuePair, SigType, Verbs,
};

use crate::config::{
    SMC_IB_MAX_SEND_SGE, SMC_QP_MAX_RD_ATOMIC, SMC_QP_MIN_RNR_TIMER, SMC_QP_RETRY_CNT,
    SMC_QP_RNR_RETRY, SMC_QP_TIMEOUT, SMC_WR_BUF_CNT, SMC_WR_BUF_SIZE,
};
use crate::device::{DeviceId, IbDevice};
use crate::event;
use crate::ib::{Shared, SmcIb};
use crate::lgr::{LgrId, LinkGroup, Role};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.0)
    }
}

/// Names a link within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkRef {
    pub lgr: LgrId,
    pub link: LinkId,
}

/// What one side of a link learns about the other during the session handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub gid: Gid,
    pub mac: MacAddr,
    pub qpn: u32,
    /// Initial packet sequence number, 24 bits.
    pub psn: u32,
    pub mtu: Mtu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub id: LinkId,
    pub lgr: LgrId,
    pub device: DeviceId,
    pub port: u8,
    pub qp: QueuePair,
    pub state: QpState,
    pub mtu_local: Mtu,
    pub path_mtu: Mtu,
    pub psn_initial: u32,
    pub wr_tx_cnt: u32,
    pub wr_rx_cnt: u32,
    pub peer: Option<PeerInfo>,
}

/// A link's protection domain. The link and every memory region registered in the domain hold a
/// reference; the domain is deallocated when the last one lets go.
pub(crate) struct PdRef {
    verbs: Arc<dyn Verbs>,
    pub(crate) pd: ProtectionDomain,
}

impl PdRef {
    fn alloc(verbs: &Arc<dyn Verbs>, dev: &IbDevice) -> Result<Self> {
        let pd = verbs.alloc_pd(dev.handle).map_err(Error::AllocPd)?;
        Ok(PdRef {
            verbs: Arc::clone(verbs),
            pd,
        })
    }
}

impl fmt::Debug for PdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PdRef").field(&self.pd).finish()
    }
}

impl Drop for PdRef {
    fn drop(&mut self) {
        match self.verbs.dealloc_pd(self.pd) {
            Ok(()) => tracing::trace!("{:?} deallocated", self.pd),
            Err(e) => tracing::warn!("dealloc_pd {:?}: {}", self.pd, e),
        }
    }
}

pub(crate) struct Link {
    pub(crate) id: LinkId,
    pub(crate) lgr: LgrId,
    pub(crate) device: DeviceId,
    pub(crate) ibport: u8,
    pub(crate) pd: Arc<PdRef>,
    pub(crate) qp: QueuePair,
    pub(crate) gid: Gid,
    pub(crate) mac: MacAddr,
    pub(crate) mtu_local: Mtu,
    pub(crate) mtu_peer: Mtu,
    pub(crate) peer: Option<PeerInfo>,
    pub(crate) psn_initial: u32,
    pub(crate) state: QpState,
    /// Attributes as last read back from the QP.
    pub(crate) qp_attr: QpAttr,
    pub(crate) wr_tx_cnt: u32,
    pub(crate) wr_rx_cnt: u32,
    pub(crate) local_dma_lkey: u32,
    pub(crate) wr_rx_bufs: Box<[u8]>,
    /// Held across a whole QP transition: state check, `modify_qp` and the cached state update.
    transition: Arc<Mutex<()>>,
}

impl Link {
    #[inline]
    pub(crate) fn path_mtu(&self) -> Mtu {
        self.mtu_local.min(self.mtu_peer)
    }

    #[inline]
    pub(crate) fn qpn(&self) -> u32 {
        self.qp.0 .0 as u32
    }
}

/// The state a link must be in before moving to `to`. `None` means any.
fn predecessor(to: QpState) -> Option<QpState> {
    match to {
        QpState::Init => Some(QpState::Reset),
        QpState::Rtr => Some(QpState::Init),
        QpState::Rts => Some(QpState::Rtr),
        _ => None,
    }
}

fn init_attr(link: &Link) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Init,
        pkey_index: 0,
        port_num: link.ibport,
        qp_access_flags: AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        ..Default::default()
    };
    let mask =
        QpAttrMask::STATE | QpAttrMask::PKEY_INDEX | QpAttrMask::ACCESS_FLAGS | QpAttrMask::PORT;
    (attr, mask)
}

fn rtr_attr(link: &Link, peer: &PeerInfo) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Rtr,
        path_mtu: link.mtu_local.min(peer.mtu),
        ah_attr: AhAttr {
            port_num: link.ibport,
            grh: GlobalRoute {
                dgid: peer.gid,
                hop_limit: 1,
                ..Default::default()
            },
            dmac: peer.mac,
        },
        dest_qp_num: peer.qpn,
        rq_psn: peer.psn,
        max_dest_rd_atomic: SMC_QP_MAX_RD_ATOMIC,
        min_rnr_timer: SMC_QP_MIN_RNR_TIMER,
        ..Default::default()
    };
    let mask = QpAttrMask::STATE
        | QpAttrMask::AV
        | QpAttrMask::PATH_MTU
        | QpAttrMask::DEST_QPN
        | QpAttrMask::RQ_PSN
        | QpAttrMask::MAX_DEST_RD_ATOMIC
        | QpAttrMask::MIN_RNR_TIMER;
    (attr, mask)
}

fn rts_attr(link: &Link) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Rts,
        timeout: SMC_QP_TIMEOUT,
        retry_cnt: SMC_QP_RETRY_CNT,
        rnr_retry: SMC_QP_RNR_RETRY,
        sq_psn: link.psn_initial,
        max_rd_atomic: SMC_QP_MAX_RD_ATOMIC,
        ..Default::default()
    };
    let mask = QpAttrMask::STATE
        | QpAttrMask::TIMEOUT
        | QpAttrMask::RETRY_CNT
        | QpAttrMask::SQ_PSN
        | QpAttrMask::RNR_RETRY
        | QpAttrMask::MAX_QP_RD_ATOMIC;
    (attr, mask)
}

fn reset_attr(_link: &Link) -> (QpAttr, QpAttrMask) {
    let attr = QpAttr {
        qp_state: QpState::Reset,
        ..Default::default()
    };
    (attr, QpAttrMask::STATE)
}

impl Shared {
    /// Allocate the PD and QP of a new link on `port` of `dev`, setting the device up first if
    /// needed. The link is not yet part of any group.
    fn alloc_link(&self, dev: &Arc<IbDevice>, port: u8, lgr: LgrId) -> Result<Link> {
        if !dev.valid_port(port) {
            return Err(Error::InvalidPort(port));
        }
        if !dev.port_active(port) {
            return Err(Error::PortDown {
                device: dev.id,
                port,
            });
        }
        self.setup_device(dev)?;
        let res = dev.resources()?;

        let pd = Arc::new(PdRef::alloc(&self.verbs, dev)?);
        let init_attr = QpInitAttr {
            send_cq: res.send_cq,
            recv_cq: res.recv_cq,
            cap: QpCap {
                max_send_wr: SMC_WR_BUF_CNT * 3,
                max_recv_wr: SMC_WR_BUF_CNT * 3,
                max_send_sge: SMC_IB_MAX_SEND_SGE,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            sq_sig_type: SigType::ReqWr,
            qp_type: QpType::Rc,
            event_handler: Some(event::qp_event_handler(Arc::downgrade(dev), port)),
        };
        // on failure `pd` is dropped, which releases it
        let qp = self
            .verbs
            .create_qp(pd.pd, init_attr)
            .map_err(Error::CreateQp)?;

        let mtu_local = dev.port_mtu(port).unwrap_or_default();
        let link = Link {
            id: LinkId(self.next_id()),
            lgr,
            device: dev.id,
            ibport: port,
            pd,
            qp,
            gid: dev.port_gid(port).unwrap_or_default(),
            mac: dev.port_mac(port).unwrap_or_default(),
            mtu_local,
            mtu_peer: mtu_local,
            peer: None,
            psn_initial: rand::thread_rng().gen::<u32>() & 0xff_ffff,
            state: QpState::Reset,
            qp_attr: QpAttr::default(),
            wr_tx_cnt: 0,
            wr_rx_cnt: 0,
            local_dma_lkey: dev.attr.local_dma_lkey,
            wr_rx_bufs: vec![0u8; (SMC_WR_BUF_CNT * SMC_WR_BUF_SIZE) as usize].into_boxed_slice(),
            transition: Arc::new(Mutex::new(())),
        };
        tracing::debug!(link = %link.id, device = %dev.id, port, "link allocated, {:?}", qp);
        Ok(link)
    }

    /// Hand `link` to `lgr`, unless the group was terminated meanwhile.
    ///
    /// Runs under the device's link-creation guard, so removal of the device either sees the
    /// installed link or has already refused the creation.
    fn install_link(&self, lgr: &LinkGroup, link: Link) -> Result<LinkRef> {
        let link_ref = LinkRef {
            lgr: lgr.id,
            link: link.id,
        };
        if let Err(link) = lgr.push_link(link) {
            self.free_link(link);
            return Err(Error::Terminated(lgr.id));
        }
        Ok(link_ref)
    }

    /// Move the QP of link `id` to `to`. Refuses out-of-order transitions without touching the
    /// hardware.
    ///
    /// Transitions of one link are serialized, so the cached state always matches what the last
    /// completed `modify_qp` left in the hardware.
    fn modify_link_qp<F>(&self, lgr: &LinkGroup, id: LinkId, to: QpState, build: F) -> Result<()>
    where
        F: FnOnce(&Link) -> (QpAttr, QpAttrMask),
    {
        let transition = lgr.with_link(id, |l| Arc::clone(&l.transition))?;
        let _serialized = transition.lock().unwrap_or_else(PoisonError::into_inner);
        let (qp, attr, mask) = lgr.with_link(id, |l| -> Result<_> {
            if let Some(from) = predecessor(to) {
                if l.state != from {
                    return Err(Error::InvalidState { from: l.state, to });
                }
            }
            let (attr, mask) = build(l);
            Ok((l.qp, attr, mask))
        })??;
        self.verbs
            .modify_qp(qp, &attr, mask)
            .map_err(|source| Error::Transition { to, source })?;
        lgr.with_link(id, |l| l.state = to)?;
        tracing::trace!(link = %id, "qp {:?} -> {:?}", qp, to);
        Ok(())
    }
}

impl SmcIb {
    /// Create a link group with a single link on `port` of `device`.
    pub fn create_link(&self, device: DeviceId, port: u8, role: Role) -> Result<LinkRef> {
        let dev = self.inner.devices.get(device)?;
        let _creating = dev.begin_link_creation()?;
        let lgr = Arc::new(LinkGroup::new(LgrId(self.inner.next_id()), role));
        let link = self.inner.alloc_link(&dev, port, lgr.id)?;
        if let Err(e) = self.inner.lgrs.insert(lgr.id, Arc::clone(&lgr)) {
            self.inner.free_link(link);
            return Err(e.into());
        }
        let res = self.inner.install_link(&lgr, link);
        if res.is_err() {
            self.inner.terminate_lgr(&lgr);
        }
        res
    }

    /// Add another link on `port` of `device` to an existing group.
    pub fn add_link(&self, lgr: LgrId, device: DeviceId, port: u8) -> Result<LinkRef> {
        let group = self.inner.lgr(lgr)?;
        if group.is_terminated() {
            return Err(Error::Terminated(lgr));
        }
        let dev = self.inner.devices.get(device)?;
        let _creating = dev.begin_link_creation()?;
        let link = self.inner.alloc_link(&dev, port, lgr)?;
        self.inner.install_link(&group, link)
    }

    /// Drive the link's QP through INIT and RTR, arm the receive CQ, post the receive buffers
    /// and, for a responder, move it on to RTS.
    ///
    /// An initiator stays in RTR; see [`SmcIb::modify_qp_rts`].
    pub fn bring_up_link(&self, link: LinkRef, peer: &PeerInfo) -> Result<()> {
        let shared = &self.inner;
        let lgr = shared.lgr(link.lgr)?;
        let (device, port) = lgr.with_link(link.link, |l| (l.device, l.ibport))?;
        let dev = shared.devices.get(device)?;
        if !dev.port_active(port) {
            return Err(Error::PortDown { device, port });
        }

        shared.modify_link_qp(&lgr, link.link, QpState::Init, init_attr)?;
        lgr.with_link(link.link, |l| {
            l.peer = Some(*peer);
            l.mtu_peer = peer.mtu;
        })?;
        shared.modify_link_qp(&lgr, link.link, QpState::Rtr, |l| rtr_attr(l, peer))?;
        shared.remember_qp_attr(&lgr, link.link);

        let recv_cq = dev.resources()?.recv_cq;
        shared
            .verbs
            .req_notify_cq(recv_cq, CqNotify::Solicited)
            .map_err(Error::NotifyCq)?;
        shared.rx_post_init(&lgr, link.link)?;
        shared.remember_qp_attr(&lgr, link.link);

        if lgr.role == Role::Server {
            shared.modify_link_qp(&lgr, link.link, QpState::Rts, rts_attr)?;
            shared.remember_qp_attr(&lgr, link.link);
        }
        tracing::info!(lgr = %link.lgr, link = %link.link, role = ?lgr.role, "link up");
        Ok(())
    }

    /// Move a link from RTR to RTS once the session layer has confirmed the peer.
    pub fn modify_qp_rts(&self, link: LinkRef) -> Result<()> {
        let lgr = self.inner.lgr(link.lgr)?;
        self.inner
            .modify_link_qp(&lgr, link.link, QpState::Rts, rts_attr)?;
        self.inner.remember_qp_attr(&lgr, link.link);
        Ok(())
    }

    /// Put the link's QP back into RESET. Allowed from any state.
    pub fn reset_link(&self, link: LinkRef) -> Result<()> {
        let lgr = self.inner.lgr(link.lgr)?;
        self.inner
            .modify_link_qp(&lgr, link.link, QpState::Reset, reset_attr)
    }

    /// Remove a link from its group and free it. Tearing down a link that is already gone is a
    /// no-op.
    pub fn teardown_link(&self, link: LinkRef) {
        let lgr = match self.inner.lgrs.get(&link.lgr) {
            Ok(lgr) => lgr,
            Err(_) => return,
        };
        if let Some(l) = lgr.take_link(link.link) {
            self.inner.free_link(l);
        }
    }

    pub fn link_state(&self, link: LinkRef) -> Result<QpState> {
        self.inner.lgr(link.lgr)?.with_link(link.link, |l| l.state)
    }

    pub fn link_info(&self, link: LinkRef) -> Result<LinkInfo> {
        self.inner.lgr(link.lgr)?.with_link(link.link, |l| LinkInfo {
            id: l.id,
            lgr: l.lgr,
            device: l.device,
            port: l.ibport,
            qp: l.qp,
            state: l.state,
            mtu_local: l.mtu_local,
            path_mtu: l.path_mtu(),
            psn_initial: l.psn_initial,
            wr_tx_cnt: l.wr_tx_cnt,
            wr_rx_cnt: l.wr_rx_cnt,
            peer: l.peer,
        })
    }

    /// What the peer needs to know about this end of the link.
    pub fn local_peer_info(&self, link: LinkRef) -> Result<PeerInfo> {
        self.inner.lgr(link.lgr)?.with_link(link.link, |l| PeerInfo {
            gid: l.gid,
            mac: l.mac,
            qpn: l.qpn(),
            psn: l.psn_initial,
            mtu: l.mtu_local,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rdma::sim::{SimDeviceSpec, SimOp, SimVerbs};
    use rdma::PortState;

    use super::*;
    use crate::systemid::SystemId;

    const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
    const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

    fn setup() -> (Arc<SimVerbs>, SmcIb, DeviceId) {
        let sim = Arc::new(SimVerbs::new());
        let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
        let h = sim.add_device(SimDeviceSpec::roce("mlx0", &[MAC_A, MAC_B]));
        let id = smc.add_dev(h).unwrap().unwrap();
        (sim, smc, id)
    }

    #[test]
    fn responder_reaches_rts() {
        let (sim, smc, dev) = setup();
        let server = smc.create_link(dev, 1, Role::Server).unwrap();
        let client = smc.create_link(dev, 2, Role::Client).unwrap();
        let to_client = smc.local_peer_info(client).unwrap();
        let to_server = smc.local_peer_info(server).unwrap();

        smc.bring_up_link(server, &to_client).unwrap();
        smc.bring_up_link(client, &to_server).unwrap();
        assert_eq!(smc.link_state(server).unwrap(), QpState::Rts);
        assert_eq!(smc.link_state(client).unwrap(), QpState::Rtr);

        smc.modify_qp_rts(client).unwrap();
        let info = smc.link_info(client).unwrap();
        assert_eq!(info.state, QpState::Rts);
        assert_eq!(info.wr_tx_cnt, SMC_WR_BUF_CNT);
        assert_eq!(sim.qp_state(info.qp), Some(QpState::Rts));
        assert_eq!(sim.posted_recvs(info.qp), Some(SMC_WR_BUF_CNT));

        let attr = sim.qp_attr(info.qp).unwrap();
        assert_eq!(attr.timeout, SMC_QP_TIMEOUT);
        assert_eq!(attr.rnr_retry, SMC_QP_RNR_RETRY);
        assert_eq!(attr.sq_psn, info.psn_initial);
        assert_eq!(attr.rq_psn, to_server.psn);
        assert_eq!(attr.dest_qp_num, to_server.qpn);
        assert_eq!(attr.ah_attr.dmac, MAC_A);
        assert_eq!(attr.ah_attr.grh.hop_limit, 1);
    }

    #[test]
    fn path_mtu_is_the_smaller_one() {
        let (sim, smc, dev) = setup();
        let link = smc.create_link(dev, 1, Role::Server).unwrap();
        let mut peer = smc.local_peer_info(link).unwrap();
        peer.mtu = Mtu::Mtu512;
        smc.bring_up_link(link, &peer).unwrap();
        let info = smc.link_info(link).unwrap();
        assert_eq!(info.mtu_local, Mtu::Mtu1024);
        assert_eq!(info.path_mtu, Mtu::Mtu512);
        assert_eq!(sim.qp_attr(info.qp).unwrap().path_mtu, Mtu::Mtu512);
    }

    #[test]
    fn failed_step_keeps_last_state() {
        let (sim, smc, dev) = setup();
        let link = smc.create_link(dev, 1, Role::Server).unwrap();
        let peer = smc.local_peer_info(link).unwrap();
        sim.fail_next(SimOp::ModifyQp(QpState::Rtr), libc::EIO);
        let err = smc.bring_up_link(link, &peer).unwrap_err();
        assert!(matches!(
            err,
            Error::Transition {
                to: QpState::Rtr,
                ..
            }
        ));
        assert_eq!(smc.link_state(link).unwrap(), QpState::Init);

        // bring-up starts from RESET, so it is refused until the link is reset
        assert!(matches!(
            smc.bring_up_link(link, &peer),
            Err(Error::InvalidState { .. })
        ));
        smc.reset_link(link).unwrap();
        smc.bring_up_link(link, &peer).unwrap();
        assert_eq!(smc.link_state(link).unwrap(), QpState::Rts);
    }

    #[test]
    fn refused_bring_up_keeps_peer() {
        let (_sim, smc, dev) = setup();
        let link = smc.create_link(dev, 1, Role::Server).unwrap();
        let first = smc.local_peer_info(link).unwrap();
        smc.bring_up_link(link, &first).unwrap();

        let other = PeerInfo {
            qpn: first.qpn + 1,
            mtu: Mtu::Mtu256,
            ..first
        };
        assert!(matches!(
            smc.bring_up_link(link, &other),
            Err(Error::InvalidState {
                from: QpState::Rts,
                to: QpState::Init
            })
        ));
        let info = smc.link_info(link).unwrap();
        assert_eq!(info.peer, Some(first));
        assert_eq!(info.path_mtu, Mtu::Mtu1024);
    }

    #[test]
    fn rts_needs_rtr() {
        let (_sim, smc, dev) = setup();
        let link = smc.create_link(dev, 1, Role::Client).unwrap();
        assert!(matches!(
            smc.modify_qp_rts(link),
            Err(Error::InvalidState {
                from: QpState::Reset,
                to: QpState::Rts
            })
        ));
    }

    #[test]
    fn inactive_port_fails_fast() {
        let (sim, smc, dev) = setup();
        let h = smc.device_info(dev).unwrap().handle;
        sim.set_port_state(h, 2, PortState::Down);
        let d = smc.inner.devices.get(dev).unwrap();
        smc.inner.remember_port_attr(&d, 2).unwrap();
        assert!(matches!(
            smc.create_link(dev, 2, Role::Client),
            Err(Error::PortDown { port: 2, .. })
        ));
        assert!(matches!(
            smc.create_link(dev, 3, Role::Client),
            Err(Error::InvalidPort(3))
        ));
        assert_eq!(sim.stats().pds, 0);
    }

    #[test]
    fn create_qp_failure_releases_pd() {
        let (sim, smc, dev) = setup();
        sim.fail_next(SimOp::CreateQp, libc::ENOMEM);
        let err = smc.create_link(dev, 1, Role::Server).unwrap_err();
        assert!(matches!(err, Error::CreateQp(_)));
        assert_eq!(sim.stats().pds, 0);
        assert!(smc.link_groups().is_empty());
    }

    #[test]
    fn teardown_twice() {
        let (sim, smc, dev) = setup();
        let link = smc.create_link(dev, 1, Role::Server).unwrap();
        let second = smc.add_link(link.lgr, dev, 2).unwrap();
        assert_eq!(smc.links(link.lgr).len(), 2);
        smc.teardown_link(link);
        smc.teardown_link(link);
        assert_eq!(smc.links(link.lgr), vec![second.link]);
        assert!(matches!(smc.link_state(link), Err(Error::NotFound)));
        assert_eq!(sim.stats().qps, 1);

        smc.terminate_link_group(link.lgr);
        smc.terminate_link_group(link.lgr);
        assert!(matches!(smc.link_state(second), Err(Error::Terminated(_))));
        let stats = sim.stats();
        assert_eq!((stats.qps, stats.pds), (0, 0));
    }
}
