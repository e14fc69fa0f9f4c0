//! Work-request bookkeeping of a link: cached QP attributes and the initial receive buffers.
use rdma::RecvWr;

use crate::config::{SMC_WR_BUF_CNT, SMC_WR_BUF_SIZE};
use crate::ib::Shared;
use crate::lgr::LinkGroup;
use crate::link::LinkId;
use crate::{Error, Result};

impl Shared {
    /// Read back the QP's attributes and derive how many work requests may be outstanding.
    ///
    /// A failed query keeps the previous values.
    pub(crate) fn remember_qp_attr(&self, lgr: &LinkGroup, id: LinkId) {
        let qp = match lgr.with_link(id, |l| l.qp) {
            Ok(qp) => qp,
            Err(_) => return,
        };
        match self.verbs.query_qp(qp) {
            Ok(attr) => {
                let _ = lgr.with_link(id, |l| {
                    l.qp_attr = attr;
                    l.wr_tx_cnt = SMC_WR_BUF_CNT.min(attr.cap.max_send_wr);
                    l.wr_rx_cnt = SMC_WR_BUF_CNT.min(attr.cap.max_recv_wr);
                });
            }
            Err(e) => tracing::warn!(link = %id, "query_qp: {}", e),
        }
    }

    /// Post one receive work request per receive buffer of the link.
    pub(crate) fn rx_post_init(&self, lgr: &LinkGroup, id: LinkId) -> Result<()> {
        let (qp, base, lkey) = lgr.with_link(id, |l| {
            (l.qp, l.wr_rx_bufs.as_ptr() as u64, l.local_dma_lkey)
        })?;
        for i in 0..SMC_WR_BUF_CNT {
            let wr = RecvWr {
                wr_id: i as u64,
                addr: base + (i * SMC_WR_BUF_SIZE) as u64,
                length: SMC_WR_BUF_SIZE,
                lkey,
            };
            self.verbs.post_recv(qp, &wr).map_err(Error::PostRecv)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rdma::sim::{SimDeviceSpec, SimOp, SimVerbs};
    use rdma::{MacAddr, QpState};

    use crate::ib::SmcIb;
    use crate::lgr::Role;
    use crate::systemid::SystemId;
    use crate::Error;

    #[test]
    fn post_failure_aborts_bring_up() {
        let sim = Arc::new(SimVerbs::new());
        let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
        let h = sim.add_device(SimDeviceSpec::roce("mlx0", &[MacAddr([2, 0, 0, 0, 0, 1])]));
        let dev = smc.add_dev(h).unwrap().unwrap();
        let link = smc.create_link(dev, 1, Role::Server).unwrap();
        let peer = smc.local_peer_info(link).unwrap();

        sim.fail_next(SimOp::PostRecv, libc::ENOMEM);
        let err = smc.bring_up_link(link, &peer).unwrap_err();
        assert!(matches!(err, Error::PostRecv(_)));
        let info = smc.link_info(link).unwrap();
        assert_eq!(info.state, QpState::Rtr);
        // remembered right after RTR
        assert_eq!(info.wr_tx_cnt, crate::config::SMC_WR_BUF_CNT);
    }

    #[test]
    fn notify_failure_aborts_bring_up() {
        let sim = Arc::new(SimVerbs::new());
        let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
        let h = sim.add_device(SimDeviceSpec::roce("mlx0", &[MacAddr([2, 0, 0, 0, 0, 1])]));
        let dev = smc.add_dev(h).unwrap().unwrap();
        let link = smc.create_link(dev, 1, Role::Server).unwrap();
        let peer = smc.local_peer_info(link).unwrap();

        sim.fail_next(SimOp::ReqNotifyCq, libc::EIO);
        let err = smc.bring_up_link(link, &peer).unwrap_err();
        assert!(matches!(err, Error::NotifyCq(_)));
        assert_eq!(err.errno(), libc::EIO);
        let qp = smc.link_info(link).unwrap().qp;
        assert_eq!(sim.posted_recvs(qp), Some(0));
    }
}
