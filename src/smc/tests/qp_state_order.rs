use std::sync::{Arc, Mutex};

use rand::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use rdma::sim::{SimDeviceSpec, SimOp, SimVerbs};
use rdma::{MacAddr, QpState, QueuePair};
use smc::{Role, SmcIb, SystemId};

const NUM_ITERS: usize = 2_000;
const SEED: u64 = 999;

fn legal(from: QpState, to: QpState) -> bool {
    matches!(
        (from, to),
        (_, QpState::Reset)
            | (QpState::Reset, QpState::Init)
            | (QpState::Init, QpState::Rtr)
            | (QpState::Rtr, QpState::Rts)
    )
}

/// Random sequences of bring-up, RTS, reset and injected failures never make the link layer
/// request an out-of-order transition, and its view of the state always matches the QP's.
#[test]
fn transitions_follow_the_state_order() {
    let sim = Arc::new(SimVerbs::new());
    let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
    let h = sim.add_device(SimDeviceSpec::roce(
        "mlx0",
        &[MacAddr([2, 0, 0, 0, 0, 1]), MacAddr([2, 0, 0, 0, 0, 2])],
    ));
    let dev = smc.add_dev(h).unwrap().unwrap();

    let requested: Arc<Mutex<Vec<(QueuePair, QpState, QpState)>>> = Arc::default();
    let log = Arc::clone(&requested);
    let weak = Arc::downgrade(&sim);
    sim.set_modify_hook(Some(Arc::new(move |qp: QueuePair, to: QpState| {
        if let Some(sim) = weak.upgrade() {
            let from = sim.qp_state(qp).unwrap_or_default();
            log.lock().unwrap().push((qp, from, to));
        }
    })));

    let links = [
        smc.create_link(dev, 1, Role::Server).unwrap(),
        smc.create_link(dev, 2, Role::Client).unwrap(),
    ];
    let peers = [
        smc.local_peer_info(links[1]).unwrap(),
        smc.local_peer_info(links[0]).unwrap(),
    ];
    let states = [QpState::Init, QpState::Rtr, QpState::Rts, QpState::Reset];

    let mut rng = StdRng::seed_from_u64(SEED);
    for _ in 0..NUM_ITERS {
        let i = rng.gen_range(0..links.len());
        let link = links[i];
        let _ = match rng.gen_range(0..4) {
            0 => smc.bring_up_link(link, &peers[i]),
            1 => smc.modify_qp_rts(link),
            2 => smc.reset_link(link),
            _ => {
                let state = *states.choose(&mut rng).unwrap();
                sim.fail_next(SimOp::ModifyQp(state), libc::EIO);
                Ok(())
            }
        };
        let info = smc.link_info(link).unwrap();
        assert_eq!(Some(info.state), sim.qp_state(info.qp));
    }

    sim.set_modify_hook(None);
    let requested = requested.lock().unwrap();
    assert!(!requested.is_empty());
    for &(qp, from, to) in requested.iter() {
        assert!(legal(from, to), "{:?}: {:?} -> {:?}", qp, from, to);
    }
}
