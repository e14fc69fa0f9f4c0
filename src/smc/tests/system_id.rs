use std::sync::Arc;

use rdma::sim::{SimDeviceSpec, SimPortSpec, SimVerbs};
use rdma::{MacAddr, Mtu, NodeType, PortState};
use smc::systemid::SYSTEMID_UNSET;
use smc::{SmcIb, SystemId};

const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

#[test]
fn first_active_port_assigns_it() {
    let sim = Arc::new(SimVerbs::new());
    let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
    assert_eq!(smc.system_id(), SYSTEMID_UNSET);

    let a = sim.add_device(SimDeviceSpec::roce("mlx0", &[MAC_A]));
    smc.add_dev(a).unwrap();
    let id = smc.system_id();
    assert_eq!(&id[2..], &MAC_A.0);

    // later devices, and re-discovering the first one, leave it alone
    let b = sim.add_device(SimDeviceSpec::roce("mlx1", &[MAC_B]));
    smc.add_dev(b).unwrap();
    smc.remove_dev(a);
    smc.add_dev(a).unwrap();
    assert_eq!(smc.system_id(), id);
}

#[test]
fn inactive_port_waits_for_port_active() {
    let sim = Arc::new(SimVerbs::new());
    let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
    let h = sim.add_device(SimDeviceSpec {
        name: "mlx0".to_owned(),
        node_type: NodeType::Ca,
        ports: vec![SimPortSpec {
            state: PortState::Down,
            active_mtu: Mtu::Mtu1024,
            mac: Some(MAC_B),
        }],
    });
    let dev = smc.add_dev(h).unwrap().unwrap();
    assert_eq!(smc.system_id(), SYSTEMID_UNSET);

    // port events arrive through the handler registered at setup
    smc.setup_dev(dev).unwrap();
    sim.change_port_state(h, 1, PortState::Active);
    smc.flush_port_events();
    assert_eq!(&smc.system_id()[2..], &MAC_B.0);
}

#[test]
fn shared_identifier_is_set_once() {
    let id = Arc::new(SystemId::new());
    let sim = Arc::new(SimVerbs::new());
    sim.add_device(SimDeviceSpec::roce("mlx0", &[MAC_A]));
    sim.add_device(SimDeviceSpec::roce("mlx1", &[MAC_B]));

    let first = SmcIb::with_system_id(sim.clone(), Arc::clone(&id)).unwrap();
    let second = SmcIb::with_system_id(sim.clone(), Arc::clone(&id)).unwrap();
    assert_eq!(first.register_client().unwrap(), 2);
    assert_eq!(second.register_client().unwrap(), 2);
    assert_eq!(first.system_id(), second.system_id());
    assert_eq!(&id.get()[2..], &MAC_A.0);
}
