use std::sync::Arc;

use rdma::sim::{SimDeviceSpec, SimVerbs};
use rdma::{AccessFlags, DmaDirection, MacAddr, PortState};
use smc::{BufferSlot, Error, LinkRef, Role, SmcIb, SystemId};

fn link() -> (Arc<SimVerbs>, SmcIb, LinkRef) {
    let sim = Arc::new(SimVerbs::new());
    let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
    let h = sim.add_device(SimDeviceSpec::roce("mlx0", &[MacAddr([2, 0, 0, 0, 0, 1])]));
    let dev = smc.add_dev(h).unwrap().unwrap();
    let link = smc.create_link(dev, 1, Role::Server).unwrap();
    (sim, smc, link)
}

#[test]
fn remote_buffer_round_trip() {
    let (sim, smc, link) = link();
    let mut buf = smc.allocate_buffer(2).unwrap();
    assert_eq!(buf.size(), 65536);
    buf.chunks_mut().for_each(|c| c.fill(0xab));

    let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
    smc.prepare_buffer(link, &mut buf, DmaDirection::FromDevice, Some(access))
        .unwrap();
    // preparing again changes nothing
    smc.prepare_buffer(link, &mut buf, DmaDirection::FromDevice, Some(access))
        .unwrap();
    assert!(buf.is_dma_mapped());
    assert_eq!(buf.mr_access(), access);
    let stats = sim.stats();
    assert_eq!((stats.mrs, stats.mr_allocs, stats.dma_mappings), (1, 1, 1));

    assert_eq!(smc.sync_buffer_for_cpu(&buf), 1);
    assert_eq!(smc.sync_buffer_for_device(&buf), 1);
    assert!(buf.chunks().all(|c| c.iter().all(|&b| b == 0xab)));

    smc.release_buffer(buf);
    let stats = sim.stats();
    assert_eq!((stats.mrs, stats.dma_mappings), (0, 0));
}

#[test]
fn local_buffer_has_no_region() {
    let (sim, smc, link) = link();
    let mut buf = smc.allocate_buffer(0).unwrap();
    smc.prepare_buffer(link, &mut buf, DmaDirection::ToDevice, None)
        .unwrap();
    assert!(buf.mr().is_none());
    assert_eq!(sim.stats().mr_allocs, 0);
    smc.release_buffer(buf);
    assert_eq!(sim.stats().dma_mappings, 0);
}

#[test]
fn release_after_port_down() {
    let (sim, smc, link) = link();
    let peer = smc.local_peer_info(link).unwrap();
    smc.bring_up_link(link, &peer).unwrap();
    let mut buf = smc.allocate_buffer(0).unwrap();
    let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
    smc.prepare_buffer(link, &mut buf, DmaDirection::FromDevice, Some(access))
        .unwrap();

    let h = sim.device_by_name("mlx0").unwrap();
    sim.change_port_state(h, 1, PortState::Down);
    smc.flush_port_events();
    assert!(matches!(smc.link_state(link), Err(Error::Terminated(_))));
    // the QP is gone, the registered region keeps its domain
    let stats = sim.stats();
    assert_eq!(
        (stats.qps, stats.pds, stats.mrs, stats.dma_mappings),
        (0, 1, 1, 1)
    );

    smc.release_buffer(buf);
    let stats = sim.stats();
    assert_eq!((stats.pds, stats.mrs, stats.dma_mappings), (0, 0, 0));
}

#[test]
fn release_after_device_removal() {
    let (sim, smc, link) = link();
    let mut buf = smc.allocate_buffer(1).unwrap();
    smc.prepare_buffer(
        link,
        &mut buf,
        DmaDirection::FromDevice,
        Some(AccessFlags::REMOTE_WRITE),
    )
    .unwrap();
    let h = buf.dma_device().unwrap();

    smc.remove_dev(h);
    assert!(smc.link_groups().is_empty());

    smc.release_buffer(buf);
    let stats = sim.stats();
    assert_eq!(
        (stats.qps, stats.cqs, stats.pds, stats.mrs, stats.dma_mappings),
        (0, 0, 0, 0, 0)
    );
}

#[test]
fn fragmented_buffer_cannot_be_registered() {
    let (sim, smc, link) = link();
    let mut buf = BufferSlot::alloc_fragmented(0, 2).unwrap();
    let err = smc
        .prepare_buffer(
            link,
            &mut buf,
            DmaDirection::FromDevice,
            Some(AccessFlags::REMOTE_WRITE),
        )
        .unwrap_err();
    assert!(matches!(err, Error::FragmentedRegion { mapped: 2 }));
    assert!(err.is_mapping());

    // the failed registration left neither a region nor a mapping behind
    assert!(buf.mr().is_none());
    assert!(!buf.is_dma_mapped());
    let stats = sim.stats();
    assert_eq!(stats.mr_allocs, 1);
    assert_eq!((stats.mrs, stats.dma_mappings), (0, 0));
}
