//! A simulated fabric described by the config, and the loopback link pairs run over it.
use anyhow::{anyhow, Context, Result};

use rdma::sim::{SimDeviceSpec, SimPortSpec, SimVerbs};
use rdma::{AccessFlags, DmaDirection, MacAddr, NodeType};
use smc::buf::compress_bufsize;
use smc::{BufferSlot, DeviceId, LinkRef, Role, SmcIb};

use crate::config::{FabricConfig, LinkConfig, LinkEnd};

pub fn build(config: &FabricConfig) -> Result<SimVerbs> {
    let sim = SimVerbs::new();
    for dev in &config.devices {
        let ports = dev
            .ports
            .iter()
            .map(|p| {
                let mac = match &p.mac {
                    Some(s) => Some(s.parse::<MacAddr>().map_err(|e| anyhow!(e))?),
                    None => None,
                };
                Ok(SimPortSpec {
                    state: p.state,
                    active_mtu: p.mtu,
                    mac,
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("device {}", dev.name))?;
        let handle = sim.add_device(SimDeviceSpec {
            name: dev.name.clone(),
            node_type: NodeType::Ca,
            ports,
        });
        tracing::debug!("fabric: {} is {:?}", dev.name, handle);
    }
    Ok(sim)
}

/// A connected responder/initiator pair and the server's receive buffer, if any.
pub struct LinkPair {
    pub server: LinkRef,
    pub client: LinkRef,
    pub rmb: Option<BufferSlot>,
}

fn device_of(sim: &SimVerbs, smc: &SmcIb, end: &LinkEnd) -> Result<DeviceId> {
    let handle = sim
        .device_by_name(&end.device)
        .ok_or_else(|| anyhow!("unknown device {}", end.device))?;
    smc.find_device(handle)
        .ok_or_else(|| anyhow!("device {} is not registered", end.device))
}

/// Create both ends, exchange their addressing and bring them to RTS.
pub fn connect(sim: &SimVerbs, smc: &SmcIb, config: &LinkConfig) -> Result<LinkPair> {
    let server = smc.create_link(
        device_of(sim, smc, &config.server)?,
        config.server.port,
        Role::Server,
    )?;
    let client = match smc.create_link(
        device_of(sim, smc, &config.client)?,
        config.client.port,
        Role::Client,
    ) {
        Ok(link) => link,
        Err(e) => {
            smc.terminate_link_group(server.lgr);
            return Err(e.into());
        }
    };

    let res = bring_up(smc, server, client, config.rmb_size);
    if res.is_err() {
        smc.terminate_link_group(server.lgr);
        smc.terminate_link_group(client.lgr);
    }
    res
}

fn bring_up(
    smc: &SmcIb,
    server: LinkRef,
    client: LinkRef,
    rmb_size: Option<usize>,
) -> Result<LinkPair> {
    let to_server = smc.local_peer_info(server)?;
    let to_client = smc.local_peer_info(client)?;
    smc.bring_up_link(server, &to_client)
        .context("responder bring-up")?;
    smc.bring_up_link(client, &to_server)
        .context("initiator bring-up")?;
    // the initiator's handshake is done once the responder is ready
    smc.modify_qp_rts(client)?;

    let rmb = match rmb_size {
        Some(size) => {
            let mut buf = smc.allocate_buffer(compress_bufsize(size))?;
            let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
            smc.prepare_buffer(server, &mut buf, DmaDirection::FromDevice, Some(access))?;
            Some(buf)
        }
        None => None,
    };
    Ok(LinkPair {
        server,
        client,
        rmb,
    })
}

/// Release the pair's buffer and terminate both groups. Either group may already be gone.
pub fn disconnect(smc: &SmcIb, pair: LinkPair) {
    if let Some(buf) = pair.rmb {
        smc.release_buffer(buf);
    }
    smc.terminate_link_group(pair.server.lgr);
    smc.terminate_link_group(pair.client.lgr);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rdma::{PortState, QpState};
    use smc::SystemId;

    use super::*;
    use crate::config::{DeviceConfig, PortConfig};

    fn two_port_fabric() -> FabricConfig {
        FabricConfig {
            devices: vec![DeviceConfig {
                name: "mlx5_0".to_owned(),
                ports: vec![port("02:00:00:00:00:01"), port("02:00:00:00:00:02")],
            }],
        }
    }

    fn loopback_link() -> LinkConfig {
        LinkConfig {
            server: LinkEnd {
                device: "mlx5_0".to_owned(),
                port: 1,
            },
            client: LinkEnd {
                device: "mlx5_0".to_owned(),
                port: 2,
            },
            rmb_size: Some(20000),
        }
    }

    fn port(mac: &str) -> PortConfig {
        PortConfig {
            mac: Some(mac.to_owned()),
            state: PortState::Active,
            mtu: Default::default(),
        }
    }

    #[test]
    fn connect_and_disconnect() {
        let sim = Arc::new(build(&two_port_fabric()).unwrap());
        let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
        assert_eq!(smc.register_client().unwrap(), 1);

        let pair = connect(&sim, &smc, &loopback_link()).unwrap();
        assert_eq!(smc.link_state(pair.client).unwrap(), QpState::Rts);
        assert_eq!(pair.rmb.as_ref().unwrap().size(), 32768);

        disconnect(&smc, pair);
        assert!(smc.link_groups().is_empty());
        let stats = sim.stats();
        assert_eq!(
            (stats.qps, stats.pds, stats.mrs, stats.dma_mappings),
            (0, 0, 0, 0)
        );
    }

    #[test]
    fn disconnect_after_port_down() {
        let sim = Arc::new(build(&two_port_fabric()).unwrap());
        let smc = SmcIb::with_system_id(sim.clone(), Arc::new(SystemId::new())).unwrap();
        smc.register_client().unwrap();
        let pair = connect(&sim, &smc, &loopback_link()).unwrap();

        let handle = sim.device_by_name("mlx5_0").unwrap();
        sim.change_port_state(handle, 1, PortState::Down);
        smc.flush_port_events();
        assert_eq!(smc.link_groups(), vec![pair.client.lgr]);

        disconnect(&smc, pair);
        let stats = sim.stats();
        assert_eq!(
            (stats.qps, stats.pds, stats.mrs, stats.dma_mappings),
            (0, 0, 0, 0)
        );
    }

    #[test]
    fn bad_mac_is_rejected() {
        let fabric = FabricConfig {
            devices: vec![DeviceConfig {
                name: "mlx5_0".to_owned(),
                ports: vec![port("02:00:00")],
            }],
        };
        assert!(build(&fabric).is_err());
    }
}
