use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;

use smc::{LinkRef, SmcIb};

pub(crate) mod config;
pub(crate) mod fabric;
pub(crate) mod logging;

use config::Config;

#[derive(Debug, Clone, Parser)]
#[command(name = "SMC-R link layer driver")]
struct Opts {
    /// smcd config path
    #[arg(short, long, default_value = "smcd.toml")]
    config: PathBuf,
    #[arg(long)]
    no_ansi: bool,
}

fn report_devices(smc: &SmcIb) {
    for id in smc.devices() {
        match smc.device_info(id) {
            Ok(info) => {
                for p in info.ports {
                    tracing::info!(
                        "{} port {}: {:?} mtu {:?} mac {:?}",
                        id,
                        p.port,
                        p.state,
                        p.active_mtu,
                        p.mac
                    );
                }
            }
            Err(e) => tracing::warn!("{}: {}", id, e),
        }
    }
}

fn report_link(smc: &SmcIb, name: &str, link: LinkRef) {
    match smc.link_info(link) {
        Ok(info) => tracing::info!(
            "{} {}/{} on {} port {}: {:?} qpn {} path mtu {:?}",
            name,
            info.lgr,
            info.id,
            info.device,
            info.port,
            info.state,
            info.qp.0 .0,
            info.path_mtu
        ),
        Err(e) => tracing::info!("{} {}/{}: {}", name, link.lgr, link.link, e),
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let config = Config::from_path(&opts.config)?;

    // stdout gets SMC_LOG, the optional tracing output gets event.log and tracing.json
    let _guards = logging::init_log(&config, !opts.no_ansi)?;

    let sim = Arc::new(fabric::build(&config.fabric)?);
    let smc = SmcIb::new(sim.clone())?;
    let num_devices = smc.register_client()?;
    tracing::info!(
        "{} devices registered, system id {:02x?}",
        num_devices,
        smc.system_id()
    );
    report_devices(&smc);

    let mut pairs = Vec::with_capacity(config.links.len());
    for link in &config.links {
        let pair = fabric::connect(&sim, &smc, link)?;
        report_link(&smc, "server", pair.server);
        report_link(&smc, "client", pair.client);
        pairs.push(pair);
    }

    for event in &config.events {
        let handle = sim
            .device_by_name(&event.device)
            .ok_or_else(|| anyhow!("unknown device {}", event.device))?;
        tracing::info!("{} port {} -> {:?}", event.device, event.port, event.state);
        sim.change_port_state(handle, event.port, event.state);
        smc.flush_port_events();
        for pair in &pairs {
            report_link(&smc, "server", pair.server);
            report_link(&smc, "client", pair.client);
        }
    }

    for pair in pairs {
        fabric::disconnect(&smc, pair);
    }
    smc.unregister_client();
    Ok(())
}
