//! Asynchronous hardware events and the per-device port worker.
//!
//! Event callbacks run in the provider's event context. They only record which port is affected
//! in the device's port-event mask and schedule the worker; all querying and link termination
//! happens on the worker.
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use rdma::{AsyncEvent, EventElement, EventHandler, EventKind, QpEventHandler};

use crate::device::IbDevice;
use crate::ib::Shared;

pub(crate) fn global_event_handler(dev: Weak<IbDevice>) -> EventHandler {
    Arc::new(move |event: &AsyncEvent| {
        if let Some(dev) = dev.upgrade() {
            handle_global_event(&dev, event);
        }
    })
}

/// Handler for events affiliated with one link's QP. `port` is the port the link runs on.
pub(crate) fn qp_event_handler(dev: Weak<IbDevice>, port: u8) -> QpEventHandler {
    Arc::new(move |event: &AsyncEvent| {
        if let Some(dev) = dev.upgrade() {
            handle_qp_event(&dev, port, event);
        }
    })
}

fn handle_global_event(dev: &IbDevice, event: &AsyncEvent) {
    let port = match event.element {
        EventElement::Port(p) => Some(p),
        _ => None,
    };
    match event.kind {
        // a fatal device error takes every port down with it
        EventKind::DeviceFatal => dev.schedule_port_event(port),
        EventKind::PortErr | EventKind::PortActive | EventKind::GidChange => match port {
            Some(p) => dev.schedule_port_event(Some(p)),
            None => tracing::warn!(device = %dev.id, "{:?} without a port", event.kind),
        },
        _ => {}
    }
}

fn handle_qp_event(dev: &IbDevice, port: u8, event: &AsyncEvent) {
    match event.kind {
        EventKind::DeviceFatal
        | EventKind::GidChange
        | EventKind::PortErr
        | EventKind::QpAccessErr => {
            tracing::debug!(device = %dev.id, port, "qp event {:?}", event.kind);
            dev.schedule_port_event(Some(port));
        }
        _ => {}
    }
}

impl Shared {
    /// The port worker: refresh every port with a pending event and terminate the link groups
    /// of ports that are no longer active.
    pub(crate) fn handle_port_events(&self, dev: &Arc<IbDevice>) {
        for port in 1..=dev.num_ports() {
            if dev.is_gone() {
                return;
            }
            let bit = 1u64 << (port - 1);
            if dev.port_event_mask.fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
                continue;
            }
            if let Err(e) = self.remember_port_attr(dev, port) {
                tracing::warn!(device = %dev.id, port, "remember_port_attr: {}", e);
            }
            if !dev.port_active(port) {
                tracing::info!(device = %dev.id, port, "port down, terminating its link groups");
                self.port_terminate(dev.id, port);
            }
        }
    }
}
