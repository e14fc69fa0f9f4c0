use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use rdma::{
    CompletionQueue, CqInitAttr, DeviceAttr, DeviceHandle, EventHandlerToken, Gid, MacAddr, Mtu,
    NodeType, PortAttr, PortState,
};

use crate::config::{SMC_MAX_PORTS, SMC_WR_MAX_CQE};
use crate::event;
use crate::ib::{Shared, SmcIb};
use crate::systemid::ensure_system_id;
use crate::workqueue::WorkItem;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ib{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PortInfo {
    pub(crate) attr: PortAttr,
    pub(crate) gid: Gid,
    pub(crate) mac: Option<MacAddr>,
}

/// What `setup` allocates and device cleanup releases.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceResources {
    pub(crate) send_cq: CompletionQueue,
    pub(crate) recv_cq: CompletionQueue,
    pub(crate) event_handler: EventHandlerToken,
}

pub(crate) struct IbDevice {
    pub(crate) id: DeviceId,
    pub(crate) handle: DeviceHandle,
    pub(crate) attr: DeviceAttr,
    ports: spin::Mutex<Vec<PortInfo>>,
    resources: spin::Mutex<Option<DeviceResources>>,
    setup_lock: Mutex<()>,
    /// Shared by link creations from the PD allocation until the link is in its group; removal
    /// takes it exclusively.
    creation: RwLock<()>,
    initialized: AtomicBool,
    gone: AtomicBool,
    /// One bit per port with an event not yet handled by the port worker.
    pub(crate) port_event_mask: AtomicU64,
    pub(crate) port_event_work: WorkItem,
}

impl fmt::Debug for IbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IbDevice")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("initialized", &self.is_initialized())
            .field("gone", &self.is_gone())
            .finish()
    }
}

impl IbDevice {
    #[inline]
    pub(crate) fn num_ports(&self) -> u8 {
        self.attr.phys_port_cnt.min(SMC_MAX_PORTS as u8)
    }

    #[inline]
    pub(crate) fn valid_port(&self, port: u8) -> bool {
        port >= 1 && port <= self.num_ports()
    }

    #[inline]
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_gone(&self) -> bool {
        self.gone.load(Ordering::Acquire)
    }

    /// Whether the cached attributes of `port` say it is active.
    pub(crate) fn port_active(&self, port: u8) -> bool {
        self.with_port(port, |p| p.attr.state == PortState::Active)
            .unwrap_or(false)
    }

    pub(crate) fn port_mac(&self, port: u8) -> Option<MacAddr> {
        self.with_port(port, |p| p.mac).flatten()
    }

    pub(crate) fn port_gid(&self, port: u8) -> Option<Gid> {
        self.with_port(port, |p| p.gid)
    }

    pub(crate) fn port_mtu(&self, port: u8) -> Option<Mtu> {
        self.with_port(port, |p| p.attr.active_mtu)
    }

    pub(crate) fn with_port<T, F>(&self, port: u8, f: F) -> Option<T>
    where
        F: FnOnce(&mut PortInfo) -> T,
    {
        if !self.valid_port(port) {
            return None;
        }
        self.ports.lock().get_mut(port as usize - 1).map(f)
    }

    /// Keep removal out until the guard is dropped. Fails once the device is being removed.
    pub(crate) fn begin_link_creation(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let guard = self.creation.read().unwrap_or_else(PoisonError::into_inner);
        if self.is_gone() {
            return Err(Error::DeviceGone(self.id));
        }
        Ok(guard)
    }

    /// Mark the device gone and wait for link creations already under way.
    fn quiesce(&self) -> RwLockWriteGuard<'_, ()> {
        self.gone.store(true, Ordering::Release);
        self.creation.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn resources(&self) -> Result<DeviceResources> {
        (*self.resources.lock()).ok_or(Error::NotInitialized(self.id))
    }

    /// Record an event for `port`, or for every port when `None`, and kick the port worker.
    ///
    /// Called from event context; never blocks.
    pub(crate) fn schedule_port_event(&self, port: Option<u8>) {
        let bits = match port {
            Some(p) if self.valid_port(p) => 1u64 << (p - 1),
            Some(_) => return,
            None => (1u64 << self.num_ports()) - 1,
        };
        self.port_event_mask.fetch_or(bits, Ordering::AcqRel);
        self.port_event_work.schedule();
    }
}

/// All known devices, in discovery order.
///
/// The lock only covers the list; nothing calls into the hardware while holding it.
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    list: spin::Mutex<Vec<Arc<IbDevice>>>,
}

impl DeviceRegistry {
    pub(crate) fn get(&self, id: DeviceId) -> Result<Arc<IbDevice>> {
        self.list
            .lock()
            .iter()
            .find(|d| d.id == id)
            .map(Arc::clone)
            .ok_or(Error::DeviceGone(id))
    }

    pub(crate) fn find_by_handle(&self, handle: DeviceHandle) -> Option<Arc<IbDevice>> {
        self.list
            .lock()
            .iter()
            .find(|d| d.handle == handle)
            .map(Arc::clone)
    }

    pub(crate) fn list(&self) -> Vec<Arc<IbDevice>> {
        self.list.lock().clone()
    }

    /// Returns the device already registered for the same handle, if any, instead of inserting.
    fn insert(&self, dev: Arc<IbDevice>) -> std::result::Result<(), Arc<IbDevice>> {
        let mut list = self.list.lock();
        if let Some(existing) = list.iter().find(|d| d.handle == dev.handle) {
            return Err(Arc::clone(existing));
        }
        list.push(dev);
        Ok(())
    }

    fn remove_by_handle(&self, handle: DeviceHandle) -> Option<Arc<IbDevice>> {
        let mut list = self.list.lock();
        let pos = list.iter().position(|d| d.handle == handle)?;
        Some(list.remove(pos))
    }
}

/// A snapshot of one port as the link layer last saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub port: u8,
    pub state: PortState,
    pub active_mtu: Mtu,
    pub gid: Gid,
    pub mac: Option<MacAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub handle: DeviceHandle,
    pub initialized: bool,
    pub ports: Vec<PortStatus>,
}

impl Shared {
    /// Create CQs and register the asynchronous event handler, once.
    pub(crate) fn setup_device(&self, dev: &Arc<IbDevice>) -> Result<()> {
        let _guard = dev
            .setup_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if dev.is_initialized() {
            return Ok(());
        }
        if dev.is_gone() {
            return Err(Error::DeviceGone(dev.id));
        }

        let cq_attr = CqInitAttr {
            cqe: SMC_WR_MAX_CQE,
            comp_vector: 0,
        };
        let send_cq = self
            .verbs
            .create_cq(dev.handle, &cq_attr)
            .map_err(Error::CreateCq)?;
        let recv_cq = match self.verbs.create_cq(dev.handle, &cq_attr) {
            Ok(cq) => cq,
            Err(e) => {
                self.destroy_cq(dev, send_cq);
                return Err(Error::CreateCq(e));
            }
        };
        let handler = event::global_event_handler(Arc::downgrade(dev));
        let event_handler = match self.verbs.register_event_handler(dev.handle, handler) {
            Ok(token) => token,
            Err(e) => {
                self.destroy_cq(dev, recv_cq);
                self.destroy_cq(dev, send_cq);
                return Err(Error::EventHandler(e));
            }
        };

        *dev.resources.lock() = Some(DeviceResources {
            send_cq,
            recv_cq,
            event_handler,
        });
        dev.initialized.store(true, Ordering::Release);
        tracing::debug!(device = %dev.id, "device set up");
        Ok(())
    }

    fn destroy_cq(&self, dev: &IbDevice, cq: CompletionQueue) {
        if let Err(e) = self.verbs.destroy_cq(cq) {
            tracing::warn!(device = %dev.id, "destroy_cq {:?}: {}", cq, e);
        }
    }

    /// Undo `setup_device`. Does nothing for a device that was never set up.
    fn cleanup_device(&self, dev: &IbDevice) {
        let _guard = dev
            .setup_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !dev.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        let resources = dev.resources.lock().take();
        if let Some(res) = resources {
            if let Err(e) = self.verbs.unregister_event_handler(res.event_handler) {
                tracing::warn!(device = %dev.id, "unregister_event_handler: {}", e);
            }
            self.destroy_cq(dev, res.recv_cq);
            self.destroy_cq(dev, res.send_cq);
        }
    }

    /// Refresh the cached attributes, GID and MAC of `port`.
    pub(crate) fn remember_port_attr(&self, dev: &IbDevice, port: u8) -> Result<()> {
        if dev.with_port(port, |p| *p = PortInfo::default()).is_none() {
            return Err(Error::InvalidPort(port));
        }
        let attr = self.verbs.query_port(dev.handle, port)?;
        let gid = self.verbs.query_gid(dev.handle, port, 0)?;
        dev.with_port(port, |p| {
            p.attr = attr;
            p.gid = gid.gid;
            p.mac = gid.ndev_mac;
        });
        if gid.ndev_mac.is_none() {
            return Err(Error::NoNetDevice(port));
        }
        ensure_system_id(&self.system_id, dev, port);
        Ok(())
    }
}

impl SmcIb {
    /// Discovery callback. Returns `None` for devices the link layer does not drive.
    ///
    /// Adding a device that is already known returns its existing id.
    pub fn add_dev(&self, handle: DeviceHandle) -> Result<Option<DeviceId>> {
        if let Some(dev) = self.inner.devices.find_by_handle(handle) {
            return Ok(Some(dev.id));
        }
        let attr = self.inner.verbs.query_device(handle)?;
        if attr.node_type != NodeType::Ca {
            tracing::debug!("ignoring {:?} of type {:?}", handle, attr.node_type);
            return Ok(None);
        }

        let id = DeviceId(self.inner.next_id());
        let shared = Arc::downgrade(&self.inner);
        let pool = self.inner.pool.clone();
        let dev = Arc::new_cyclic(|weak: &Weak<IbDevice>| {
            let weak = Weak::clone(weak);
            let nports = attr.phys_port_cnt.min(SMC_MAX_PORTS as u8) as usize;
            IbDevice {
                id,
                handle,
                attr,
                ports: spin::Mutex::new(vec![PortInfo::default(); nports]),
                resources: spin::Mutex::new(None),
                setup_lock: Mutex::new(()),
                creation: RwLock::new(()),
                initialized: AtomicBool::new(false),
                gone: AtomicBool::new(false),
                port_event_mask: AtomicU64::new(0),
                port_event_work: WorkItem::new(pool, move || {
                    if let (Some(shared), Some(dev)) = (shared.upgrade(), weak.upgrade()) {
                        shared.handle_port_events(&dev);
                    }
                }),
            }
        });

        for port in 1..=dev.num_ports() {
            if let Err(e) = self.inner.remember_port_attr(&dev, port) {
                tracing::warn!(device = %id, port, "remember_port_attr: {}", e);
            }
        }

        match self.inner.devices.insert(Arc::clone(&dev)) {
            Ok(()) => {
                tracing::info!(device = %id, "added {:?} with {} ports", handle, dev.num_ports());
                Ok(Some(id))
            }
            Err(existing) => Ok(Some(existing.id)),
        }
    }

    /// Removal callback. Terminates every link group using the device before releasing it.
    pub fn remove_dev(&self, handle: DeviceHandle) {
        let dev = match self.inner.devices.remove_by_handle(handle) {
            Some(dev) => dev,
            None => return,
        };
        let quiesced = dev.quiesce();
        self.inner.device_terminate(dev.id);
        self.inner.cleanup_device(&dev);
        drop(quiesced);
        dev.port_event_work.flush();
        tracing::info!(device = %dev.id, "removed {:?}", handle);
    }

    /// Allocate the per-device completion queues and event handler.
    ///
    /// Link creation does this on demand; an already set-up device returns `Ok`.
    pub fn setup_dev(&self, id: DeviceId) -> Result<()> {
        let dev = self.inner.devices.get(id)?;
        self.inner.setup_device(&dev)
    }

    pub fn port_active(&self, id: DeviceId, port: u8) -> Result<bool> {
        let dev = self.inner.devices.get(id)?;
        if !dev.valid_port(port) {
            return Err(Error::InvalidPort(port));
        }
        Ok(dev.port_active(port))
    }

    /// Wait until every port event delivered so far has been handled.
    pub fn flush_port_events(&self) {
        for dev in self.inner.devices.list() {
            dev.port_event_work.flush();
        }
    }

    pub fn find_device(&self, handle: DeviceHandle) -> Option<DeviceId> {
        self.inner.devices.find_by_handle(handle).map(|d| d.id)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.inner.devices.list().iter().map(|d| d.id).collect()
    }

    pub fn device_info(&self, id: DeviceId) -> Result<DeviceInfo> {
        let dev = self.inner.devices.get(id)?;
        let ports = (1..=dev.num_ports())
            .filter_map(|port| {
                dev.with_port(port, |p| PortStatus {
                    port,
                    state: p.attr.state,
                    active_mtu: p.attr.active_mtu,
                    gid: p.gid,
                    mac: p.mac,
                })
            })
            .collect();
        Ok(DeviceInfo {
            id,
            handle: dev.handle,
            initialized: dev.is_initialized(),
            ports,
        })
    }
}
