use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::executor::ThreadPool;
use lazy_static::lazy_static;
use rdma::Verbs;

use crate::device::DeviceRegistry;
use crate::lgr::{LgrId, LinkGroup};
use crate::resource::ResourceTable;
use crate::systemid::SystemId;
use crate::workqueue;
use crate::{Error, Result};

lazy_static! {
    /// The identifier of this host, shared by every [`SmcIb`] built with [`SmcIb::new`].
    pub static ref LOCAL_SYSTEMID: Arc<SystemId> = Arc::new(SystemId::new());
}

/// State reachable from event callbacks and deferred work.
pub(crate) struct Shared {
    pub(crate) verbs: Arc<dyn Verbs>,
    pub(crate) devices: DeviceRegistry,
    pub(crate) lgrs: ResourceTable<LgrId, LinkGroup>,
    pub(crate) system_id: Arc<SystemId>,
    pub(crate) pool: ThreadPool,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The RDMA link layer.
///
/// Dropping it removes every device, which terminates all link groups.
pub struct SmcIb {
    pub(crate) inner: Arc<Shared>,
}

impl fmt::Debug for SmcIb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmcIb")
            .field("devices", &self.inner.devices)
            .field("lgrs", &self.inner.lgrs.len())
            .field("system_id", &self.inner.system_id)
            .finish()
    }
}

impl SmcIb {
    pub fn new(verbs: Arc<dyn Verbs>) -> Result<Self> {
        Self::with_system_id(verbs, Arc::clone(&LOCAL_SYSTEMID))
    }

    /// Use `system_id` instead of the process-wide identifier.
    pub fn with_system_id(verbs: Arc<dyn Verbs>, system_id: Arc<SystemId>) -> Result<Self> {
        let pool = workqueue::build_pool().map_err(Error::WorkQueue)?;
        Ok(SmcIb {
            inner: Arc::new(Shared {
                verbs,
                devices: DeviceRegistry::default(),
                lgrs: ResourceTable::default(),
                system_id,
                pool,
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Add every device the provider currently reports. Returns how many were added.
    ///
    /// A device that cannot be queried is skipped.
    pub fn register_client(&self) -> Result<usize> {
        let mut added = 0;
        for handle in self.inner.verbs.devices()? {
            match self.add_dev(handle) {
                Ok(Some(_)) => added += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("add_dev {:?}: {}", handle, e),
            }
        }
        Ok(added)
    }

    /// Remove every device.
    pub fn unregister_client(&self) {
        for dev in self.inner.devices.list() {
            self.remove_dev(dev.handle);
        }
    }

    #[inline]
    pub fn system_id(&self) -> [u8; 8] {
        self.inner.system_id.get()
    }

    #[inline]
    pub fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.inner.verbs
    }
}

impl Drop for SmcIb {
    fn drop(&mut self) {
        self.unregister_client();
    }
}
