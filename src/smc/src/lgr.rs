use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rdma::{QpAttr, QpAttrMask, QpState};

use crate::device::DeviceId;
use crate::ib::{Shared, SmcIb};
use crate::link::{Link, LinkId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LgrId(pub(crate) u64);

impl fmt::Display for LgrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lgr{}", self.0)
    }
}

/// Which side of the connection set-up this host plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiator. Moves to RTS only once the session layer confirms the peer.
    Client,
    /// Responder. Moves to RTS as part of bring-up.
    Server,
}

/// A set of links to the same peer. Owns its links; terminating the group frees all of them.
pub(crate) struct LinkGroup {
    pub(crate) id: LgrId,
    pub(crate) role: Role,
    links: spin::Mutex<Vec<Link>>,
    terminated: AtomicBool,
}

impl fmt::Debug for LinkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkGroup")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("links", &self.links.lock().len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl LinkGroup {
    pub(crate) fn new(id: LgrId, role: Role) -> Self {
        LinkGroup {
            id,
            role,
            links: spin::Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Run `f` on link `id` with the group locked. `f` must not call into the hardware.
    pub(crate) fn with_link<T, F>(&self, id: LinkId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Link) -> T,
    {
        let mut links = self.links.lock();
        match links.iter_mut().find(|l| l.id == id) {
            Some(link) => Ok(f(link)),
            None if self.is_terminated() => Err(Error::Terminated(self.id)),
            None => Err(Error::NotFound),
        }
    }

    /// Add a link. Hands the link back if the group was terminated in the meantime.
    pub(crate) fn push_link(&self, link: Link) -> std::result::Result<(), Link> {
        let mut links = self.links.lock();
        if self.is_terminated() {
            return Err(link);
        }
        links.push(link);
        Ok(())
    }

    pub(crate) fn take_link(&self, id: LinkId) -> Option<Link> {
        let mut links = self.links.lock();
        let pos = links.iter().position(|l| l.id == id)?;
        Some(links.remove(pos))
    }

    pub(crate) fn link_ids(&self) -> Vec<LinkId> {
        self.links.lock().iter().map(|l| l.id).collect()
    }

    /// Whether any link runs on `dev`, on `port` if given.
    pub(crate) fn uses(&self, dev: DeviceId, port: Option<u8>) -> bool {
        self.links
            .lock()
            .iter()
            .any(|l| l.device == dev && port.map_or(true, |p| l.ibport == p))
    }
}

impl Shared {
    /// Release a link's QP and its reference to the PD. The link has already been taken out of
    /// its group.
    ///
    /// The PD itself goes once no memory region registered in it is left.
    pub(crate) fn free_link(&self, link: Link) {
        if link.state != QpState::Reset {
            let attr = QpAttr {
                qp_state: QpState::Reset,
                ..Default::default()
            };
            if let Err(e) = self.verbs.modify_qp(link.qp, &attr, QpAttrMask::STATE) {
                tracing::debug!(link = %link.id, "reset before destroy: {}", e);
            }
        }
        if let Err(e) = self.verbs.destroy_qp(link.qp) {
            tracing::warn!(link = %link.id, "destroy_qp: {}", e);
        }
        tracing::debug!(link = %link.id, lgr = %link.lgr, "link freed");
        drop(link);
    }

    /// Terminate a link group and free its links. Terminating twice does nothing.
    pub(crate) fn terminate_lgr(&self, lgr: &LinkGroup) {
        if lgr.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        // ignore NotFound: the group may not have been published yet
        let _ = self.lgrs.remove(&lgr.id);
        let links = std::mem::take(&mut *lgr.links.lock());
        tracing::info!(lgr = %lgr.id, "terminating with {} links", links.len());
        for link in links {
            self.free_link(link);
        }
    }

    /// Terminate every link group with a link on `port` of `dev`.
    pub(crate) fn port_terminate(&self, dev: DeviceId, port: u8) {
        for lgr in self.lgrs.collect(|g| g.uses(dev, Some(port))) {
            self.terminate_lgr(&lgr);
        }
    }

    /// Terminate every link group with a link on `dev`.
    pub(crate) fn device_terminate(&self, dev: DeviceId) {
        for lgr in self.lgrs.collect(|g| g.uses(dev, None)) {
            self.terminate_lgr(&lgr);
        }
    }

    pub(crate) fn lgr(&self, id: LgrId) -> Result<Arc<LinkGroup>> {
        self.lgrs.get(&id).map_err(|_| Error::Terminated(id))
    }
}

impl SmcIb {
    /// Terminate a link group, freeing all of its links.
    pub fn terminate_link_group(&self, id: LgrId) {
        if let Ok(lgr) = self.inner.lgrs.get(&id) {
            self.inner.terminate_lgr(&lgr);
        }
    }

    pub fn link_groups(&self) -> Vec<LgrId> {
        let mut ids: Vec<_> = self.inner.lgrs.collect(|_| true).iter().map(|g| g.id).collect();
        ids.sort();
        ids
    }

    /// Links currently owned by a group. A terminated or unknown group has none.
    pub fn links(&self, id: LgrId) -> Vec<LinkId> {
        self.inner
            .lgrs
            .get(&id)
            .map(|g| g.link_ids())
            .unwrap_or_default()
    }

    pub fn role(&self, id: LgrId) -> Result<Role> {
        Ok(self.inner.lgr(id)?.role)
    }
}
