//! The host's system identifier: two random bytes followed by the MAC of the first active port
//! seen. Assigned once per process and never changed afterwards.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rdma::MacAddr;

use crate::device::IbDevice;

/// Value of an identifier that has not been assigned yet.
pub const SYSTEMID_UNSET: [u8; 8] = *b"%%%%%%%\0";

pub struct SystemId(AtomicU64);

impl SystemId {
    pub const fn new() -> Self {
        SystemId(AtomicU64::new(u64::from_be_bytes(SYSTEMID_UNSET)))
    }

    #[inline]
    pub fn get(&self) -> [u8; 8] {
        self.0.load(Ordering::Acquire).to_be_bytes()
    }

    #[inline]
    pub fn is_assigned(&self) -> bool {
        self.get() != SYSTEMID_UNSET
    }

    /// Assign the identifier from `mac` unless it already has a value. Returns whether this call
    /// assigned it.
    pub fn assign(&self, mac: MacAddr) -> bool {
        let mut id = [0u8; 8];
        rand::thread_rng().fill(&mut id[..2]);
        id[2..].copy_from_slice(&mac.0);
        self.0
            .compare_exchange(
                u64::from_be_bytes(SYSTEMID_UNSET),
                u64::from_be_bytes(id),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for SystemId {
    fn default() -> Self {
        SystemId::new()
    }
}

impl fmt::Debug for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.get();
        if id == SYSTEMID_UNSET {
            return f.write_str("SystemId(unset)");
        }
        write!(f, "SystemId(")?;
        for b in id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Take the identifier from `port` of `dev` if nothing has assigned it yet and the port is up.
pub(crate) fn ensure_system_id(id: &SystemId, dev: &IbDevice, port: u8) {
    if id.is_assigned() || !dev.port_active(port) {
        return;
    }
    if let Some(mac) = dev.port_mac(port) {
        if id.assign(mac) {
            tracing::info!(device = %dev.id, port, "system id set to {:?}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        let id = SystemId::new();
        assert!(!id.is_assigned());
        assert_eq!(&id.get(), b"%%%%%%%\0");
    }

    #[test]
    fn assigned_once() {
        let id = SystemId::new();
        let first = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
        assert!(id.assign(first));
        let value = id.get();
        assert_eq!(&value[2..], &first.0);
        assert!(!id.assign(MacAddr([0x02, 0, 0, 0, 0, 0x02])));
        assert_eq!(id.get(), value);
    }
}
