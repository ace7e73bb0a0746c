//! Harbor bookkeeping: cluster addressing without cluster scheduling.
//!
//! The harbor id occupies the high byte of every handle. This runtime only
//! classifies handles as local or remote; forwarding to another harbor is
//! a transport concern that lives outside the scheduler, so remote sends
//! are reported and dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::handle::{Handle, HANDLE_MASK, HARBOR_SHIFT};

pub(crate) struct Harbor {
    /// Local harbor id, pre-shifted into handle position. 0 = standalone.
    local: u32,
    dropped: AtomicU64,
}

impl Harbor {
    pub(crate) fn new(id: u8) -> Harbor {
        if id != 0 {
            log::info!("harbor {} initialized", id);
        }
        Harbor {
            local: (id as u32) << HARBOR_SHIFT,
            dropped: AtomicU64::new(0),
        }
    }

    /// A handle is remote when it carries a non-zero harbor byte other
    /// than ours.
    pub(crate) fn is_remote(&self, handle: Handle) -> bool {
        let harbor = handle & !HANDLE_MASK;
        harbor != 0 && harbor != self.local
    }

    pub(crate) fn count_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs before socket teardown so a forwarding layer layered on top
    /// could still flush. Here it only accounts for what was dropped.
    pub(crate) fn exit(&self) {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("harbor exit: {} remote messages were dropped", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_treats_everything_as_local() {
        let harbor = Harbor::new(0);
        assert!(!harbor.is_remote(0x0000_0001));
        assert!(harbor.is_remote(0x0100_0001));
    }

    #[test]
    fn own_harbor_byte_is_local() {
        let harbor = Harbor::new(2);
        assert!(!harbor.is_remote(0x0200_0005));
        assert!(!harbor.is_remote(0x0000_0005));
        assert!(harbor.is_remote(0x0300_0005));
    }
}
