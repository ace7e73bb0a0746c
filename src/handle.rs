//! The service handle registry.
//!
//! A handle is a 32-bit id: the high byte is the harbor id (cluster
//! addressing), the low 24 bits index this registry. Index 0 is reserved
//! to mean "no service".

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::context::ServiceContext;
use crate::error::Error;

/// A 32-bit identifier uniquely naming a service for its lifetime.
pub type Handle = u32;

/// Low 24 bits of a handle: the registry index.
pub const HANDLE_MASK: Handle = 0x00ff_ffff;
/// The harbor id lives in the byte above the index.
pub const HARBOR_SHIFT: u32 = 24;

struct RegistryInner {
    next_index: u32,
    /// Indices pinned by a replay driver; consumed before fresh allocation.
    pinned: VecDeque<u32>,
    slots: HashMap<u32, Arc<ServiceContext>>,
    names: HashMap<String, Handle>,
}

pub(crate) struct HandleRegistry {
    harbor: u32,
    inner: RwLock<RegistryInner>,
}

impl HandleRegistry {
    pub(crate) fn new(harbor: u8) -> HandleRegistry {
        HandleRegistry {
            harbor: (harbor as u32) << HARBOR_SHIFT,
            inner: RwLock::new(RegistryInner {
                next_index: 1,
                pinned: VecDeque::new(),
                slots: HashMap::new(),
                names: HashMap::new(),
            }),
        }
    }

    /// Allocate a handle and register the context built for it, atomically
    /// with respect to other registrations.
    pub(crate) fn register<F>(&self, make: F) -> Result<(Handle, Arc<ServiceContext>), Error>
    where
        F: FnOnce(Handle) -> Arc<ServiceContext>,
    {
        let mut r = self.inner.write().unwrap();
        if r.slots.len() as u32 >= HANDLE_MASK {
            return Err(Error::HandleExhausted);
        }
        let index = loop {
            if let Some(pinned) = r.pinned.pop_front() {
                let pinned = pinned & HANDLE_MASK;
                if pinned != 0 && !r.slots.contains_key(&pinned) {
                    break pinned;
                }
                log::error!("pinned handle index {:06x} is unavailable", pinned);
                continue;
            }
            let index = r.next_index & HANDLE_MASK;
            r.next_index = (r.next_index & HANDLE_MASK).wrapping_add(1);
            if index != 0 && !r.slots.contains_key(&index) {
                break index;
            }
        };
        let handle = self.harbor | index;
        let ctx = make(handle);
        r.slots.insert(index, ctx.clone());
        Ok((handle, ctx))
    }

    pub(crate) fn grab(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        let r = self.inner.read().unwrap();
        r.slots.get(&(handle & HANDLE_MASK)).cloned()
    }

    /// Pin the index the next allocation must use (replay `h` records).
    /// Pins queue up, one per recorded allocation.
    pub(crate) fn pin_index(&self, index: u32) {
        self.inner.write().unwrap().pinned.push_back(index & HANDLE_MASK);
    }

    pub(crate) fn findname(&self, name: &str) -> Option<Handle> {
        self.inner.read().unwrap().names.get(name).copied()
    }

    /// Bind a well-known name. Fails if the name is taken.
    pub(crate) fn namehandle(&self, handle: Handle, name: &str) -> bool {
        let mut r = self.inner.write().unwrap();
        if r.names.contains_key(name) {
            return false;
        }
        r.names.insert(name.to_string(), handle);
        true
    }

    /// Remove a service, dropping any names bound to it. Returns the
    /// removed context so the caller can release its inbox.
    pub(crate) fn retire(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        let mut r = self.inner.write().unwrap();
        let ctx = r.slots.remove(&(handle & HANDLE_MASK))?;
        r.names.retain(|_, h| *h != handle);
        Some(ctx)
    }

    pub(crate) fn all_handles(&self) -> Vec<Handle> {
        let r = self.inner.read().unwrap();
        r.slots.keys().map(|index| self.harbor | index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceContext;
    use crate::mq::Message;
    use crate::service::Service;
    use crate::Runtime;
    use std::sync::Arc;

    struct Null;
    impl Service for Null {
        fn message(&mut self, _rt: &Arc<Runtime>, _ctx: &ServiceContext, _msg: Message) {}
    }

    fn register_null(reg: &HandleRegistry) -> Handle {
        let (handle, _) = reg
            .register(|h| ServiceContext::new(h, "null", Box::new(Null)))
            .unwrap();
        handle
    }

    #[test]
    fn handles_carry_the_harbor_byte() {
        let reg = HandleRegistry::new(3);
        let h = register_null(&reg);
        assert_eq!(h >> HARBOR_SHIFT, 3);
        assert_eq!(h & HANDLE_MASK, 1);
    }

    #[test]
    fn index_zero_is_never_allocated() {
        let reg = HandleRegistry::new(0);
        let h = register_null(&reg);
        assert_eq!(h & HANDLE_MASK, 1);
    }

    #[test]
    fn pinned_index_wins_over_the_counter() {
        let reg = HandleRegistry::new(0);
        reg.pin_index(0x42);
        assert_eq!(register_null(&reg) & HANDLE_MASK, 0x42);
        // Pin consumed: the counter resumes.
        assert_eq!(register_null(&reg) & HANDLE_MASK, 1);
    }

    #[test]
    fn retire_releases_index_and_names() {
        let reg = HandleRegistry::new(0);
        let h = register_null(&reg);
        assert!(reg.namehandle(h, "logger"));
        assert_eq!(reg.findname("logger"), Some(h));
        assert!(reg.retire(h).is_some());
        assert_eq!(reg.findname("logger"), None);
        assert!(reg.grab(h).is_none());
    }

    #[test]
    fn names_bind_once() {
        let reg = HandleRegistry::new(0);
        let a = register_null(&reg);
        let b = register_null(&reg);
        assert!(reg.namehandle(a, "logger"));
        assert!(!reg.namehandle(b, "logger"));
        assert_eq!(reg.findname("logger"), Some(a));
    }
}
