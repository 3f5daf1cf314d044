//! Bookkeeping for links created by this client.
//!
//! A link lives as long as its proxy: the links are created without
//! `object.linger`, so dropping the stored proxy destroys the link on the
//! server and a crashed client leaves nothing behind.

use std::collections::BTreeMap;

use screenmic_core::{LinkHandle, PlannedLink};

/// A created link and the proxy payload that keeps it alive.
#[derive(Debug)]
pub struct LinkEntry<P> {
    /// What the link connects
    pub link: PlannedLink,
    /// Registry ID of the link object
    pub global_id: u32,
    /// Proxy state owned by the entry
    pub payload: P,
}

/// Links created by this client, keyed by handle.
#[derive(Debug)]
pub struct LinkRegistry<P> {
    next: u64,
    entries: BTreeMap<u64, LinkEntry<P>>,
}

impl<P> LinkRegistry<P> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1, entries: BTreeMap::new() }
    }

    /// Store a link and return its handle. Handles are never reused.
    pub fn insert(&mut self, entry: LinkEntry<P>) -> LinkHandle {
        let handle = self.next;
        self.next += 1;
        self.entries.insert(handle, entry);
        LinkHandle(handle)
    }

    /// Remove a link; dropping the returned entry destroys it.
    pub fn remove(&mut self, handle: LinkHandle) -> Option<LinkEntry<P>> {
        self.entries.remove(&handle.0)
    }

    /// Look up a link.
    #[must_use]
    pub fn get(&self, handle: LinkHandle) -> Option<&LinkEntry<P>> {
        self.entries.get(&handle.0)
    }

    /// Handle of the link with this registry ID.
    #[must_use]
    pub fn find_global(&self, global_id: u32) -> Option<LinkHandle> {
        self.entries.iter().find(|(_, e)| e.global_id == global_id).map(|(h, _)| LinkHandle(*h))
    }

    /// Remove every link.
    pub fn clear(&mut self) -> Vec<LinkEntry<P>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Number of live links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no links are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<P> Default for LinkRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
