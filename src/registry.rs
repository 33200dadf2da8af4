//! Handle tables for live sessions
//!
//! Each session kind has its own [`Registry`]. Handles are allocated from a
//! monotonic counter starting at 1 and are never handed out twice by the same
//! registry, so a finalized handle can never alias a newer session.

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU32;

/// Marker for encoder handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {}

/// Marker for muxer handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxerKind {}

/// Opaque identifier for a registered session
pub struct Handle<K> {
    id: NonZeroU32,
    _kind: PhantomData<K>,
}

/// Handle to an encode session
pub type EncoderHandle = Handle<EncoderKind>;

/// Handle to a mux session
pub type MuxerHandle = Handle<MuxerKind>;

impl<K> Handle<K> {
    /// Rebuild a handle from its raw value (zero is never a valid handle)
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(|id| Self {
            id,
            _kind: PhantomData,
        })
    }

    /// Raw integer value, e.g. for passing across FFI
    pub fn raw(self) -> u32 {
        self.id.get()
    }
}

// Manual impls so `K` needs no bounds.
impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K> Eq for Handle<K> {}

impl<K> std::hash::Hash for Handle<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

impl<K> fmt::Display for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Owning map from handles to sessions
pub struct Registry<T, K> {
    name: &'static str,
    entries: HashMap<Handle<K>, T>,
    next: u32,
}

impl<T, K> Registry<T, K> {
    /// Create an empty registry; `name` is used in error messages
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: HashMap::new(),
            next: 1,
        }
    }

    /// Take ownership of `session` and return its new handle
    pub fn register(&mut self, session: T) -> Result<Handle<K>> {
        let handle = Handle::from_raw(self.next).ok_or_else(|| {
            Error::InvalidHandle(format!("{} handle space exhausted", self.name))
        })?;
        // u32::MAX is handed out once, then the counter parks at 0 (never valid).
        self.next = self.next.checked_add(1).unwrap_or(0);
        self.entries.insert(handle, session);
        Ok(handle)
    }

    pub fn get(&self, handle: Handle<K>) -> Result<&T> {
        self.entries
            .get(&handle)
            .ok_or_else(|| self.unknown(handle))
    }

    pub fn get_mut(&mut self, handle: Handle<K>) -> Result<&mut T> {
        let name = self.name;
        self.entries
            .get_mut(&handle)
            .ok_or_else(|| Error::InvalidHandle(format!("unknown {} handle {}", name, handle)))
    }

    /// Remove the session, handing ownership back to the caller
    pub fn release(&mut self, handle: Handle<K>) -> Result<T> {
        self.entries
            .remove(&handle)
            .ok_or_else(|| self.unknown(handle))
    }

    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain every live session, in ascending handle order
    pub fn drain(&mut self) -> Vec<(Handle<K>, T)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by_key(|(handle, _)| handle.raw());
        drained
    }

    fn unknown(&self, handle: Handle<K>) -> Error {
        Error::InvalidHandle(format!("unknown {} handle {}", self.name, handle))
    }
}
