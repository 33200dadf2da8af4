//! Aligned opaque workspaces handed to the compressor

use crate::{Error, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Alignment every workspace is allocated with
pub const WORKSPACE_ALIGN: usize = 64;

/// Workspace sizes requested by a compressor for a given configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceSizes {
    /// Lives for the whole session
    pub persist: usize,
    /// Reused by every encode call
    pub scratch: usize,
}

impl WorkspaceSizes {
    /// Both sizes must be non-zero multiples of two
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [("persist", self.persist), ("scratch", self.scratch)] {
            if size == 0 {
                return Err(Error::InvalidSize(format!("{} workspace size is zero", name)));
            }
            if size % 2 != 0 {
                return Err(Error::InvalidSize(format!(
                    "{} workspace size {} is not a multiple of 2",
                    name, size
                )));
            }
        }
        Ok(())
    }
}

/// Zeroed, 64-byte aligned heap buffer
pub struct Workspace {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned and only reachable through &self/&mut self.
unsafe impl Send for Workspace {}

impl Workspace {
    /// Allocate `len` bytes, rounding the allocation up to the alignment
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidSize("workspace size is zero".to_string()));
        }
        let rounded = len
            .checked_add(WORKSPACE_ALIGN - 1)
            .map(|n| n / WORKSPACE_ALIGN * WORKSPACE_ALIGN)
            .ok_or_else(|| Error::InvalidSize(format!("workspace size {} overflows", len)))?;
        let layout = Layout::from_size_align(rounded, WORKSPACE_ALIGN)
            .map_err(|e| Error::InvalidSize(format!("workspace size {}: {}", len, e)))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::AllocationFailure { size: rounded })?;

        Ok(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `layout.size() >= len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace").field("len", &self.len).finish()
    }
}
