//! Descriptor heaps and slot allocation.
//!
//! A [`DescriptorHeap`] is a fixed-capacity table of descriptors. Slots are
//! handed out by a [`DescriptorAllocator`], a free-list with an occupancy
//! bitset, so both allocation and release are O(1) even for the
//! million-entry shader resource heap.
//!
//! Slots are owned by [`DescriptorHandle`]s. A handle is not `Clone` and
//! returns its slot to the heap when dropped, so an index is never owned by
//! two live views. The heap itself never references views; it only tracks
//! which indices are occupied.

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::backend::DescriptorHeapInfo;
use crate::error::{RhiError, RhiResult};

/// The four descriptor tables a device owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Shader-visible combined constant/shader-read/unordered-access table.
    ShaderResource,
    /// Shader-visible sampler table.
    Sampler,
    /// CPU-only render target table.
    RenderTarget,
    /// CPU-only depth target table.
    DepthTarget,
}

impl DescriptorHeapKind {
    /// All heap kinds, in the order a device creates them.
    pub const ALL: [DescriptorHeapKind; 4] = [
        DescriptorHeapKind::ShaderResource,
        DescriptorHeapKind::Sampler,
        DescriptorHeapKind::RenderTarget,
        DescriptorHeapKind::DepthTarget,
    ];

    /// Returns true if shaders can index this heap directly.
    pub fn is_shader_visible(self) -> bool {
        matches!(
            self,
            DescriptorHeapKind::ShaderResource | DescriptorHeapKind::Sampler
        )
    }

    /// Returns a human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            DescriptorHeapKind::ShaderResource => "shader resource heap",
            DescriptorHeapKind::Sampler => "sampler heap",
            DescriptorHeapKind::RenderTarget => "render target heap",
            DescriptorHeapKind::DepthTarget => "depth target heap",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Fixed-capacity slot allocator.
///
/// Indices come from a LIFO free list first, then from a high-water mark
/// that only moves forward. The occupancy bitset catches double frees.
#[derive(Debug)]
pub struct DescriptorAllocator {
    name: &'static str,
    capacity: u32,
    next_unused: u32,
    free: Vec<u32>,
    occupied: Vec<u64>,
    allocated: u32,
}

impl DescriptorAllocator {
    /// Creates an allocator for `capacity` slots.
    pub fn new(name: &'static str, capacity: u32) -> Self {
        Self {
            name,
            capacity,
            next_unused: 0,
            free: Vec::new(),
            occupied: vec![0; (capacity as usize).div_ceil(64)],
            allocated: 0,
        }
    }

    /// Takes a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ResourceExhausted`] when every slot is in use.
    pub fn allocate(&mut self) -> RhiResult<u32> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.next_unused < self.capacity => {
                let index = self.next_unused;
                self.next_unused += 1;
                index
            }
            None => {
                return Err(RhiError::ResourceExhausted {
                    heap: self.name,
                    capacity: self.capacity,
                });
            }
        };

        debug_assert!(!self.is_allocated(index));
        self.set_occupied(index, true);
        self.allocated += 1;
        Ok(index)
    }

    /// Returns a slot to the free list.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] if `index` is out of range or
    /// not currently allocated. The allocator is left unchanged.
    pub fn free(&mut self, index: u32) -> RhiResult<()> {
        if index >= self.capacity {
            return Err(RhiError::contract(format!(
                "freeing index {} outside {} (capacity {})",
                index, self.name, self.capacity
            )));
        }
        if !self.is_allocated(index) {
            return Err(RhiError::contract(format!(
                "double free of index {} in {}",
                index, self.name
            )));
        }

        self.set_occupied(index, false);
        self.free.push(index);
        self.allocated -= 1;
        Ok(())
    }

    /// Returns true if `index` is owned by a live handle.
    pub fn is_allocated(&self, index: u32) -> bool {
        if index >= self.capacity {
            return false;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        self.occupied[word] & (1 << bit) != 0
    }

    /// Number of slots currently owned.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Total number of slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots that can still be allocated.
    pub fn available(&self) -> u32 {
        self.capacity - self.allocated
    }

    fn set_occupied(&mut self, index: u32, occupied: bool) {
        let (word, bit) = (index as usize / 64, index % 64);
        if occupied {
            self.occupied[word] |= 1 << bit;
        } else {
            self.occupied[word] &= !(1 << bit);
        }
    }
}

/// A descriptor table of one [`DescriptorHeapKind`].
pub struct DescriptorHeap {
    kind: DescriptorHeapKind,
    info: DescriptorHeapInfo,
    allocator: Mutex<DescriptorAllocator>,
}

impl DescriptorHeap {
    /// Wraps backend heap storage described by `info`.
    pub fn new(kind: DescriptorHeapKind, info: DescriptorHeapInfo) -> Arc<Self> {
        debug!(
            "Created {} with {} descriptors{}",
            kind.name(),
            info.capacity,
            if kind.is_shader_visible() {
                " (shader visible)"
            } else {
                ""
            }
        );

        Arc::new(Self {
            kind,
            info,
            allocator: Mutex::new(DescriptorAllocator::new(kind.name(), info.capacity)),
        })
    }

    /// Allocates one descriptor slot.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ResourceExhausted`] if the heap is full.
    pub fn allocate(self: &Arc<Self>) -> RhiResult<DescriptorHandle> {
        let index = self.allocator.lock()?.allocate()?;
        let offset = u64::from(index) * self.info.increment;

        Ok(DescriptorHandle {
            heap: Arc::clone(self),
            index,
            cpu: self.info.cpu_base + offset,
            gpu: self.info.gpu_base.map(|base| base + offset),
        })
    }

    /// Returns `handle`'s slot to the heap.
    ///
    /// Equivalent to dropping the handle.
    pub fn free(&self, handle: DescriptorHandle) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&handle.heap)));
        drop(handle);
    }

    /// Returns the heap kind.
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Returns the number of slots in the heap.
    pub fn capacity(&self) -> u32 {
        self.info.capacity
    }

    /// Returns the number of live handles.
    pub fn allocated(&self) -> u32 {
        self.allocator.lock().map(|a| a.allocated()).unwrap_or(0)
    }

    /// Returns true if `index` is owned by a live handle.
    pub fn is_allocated(&self, index: u32) -> bool {
        self.allocator
            .lock()
            .map(|a| a.is_allocated(index))
            .unwrap_or(false)
    }

    fn release(&self, index: u32) {
        match self.allocator.lock() {
            Ok(mut allocator) => {
                if let Err(e) = allocator.free(index) {
                    error!("Failed to release descriptor {}: {}", index, e);
                }
            }
            Err(_) => error!(
                "{} lock poisoned, leaking descriptor {}",
                self.kind.name(),
                index
            ),
        }
    }
}

impl std::fmt::Debug for DescriptorHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorHeap")
            .field("kind", &self.kind)
            .field("capacity", &self.info.capacity)
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// An owned descriptor slot.
///
/// Dropping the handle returns the slot to its heap exactly once.
#[derive(Debug)]
pub struct DescriptorHandle {
    heap: Arc<DescriptorHeap>,
    index: u32,
    cpu: u64,
    gpu: Option<u64>,
}

impl DescriptorHandle {
    /// Index of the slot inside its heap; this is what shaders use for bindless access.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// CPU-side descriptor address.
    #[inline]
    pub fn cpu_address(&self) -> u64 {
        self.cpu
    }

    /// GPU-side descriptor address, present only for shader-visible heaps.
    #[inline]
    pub fn gpu_address(&self) -> Option<u64> {
        self.gpu
    }

    /// Kind of the owning heap.
    #[inline]
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        self.heap.kind
    }
}

impl Drop for DescriptorHandle {
    fn drop(&mut self) {
        self.heap.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn heap(kind: DescriptorHeapKind, capacity: u32) -> Arc<DescriptorHeap> {
        DescriptorHeap::new(
            kind,
            DescriptorHeapInfo {
                capacity,
                cpu_base: 0x1000,
                gpu_base: kind.is_shader_visible().then_some(0x8000),
                increment: 32,
            },
        )
    }

    #[test]
    fn test_allocate_to_capacity() {
        let mut allocator = DescriptorAllocator::new("test heap", 16);
        let indices: HashSet<u32> = (0..16).map(|_| allocator.allocate().unwrap()).collect();

        assert_eq!(indices.len(), 16);
        assert!(indices.iter().all(|i| *i < 16));
        assert!(matches!(
            allocator.allocate(),
            Err(RhiError::ResourceExhausted { capacity: 16, .. })
        ));
        assert_eq!(allocator.available(), 0);
    }

    #[test]
    fn test_free_makes_index_reusable() {
        let mut allocator = DescriptorAllocator::new("test heap", 4);
        for _ in 0..4 {
            allocator.allocate().unwrap();
        }
        allocator.free(2).unwrap();
        assert!(!allocator.is_allocated(2));
        assert_eq!(allocator.allocate().unwrap(), 2);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut allocator = DescriptorAllocator::new("test heap", 4);
        let index = allocator.allocate().unwrap();
        allocator.free(index).unwrap();

        assert!(matches!(
            allocator.free(index),
            Err(RhiError::ContractViolation(_))
        ));
        assert!(allocator.free(99).is_err());
        // The rejected frees must not have pushed duplicates onto the free list.
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bitset_word_boundaries() {
        let mut allocator = DescriptorAllocator::new("test heap", 130);
        for _ in 0..130 {
            allocator.allocate().unwrap();
        }
        for index in [63, 64, 127, 128, 129] {
            assert!(allocator.is_allocated(index));
            allocator.free(index).unwrap();
            assert!(!allocator.is_allocated(index));
        }
        assert_eq!(allocator.allocated(), 125);
    }

    #[test]
    fn test_handle_addresses() {
        let heap = heap(DescriptorHeapKind::ShaderResource, 8);
        let _first = heap.allocate().unwrap();
        let second = heap.allocate().unwrap();

        assert_eq!(second.index(), 1);
        assert_eq!(second.cpu_address(), 0x1000 + 32);
        assert_eq!(second.gpu_address(), Some(0x8000 + 32));
        assert_eq!(second.heap_kind(), DescriptorHeapKind::ShaderResource);
    }

    #[test]
    fn test_cpu_only_heap_has_no_gpu_address() {
        let heap = heap(DescriptorHeapKind::RenderTarget, 2);
        let handle = heap.allocate().unwrap();
        assert!(handle.gpu_address().is_none());
    }

    #[test]
    fn test_handle_drop_releases_slot() {
        let heap = heap(DescriptorHeapKind::DepthTarget, 1);
        let handle = heap.allocate().unwrap();
        assert_eq!(heap.allocated(), 1);
        assert!(heap.allocate().is_err());

        heap.free(handle);
        assert_eq!(heap.allocated(), 0);
        let again = heap.allocate().unwrap();
        assert_eq!(again.index(), 0);
    }

    #[test]
    fn test_large_heap_is_cheap() {
        let mut allocator = DescriptorAllocator::new("shader resource heap", 1_000_000);
        let index = allocator.allocate().unwrap();
        assert_eq!(index, 0);
        assert_eq!(allocator.available(), 999_999);
    }
}
