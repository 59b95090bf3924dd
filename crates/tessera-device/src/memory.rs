//! Emulated device memory.
//!
//! Each heap is an arena over `[0, size)` managed with a first-fit free list.
//! An allocation reserves a range of its heap's arena and owns a host byte
//! vector of the same size behind a reader/writer lock. Freeing returns the
//! range immediately, while the bytes live on for as long as any bound
//! resource or in-flight command still holds the allocation.

use crate::config::{HeapConfig, HeapKind};
use crate::context::{Device, ObjectKey, ObjectKind};
use crate::error::{DeviceError, Result};
use crate::resource::{BufferHandle, BufferUsageFlags, ImageHandle};
use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::math::align_up;
use tessera_core::Handle;

pub type MemoryHandle = Handle<DeviceMemory>;

/// Size value meaning "to the end of the allocation or resource".
pub const WHOLE_SIZE: u64 = u64::MAX;

/// Parameters of a memory allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAllocateInfo {
    pub size: u64,
    /// Must be a power of two
    pub alignment: u64,
    pub memory_type_index: u32,
}

/// Size and alignment a resource needs from its memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Usage of one heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapBudget {
    pub size: u64,
    pub used: u64,
}

/// A range of an allocation for flush and invalidate calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedMemoryRange {
    pub memory: MemoryHandle,
    pub offset: u64,
    pub size: u64,
}

/// First-fit allocator over `[0, size)`.
#[derive(Debug)]
struct Arena {
    /// Free ranges as `(offset, len)`, sorted and coalesced
    free: Vec<(u64, u64)>,
    used: u64,
}

impl Arena {
    fn new(size: u64) -> Self {
        Self {
            free: vec![(0, size)],
            used: 0,
        }
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let (index, start) = self.free.iter().enumerate().find_map(|(i, &(offset, len))| {
            let start = align_up(offset, alignment);
            let end = start.checked_add(size)?;
            (end <= offset + len).then_some((i, start))
        })?;

        let (offset, len) = self.free[index];
        let head = (offset, start - offset);
        let tail = (start + size, offset + len - (start + size));
        self.free.splice(
            index..=index,
            [head, tail].into_iter().filter(|&(_, len)| len > 0),
        );
        self.used += size;
        Some(start)
    }

    fn release(&mut self, offset: u64, size: u64) {
        let index = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(index, (offset, size));
        self.used -= size;

        // Merge with the following range, then with the preceding one.
        if index + 1 < self.free.len() && offset + size == self.free[index + 1].0 {
            self.free[index].1 += self.free[index + 1].1;
            self.free.remove(index + 1);
        }
        if index > 0 {
            let (prev_offset, prev_len) = self.free[index - 1];
            if prev_offset + prev_len == offset {
                self.free[index - 1].1 += self.free[index].1;
                self.free.remove(index);
            }
        }
    }
}

/// One emulated heap.
#[derive(Debug)]
pub(crate) struct Heap {
    kind: HeapKind,
    size: u64,
    arena: Mutex<Arena>,
}

impl Heap {
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            kind: config.kind,
            size: config.size,
            arena: Mutex::new(Arena::new(config.size)),
        }
    }

    fn exhausted(&self, size: u64) -> DeviceError {
        let message = format!("{size} bytes requested from a {} byte heap", self.size);
        match self.kind {
            HeapKind::DeviceLocal => DeviceError::OutOfDeviceMemory(message),
            HeapKind::HostVisible => DeviceError::OutOfHostMemory(message),
        }
    }
}

/// A device memory allocation.
#[derive(Debug)]
pub struct DeviceMemory {
    memory_type: u32,
    heap: usize,
    arena_offset: u64,
    size: u64,
    host_visible: bool,
    bytes: RwLock<Vec<u8>>,
    /// Non-zero while mapped; identifies the current mapping
    map_token: AtomicU64,
}

static NEXT_MAP_TOKEN: AtomicU64 = AtomicU64::new(1);

fn range_error(offset: u64, len: u64, size: u64, what: &str) -> DeviceError {
    DeviceError::validation(format!(
        "{what} range {offset}..{} exceeds {size} bytes",
        offset.saturating_add(len)
    ))
}

/// Byte range `[offset, offset + len)` of an object of `size` bytes.
pub(crate) fn checked_range(offset: u64, len: u64, size: u64, what: &str) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset as usize..end as usize),
        _ => Err(range_error(offset, len, size, what)),
    }
}

impl DeviceMemory {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the allocation inside its heap.
    pub fn arena_offset(&self) -> u64 {
        self.arena_offset
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type
    }

    pub fn heap_index(&self) -> usize {
        self.heap
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// Copy out `len` bytes at `offset`.
    pub(crate) fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let range = checked_range(offset, len, self.size, "memory read")?;
        Ok(self.bytes.read()[range].to_vec())
    }

    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let range = checked_range(offset, data.len() as u64, self.size, "memory write")?;
        self.bytes.write()[range].copy_from_slice(data);
        Ok(())
    }

    /// Run `f` over `len` bytes at `offset` with the write lock held.
    pub(crate) fn with_bytes_mut<R>(
        &self,
        offset: u64,
        len: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let range = checked_range(offset, len, self.size, "memory access")?;
        Ok(f(&mut self.bytes.write()[range]))
    }
}

/// Host view of a mapped allocation range.
///
/// Offsets are relative to the start of the mapping. Accesses fail once the
/// memory is unmapped.
#[derive(Debug)]
pub struct MappedMemory {
    memory: Arc<DeviceMemory>,
    token: u64,
    offset: u64,
    size: u64,
}

impl MappedMemory {
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check(&self) -> Result<()> {
        if self.memory.map_token.load(Ordering::Acquire) == self.token {
            Ok(())
        } else {
            Err(DeviceError::MemoryMapFailed("mapping is no longer valid".into()))
        }
    }

    fn absolute(&self, offset: u64, len: u64) -> Result<u64> {
        self.check()?;
        checked_range(offset, len, self.size, "mapped")?;
        Ok(self.offset + offset)
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let at = self.absolute(offset, data.len() as u64)?;
        self.memory.write(at, data)
    }

    pub fn write_range<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let at = self.absolute(offset, len)?;
        self.memory.read(at, len)
    }

    /// Read `count` values of `T` starting at `offset`.
    pub fn read_range<T: Pod>(&self, offset: u64, count: usize) -> Result<Vec<T>> {
        let len = (count * std::mem::size_of::<T>()) as u64;
        let bytes = self.read_bytes(offset, len)?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>().max(1))
            .take(count)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}

/// Alignment of a buffer with the given usage.
pub(crate) fn buffer_alignment(usage: BufferUsageFlags) -> u64 {
    if usage.contains(BufferUsageFlags::UNIFORM_BUFFER) {
        256
    } else if usage.contains(BufferUsageFlags::STORAGE_BUFFER) {
        64
    } else {
        16
    }
}

impl Device {
    /// Allocate device memory.
    pub fn allocate_memory(&self, info: &MemoryAllocateInfo) -> Result<MemoryHandle> {
        self.ctx.check_lost()?;
        if info.size == 0 {
            return Err(DeviceError::validation("allocation size must be non-zero"));
        }
        if !info.alignment.is_power_of_two() {
            return Err(DeviceError::validation(format!(
                "alignment {} is not a power of two",
                info.alignment
            )));
        }
        let memory_type = self
            .ctx
            .capabilities
            .memory_types
            .get(info.memory_type_index as usize)
            .ok_or_else(|| {
                DeviceError::validation(format!(
                    "memory type {} does not exist",
                    info.memory_type_index
                ))
            })?;
        let heap_index = memory_type.heap_index as usize;
        let heap = &self.ctx.heaps[heap_index];
        let alignment = info
            .alignment
            .max(self.ctx.capabilities.limits.min_memory_map_alignment);

        let arena_offset = heap
            .arena
            .lock()
            .allocate(info.size, alignment)
            .ok_or_else(|| heap.exhausted(info.size))?;

        let mut bytes = Vec::new();
        let reserved = usize::try_from(info.size)
            .ok()
            .filter(|&len| bytes.try_reserve_exact(len).is_ok());
        let Some(len) = reserved else {
            heap.arena.lock().release(arena_offset, info.size);
            return Err(DeviceError::OutOfHostMemory(format!(
                "cannot reserve {} bytes of backing storage",
                info.size
            )));
        };
        bytes.resize(len, 0);

        let handle = self.ctx.memory.insert(DeviceMemory {
            memory_type: info.memory_type_index,
            heap: heap_index,
            arena_offset,
            size: info.size,
            host_visible: heap.kind == HeapKind::HostVisible,
            bytes: RwLock::new(bytes),
            map_token: AtomicU64::new(0),
        });
        tracing::debug!(
            ?handle,
            size = info.size,
            heap = heap_index,
            offset = arena_offset,
            "Allocated memory"
        );
        Ok(handle)
    }

    /// Free memory. The arena range is reusable immediately.
    pub fn free_memory(&self, memory: MemoryHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let allocation = self.ctx.memory.remove(memory)?;
        allocation.map_token.store(0, Ordering::Release);
        self.ctx.heaps[allocation.heap]
            .arena
            .lock()
            .release(allocation.arena_offset, allocation.size);
        self.ctx
            .invalidate_references(ObjectKey::of(ObjectKind::Memory, memory));
        tracing::debug!(?memory, "Freed memory");
        Ok(())
    }

    /// Map a range of host-visible memory.
    pub fn map_memory(&self, memory: MemoryHandle, offset: u64, size: u64) -> Result<MappedMemory> {
        self.ctx.check_lost()?;
        let allocation = self.ctx.memory.get(memory)?;
        if !allocation.host_visible {
            return Err(DeviceError::MemoryMapFailed(
                "memory is not host-visible".into(),
            ));
        }
        let size = if size == WHOLE_SIZE {
            allocation.size.saturating_sub(offset)
        } else {
            size
        };
        checked_range(offset, size, allocation.size, "map")?;

        let token = NEXT_MAP_TOKEN.fetch_add(1, Ordering::Relaxed);
        if allocation
            .map_token
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::MemoryMapFailed("memory is already mapped".into()));
        }
        Ok(MappedMemory {
            memory: allocation,
            token,
            offset,
            size,
        })
    }

    pub fn unmap_memory(&self, memory: MemoryHandle) -> Result<()> {
        self.ctx.check_lost()?;
        let allocation = self.ctx.memory.get(memory)?;
        if allocation.map_token.swap(0, Ordering::AcqRel) == 0 {
            return Err(DeviceError::validation("memory is not mapped"));
        }
        Ok(())
    }

    /// Memory is coherent; ranges are only checked.
    pub fn flush_mapped_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()> {
        self.check_mapped_ranges(ranges)
    }

    /// Memory is coherent; ranges are only checked.
    pub fn invalidate_mapped_memory_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()> {
        self.check_mapped_ranges(ranges)
    }

    fn check_mapped_ranges(&self, ranges: &[MappedMemoryRange]) -> Result<()> {
        self.ctx.check_lost()?;
        for range in ranges {
            let allocation = self.ctx.memory.get(range.memory)?;
            if allocation.map_token.load(Ordering::Acquire) == 0 {
                return Err(DeviceError::validation("range of unmapped memory"));
            }
            let size = if range.size == WHOLE_SIZE {
                allocation.size.saturating_sub(range.offset)
            } else {
                range.size
            };
            checked_range(range.offset, size, allocation.size, "flush")?;
        }
        Ok(())
    }

    /// Per-heap size and usage.
    pub fn memory_budget(&self) -> Vec<HeapBudget> {
        self.ctx
            .heaps
            .iter()
            .map(|heap| HeapBudget {
                size: heap.size,
                used: heap.arena.lock().used,
            })
            .collect()
    }

    pub fn get_buffer_memory_requirements(&self, buffer: BufferHandle) -> Result<MemoryRequirements> {
        self.ctx.check_lost()?;
        Ok(self.ctx.buffers.get(buffer)?.requirements())
    }

    pub fn get_image_memory_requirements(&self, image: ImageHandle) -> Result<MemoryRequirements> {
        self.ctx.check_lost()?;
        Ok(self.ctx.images.get(image)?.requirements())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceBuilder;

    const KIB: u64 = 1024;

    fn small_device() -> Device {
        DeviceBuilder::new()
            .heaps(vec![
                HeapConfig {
                    size: 64 * KIB,
                    kind: HeapKind::DeviceLocal,
                },
                HeapConfig {
                    size: 64 * KIB,
                    kind: HeapKind::HostVisible,
                },
            ])
            .build()
            .unwrap()
    }

    fn info(size: u64, alignment: u64, memory_type_index: u32) -> MemoryAllocateInfo {
        MemoryAllocateInfo {
            size,
            alignment,
            memory_type_index,
        }
    }

    #[test]
    fn arena_first_fit_and_coalesce() {
        let mut arena = Arena::new(1024);
        let a = arena.allocate(100, 64).unwrap();
        let b = arena.allocate(100, 64).unwrap();
        let c = arena.allocate(100, 64).unwrap();
        assert_eq!((a, b, c), (0, 128, 256));

        arena.release(b, 100);
        assert_eq!(arena.allocate(64, 64), Some(128));
        arena.release(128, 64);
        arena.release(a, 100);
        arena.release(c, 100);
        assert_eq!(arena.free, vec![(0, 1024)]);
        assert_eq!(arena.used, 0);
    }

    #[test]
    fn allocations_honor_alignment() {
        let device = small_device();
        let caps = device.capabilities().clone();
        for (size, alignment) in [(1, 1), (3, 2), (100, 128), (17, 256), (4000, 4096), (5, 64)] {
            let handle = device.allocate_memory(&info(size, alignment, 0)).unwrap();
            let memory = device.ctx.memory.get(handle).unwrap();
            let required = alignment.max(caps.limits.min_memory_map_alignment);
            assert_eq!(memory.arena_offset() % required, 0, "size {size} align {alignment}");
        }
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let device = small_device();
        assert!(matches!(
            device.allocate_memory(&info(0, 16, 0)),
            Err(DeviceError::ValidationFailed(_))
        ));
        assert!(matches!(
            device.allocate_memory(&info(16, 24, 0)),
            Err(DeviceError::ValidationFailed(_))
        ));
        assert!(matches!(
            device.allocate_memory(&info(16, 16, 9)),
            Err(DeviceError::ValidationFailed(_))
        ));
    }

    #[test]
    fn exhaustion_error_follows_heap_kind() {
        let device = small_device();
        assert!(matches!(
            device.allocate_memory(&info(65 * KIB, 64, 0)),
            Err(DeviceError::OutOfDeviceMemory(_))
        ));
        assert!(matches!(
            device.allocate_memory(&info(65 * KIB, 64, 1)),
            Err(DeviceError::OutOfHostMemory(_))
        ));
    }

    #[test]
    fn freed_ranges_are_reused() {
        let device = small_device();
        let a = device.allocate_memory(&info(32 * KIB, 64, 0)).unwrap();
        let b = device.allocate_memory(&info(32 * KIB, 64, 0)).unwrap();
        assert!(device.allocate_memory(&info(KIB, 64, 0)).is_err());
        assert_eq!(device.memory_budget()[0].used, 64 * KIB);

        device.free_memory(a).unwrap();
        device.free_memory(b).unwrap();
        assert_eq!(device.memory_budget()[0].used, 0);
        assert!(device.allocate_memory(&info(64 * KIB, 64, 0)).is_ok());
        assert!(device.free_memory(a).is_err());
    }

    #[test]
    fn map_write_read_round_trip() {
        let device = small_device();
        let handle = device.allocate_memory(&info(256, 64, 1)).unwrap();
        let mapped = device.map_memory(handle, 64, WHOLE_SIZE).unwrap();
        assert_eq!(mapped.size(), 192);

        mapped.write_range(8, &[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(mapped.read_range::<f32>(8, 3).unwrap(), vec![1.0, 2.0, 3.0]);
        assert!(mapped.write_bytes(190, &[0; 4]).is_err());

        let memory = device.ctx.memory.get(handle).unwrap();
        assert_eq!(memory.read(72, 4).unwrap(), 1.0f32.to_le_bytes());
    }

    #[test]
    fn mapping_rules() {
        let device = small_device();
        let local = device.allocate_memory(&info(256, 64, 0)).unwrap();
        let host = device.allocate_memory(&info(256, 64, 1)).unwrap();

        assert!(matches!(
            device.map_memory(local, 0, WHOLE_SIZE),
            Err(DeviceError::MemoryMapFailed(_))
        ));
        let mapped = device.map_memory(host, 0, WHOLE_SIZE).unwrap();
        assert!(matches!(
            device.map_memory(host, 0, 16),
            Err(DeviceError::MemoryMapFailed(_))
        ));
        device
            .flush_mapped_memory_ranges(&[MappedMemoryRange {
                memory: host,
                offset: 0,
                size: WHOLE_SIZE,
            }])
            .unwrap();

        device.unmap_memory(host).unwrap();
        assert!(matches!(
            mapped.write_bytes(0, &[1]),
            Err(DeviceError::MemoryMapFailed(_))
        ));
        assert!(device.map_memory(host, 0, 16).is_ok());
    }
}
