// SPDX-License-Identifier: CEPL-1.0
//! Block sub-allocator on top of [`memory::allocate`].
//!
//! Buffers and images draw from separate pools so linear and optimal resources never share a
//! block. Each pool carves 64 MiB blocks into aligned sub-ranges and keeps the gaps in a sorted,
//! coalesced free list. Requests that want a dedicated allocation, or that are at least one block
//! in size, get memory of their own.
use ash::vk;
use tracing::{debug, info};

use crate::device::GpuDevice;
use crate::driver::{BufferBind, DedicatedTarget, DeviceApi, ImageBind, ResourceRequirements};
use crate::error::DeviceError;
use crate::memory::{self, align_up, MemoryRange, MemoryUsage};

pub const DEFAULT_BLOCK_SIZE: vk::DeviceSize = 64 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
  Buffer,
  Image,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
  offset: vk::DeviceSize,
  size: vk::DeviceSize,
}

#[derive(Debug)]
struct Block {
  memory: vk::DeviceMemory,
  type_index: u32,
  kind: ResourceKind,
  size: vk::DeviceSize,
  /// Sorted by offset, never two adjacent ranges.
  free: Vec<FreeRange>,
}

impl Block {
  fn is_empty(&self) -> bool {
    matches!(self.free.as_slice(), [r] if r.offset == 0 && r.size == self.size)
  }

  /// First fit. The alignment padding in front of the range stays free.
  fn carve(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<vk::DeviceSize> {
    let (i, start) = self.free.iter().enumerate().find_map(|(i, r)| {
      let start = align_up(r.offset, alignment);
      (start + size <= r.offset + r.size).then_some((i, start))
    })?;
    let r = self.free[i];
    let before = FreeRange { offset: r.offset, size: start - r.offset };
    let after = FreeRange { offset: start + size, size: r.offset + r.size - start - size };
    let pieces: Vec<_> = [before, after].into_iter().filter(|p| p.size > 0).collect();
    self.free.splice(i..=i, pieces);
    Some(start)
  }

  fn release(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) {
    let i = self.free.partition_point(|r| r.offset < offset);
    self.free.insert(i, FreeRange { offset, size });
    if i + 1 < self.free.len() && self.free[i].offset + self.free[i].size == self.free[i + 1].offset {
      self.free[i].size += self.free[i + 1].size;
      self.free.remove(i + 1);
    }
    if i > 0 && self.free[i - 1].offset + self.free[i - 1].size == self.free[i].offset {
      self.free[i - 1].size += self.free[i].size;
      self.free.remove(i);
    }
  }
}

/// Hands out [`MemoryRange`]s for buffers and images. Must be destroyed before its device.
#[derive(Debug)]
pub struct DeviceAllocator {
  block_size: vk::DeviceSize,
  blocks: Vec<Block>,
  /// Dedicated and oversized allocations, freed as a whole.
  standalone: Vec<vk::DeviceMemory>,
}

impl Default for DeviceAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl DeviceAllocator {
  pub fn new() -> Self {
    Self::with_block_size(DEFAULT_BLOCK_SIZE)
  }

  pub fn with_block_size(block_size: vk::DeviceSize) -> Self {
    Self { block_size, blocks: Vec::new(), standalone: Vec::new() }
  }

  pub fn block_size(&self) -> vk::DeviceSize {
    self.block_size
  }

  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }

  pub fn standalone_count(&self) -> usize {
    self.standalone.len()
  }

  pub fn alloc_image_memory<D: DeviceApi>(
    &mut self,
    device: &GpuDevice<D>,
    image: vk::Image,
    usage: MemoryUsage,
  ) -> Result<MemoryRange, DeviceError> {
    let reqs = device.raw().image_memory_requirements(image, device.memory_caps().dedicated_allocation);
    self.alloc(device, reqs, usage, ResourceKind::Image, DedicatedTarget::Image(image))
  }

  pub fn alloc_buffer_memory<D: DeviceApi>(
    &mut self,
    device: &GpuDevice<D>,
    buffer: vk::Buffer,
    usage: MemoryUsage,
  ) -> Result<MemoryRange, DeviceError> {
    let reqs = device.raw().buffer_memory_requirements(buffer, device.memory_caps().dedicated_allocation);
    self.alloc(device, reqs, usage, ResourceKind::Buffer, DedicatedTarget::Buffer(buffer))
  }

  fn alloc<D: DeviceApi>(
    &mut self,
    device: &GpuDevice<D>,
    reqs: ResourceRequirements,
    usage: MemoryUsage,
    kind: ResourceKind,
    target: DedicatedTarget,
  ) -> Result<MemoryRange, DeviceError> {
    match self.alloc_with(device, reqs, usage.property_flags(), kind, target) {
      Err(DeviceError::NoMemoryType { .. }) if usage == MemoryUsage::GpuCpuVisible => {
        debug!("no device local host visible memory, falling back to host memory");
        self.alloc_with(device, reqs, MemoryUsage::CpuGpuVisible.property_flags(), kind, target)
      }
      other => other,
    }
  }

  fn alloc_with<D: DeviceApi>(
    &mut self,
    device: &GpuDevice<D>,
    reqs: ResourceRequirements,
    required: vk::MemoryPropertyFlags,
    kind: ResourceKind,
    target: DedicatedTarget,
  ) -> Result<MemoryRange, DeviceError> {
    let r = reqs.requirements;
    let props = device.memory_properties();

    if reqs.wants_dedicated() || r.size >= self.block_size {
      let dedicated = reqs.wants_dedicated().then_some(target);
      let (memory, _) = memory::allocate(device.raw(), props, r.size, r.memory_type_bits, required, dedicated)?;
      self.standalone.push(memory);
      return Ok(MemoryRange { memory, offset: 0, size: r.size });
    }

    let fits = |b: &Block| {
      b.kind == kind
        && r.memory_type_bits & (1u32 << b.type_index) != 0
        && props.memory_types[b.type_index as usize].property_flags.contains(required)
    };
    for block in self.blocks.iter_mut() {
      if !fits(block) {
        continue;
      }
      if let Some(offset) = block.carve(r.size, r.alignment) {
        return Ok(MemoryRange { memory: block.memory, offset, size: r.size });
      }
    }

    let (memory, type_index) = memory::allocate(device.raw(), props, self.block_size, r.memory_type_bits, required, None)?;
    info!("vk: new {:?} block of {} bytes in memory type {}", kind, self.block_size, type_index);
    let mut block = Block {
      memory,
      type_index,
      kind,
      size: self.block_size,
      free: vec![FreeRange { offset: 0, size: self.block_size }],
    };
    let offset = block.carve(r.size, r.alignment).unwrap_or_default();
    self.blocks.push(block);
    Ok(MemoryRange { memory, offset, size: r.size })
  }

  /// Returns the range to its block. Memory this allocator does not know is freed outright.
  pub fn free<D: DeviceApi>(&mut self, device: &GpuDevice<D>, range: &MemoryRange) {
    if range.memory == vk::DeviceMemory::null() {
      return;
    }
    if let Some(block) = self.blocks.iter_mut().find(|b| b.memory == range.memory) {
      block.release(range.offset, range.size);
      return;
    }
    self.standalone.retain(|&m| m != range.memory);
    device.free(range);
  }

  /// Frees every block with nothing left in it. Returns how many went.
  pub fn trim<D: DeviceApi>(&mut self, device: &GpuDevice<D>) -> usize {
    let before = self.blocks.len();
    self.blocks.retain(|b| {
      if b.is_empty() {
        device.raw().free_memory(b.memory);
        false
      } else {
        true
      }
    });
    let freed = before - self.blocks.len();
    if freed > 0 {
      debug!("vk: trimmed {} empty blocks", freed);
    }
    freed
  }

  pub fn bind_image_memories<D: DeviceApi>(
    &self,
    device: &GpuDevice<D>,
    images: &[vk::Image],
    ranges: &[MemoryRange],
  ) -> Result<(), DeviceError> {
    let binds: Vec<_> = images
      .iter()
      .zip(ranges)
      .map(|(&image, r)| ImageBind { image, memory: r.memory, offset: r.offset })
      .collect();
    device.bind_images(&binds)
  }

  pub fn bind_buffer_memories<D: DeviceApi>(
    &self,
    device: &GpuDevice<D>,
    buffers: &[vk::Buffer],
    ranges: &[MemoryRange],
  ) -> Result<(), DeviceError> {
    let binds: Vec<_> = buffers
      .iter()
      .zip(ranges)
      .map(|(&buffer, r)| BufferBind { buffer, memory: r.memory, offset: r.offset })
      .collect();
    device.bind_buffers(&binds)
  }

  /// Frees every block and standalone allocation, in use or not.
  pub fn destroy<D: DeviceApi>(self, device: &GpuDevice<D>) {
    for block in &self.blocks {
      device.raw().free_memory(block.memory);
    }
    for &memory in &self.standalone {
      device.raw().free_memory(memory);
    }
  }
}
