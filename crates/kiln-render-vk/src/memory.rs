// SPDX-License-Identifier: CEPL-1.0
use std::ffi::CStr;

use ash::khr::{bind_memory2, dedicated_allocation, get_memory_requirements2};
use ash::vk;
use tracing::{debug, warn};

use crate::driver::{DedicatedTarget, DeviceApi};
use crate::error::DeviceError;

/// A view into a device memory block. The block belongs to whoever allocated it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRange {
  pub memory: vk::DeviceMemory,
  pub offset: vk::DeviceSize,
  pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
  /// Device local, not host visible.
  Gpu,
  GpuCpuVisible,
  CpuGpuVisible,
  GpuLazy,
}

impl MemoryUsage {
  pub fn property_flags(self) -> vk::MemoryPropertyFlags {
    use vk::MemoryPropertyFlags as F;
    match self {
      MemoryUsage::Gpu => F::DEVICE_LOCAL,
      MemoryUsage::GpuCpuVisible => F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT,
      MemoryUsage::CpuGpuVisible => F::HOST_VISIBLE | F::HOST_COHERENT,
      MemoryUsage::GpuLazy => F::DEVICE_LOCAL | F::LAZILY_ALLOCATED,
    }
  }
}

/// What the allocator may rely on for this device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryCaps {
  pub dedicated_allocation: bool,
  pub bind_memory2: bool,
}

impl MemoryCaps {
  pub fn detect(api_version: u32, enabled: &[&CStr]) -> Self {
    let core_1_1 = api_version >= vk::API_VERSION_1_1;
    let has = |name: &CStr| enabled.iter().any(|e| *e == name);
    Self {
      dedicated_allocation: core_1_1 || (has(get_memory_requirements2::NAME) && has(dedicated_allocation::NAME)),
      bind_memory2: core_1_1 || has(bind_memory2::NAME),
    }
  }
}

/// First memory type at or after `start` that is allowed by `type_bits` and has every `required` flag.
pub fn find_memory_type(
  props: &vk::PhysicalDeviceMemoryProperties,
  start: u32,
  type_bits: u32,
  required: vk::MemoryPropertyFlags,
) -> Option<u32> {
  let count = props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
  (start..count).find(|&i| {
    type_bits & (1u32 << i) != 0 && props.memory_types[i as usize].property_flags.contains(required)
  })
}

/// Allocates `size` bytes, walking forward through compatible memory types when one reports
/// `ERROR_OUT_OF_DEVICE_MEMORY`. Returns the block and the memory type it landed in.
pub fn allocate<D: DeviceApi>(
  device: &D,
  props: &vk::PhysicalDeviceMemoryProperties,
  size: vk::DeviceSize,
  type_bits: u32,
  required: vk::MemoryPropertyFlags,
  dedicated: Option<DedicatedTarget>,
) -> Result<(vk::DeviceMemory, u32), DeviceError> {
  let mut next = find_memory_type(props, 0, type_bits, required)
    .ok_or(DeviceError::NoMemoryType { type_bits, properties: required })?;

  loop {
    match device.allocate_memory(size, next, dedicated) {
      Ok(memory) => {
        debug!("allocated {} bytes from memory type {}", size, next);
        return Ok((memory, next));
      }
      Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {
        warn!("memory type {} is full ({} bytes requested), trying the next one", next, size);
        next = match find_memory_type(props, next + 1, type_bits, required) {
          Some(i) => i,
          None => return Err(DeviceError::OutOfDeviceMemory),
        };
      }
      Err(result) => return Err(DeviceError::Vk { op: "vkAllocateMemory", result }),
    }
  }
}

pub fn align_up(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
  if alignment <= 1 {
    size
  } else {
    size.div_ceil(alignment) * alignment
  }
}

/// `count` equally sized resources packed back to back in one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedLayout {
  pub stride: vk::DeviceSize,
  pub count: u32,
}

impl SharedLayout {
  pub fn new(size: vk::DeviceSize, alignment: vk::DeviceSize, count: u32) -> Self {
    Self { stride: align_up(size, alignment), count }
  }

  pub fn total_size(&self) -> vk::DeviceSize {
    self.stride * self.count as vk::DeviceSize
  }

  pub fn offset(&self, index: u32) -> vk::DeviceSize {
    self.stride * index as vk::DeviceSize
  }
}
