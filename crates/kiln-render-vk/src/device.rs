// SPDX-License-Identifier: CEPL-1.0
use std::ffi::CStr;

use ash::vk;
use tracing::{error, info};

use crate::driver::{BufferBind, DedicatedTarget, DeviceApi, ImageBind, InstanceApi, QueueRequest};
use crate::error::DeviceError;
use crate::memory::{self, MemoryCaps, MemoryRange, MemoryUsage};
use crate::queue::{self, FamilyInfo, QueueFamilyIndices, QueueRole, Queues};
use crate::select::{self, DeviceRequirements, ScoringPolicy};

/// The selected GPU and the logical device opened on it. Lives for the renderer's lifetime.
pub struct GpuDevice<D: DeviceApi> {
  physical: vk::PhysicalDevice,
  name: String,
  score: u32,
  properties: vk::PhysicalDeviceProperties,
  features: vk::PhysicalDeviceFeatures,
  memory_properties: vk::PhysicalDeviceMemoryProperties,
  families: Vec<FamilyInfo>,
  indices: QueueFamilyIndices,
  queue_plan: Vec<QueueRequest>,
  queues: Queues,
  extensions: Vec<&'static CStr>,
  memory_caps: MemoryCaps,
  raw: D,
}

impl<D: DeviceApi> GpuDevice<D> {
  /// Picks the best GPU for `instance.surface()` and opens it.
  ///
  /// `NoSuitableDevice` is recoverable. A driver refusing to create the device after it passed
  /// selection is reported as `DriverFault`.
  pub fn create<I>(instance: &I, reqs: &DeviceRequirements, policy: &ScoringPolicy) -> Result<Self, DeviceError>
  where
    I: InstanceApi<Device = D>,
  {
    let chosen = select::select_device(instance, reqs, policy)?;
    let pd = chosen.physical;

    let properties = instance.properties(pd);
    let features = instance.features(pd);
    let memory_properties = instance.memory_properties(pd);

    let queue_plan = queue::plan_queue_requests(&chosen.indices, &chosen.families);
    info!(
      "vk: using \"{}\" (score {}), families g={:?} p={:?} t={:?} c={:?}, queue plan {:?}",
      chosen.name,
      chosen.score,
      chosen.indices.graphics,
      chosen.indices.present,
      chosen.indices.transfer,
      chosen.indices.compute,
      queue_plan
    );

    let raw = instance
      .create_device(pd, &queue_plan, &chosen.extensions, &features)
      .map_err(|result| {
        error!("vk: driver refused vkCreateDevice on a validated device: {:?}", result);
        DeviceError::DriverFault { op: "vkCreateDevice", result }
      })?;

    let queues = queue::retrieve_queues(&raw, &chosen.indices, &queue_plan);
    let api_version = instance.api_version().min(properties.api_version);
    let memory_caps = MemoryCaps::detect(api_version, &chosen.extensions);

    info!(
      "vk: device ready, extensions [{}], dedicated_alloc={} bind2={}",
      chosen.extensions.iter().map(|e| e.to_string_lossy()).collect::<Vec<_>>().join(", "),
      memory_caps.dedicated_allocation,
      memory_caps.bind_memory2
    );

    Ok(Self {
      physical: pd,
      name: chosen.name,
      score: chosen.score,
      properties,
      features,
      memory_properties,
      families: chosen.families,
      indices: chosen.indices,
      queue_plan,
      queues,
      extensions: chosen.extensions,
      memory_caps,
      raw,
    })
  }

  /// Every queue must be idle before this is called.
  pub fn destroy(mut self) {
    info!("vk: destroying device \"{}\"", self.name);
    self.raw.destroy();
  }

  pub fn physical(&self) -> vk::PhysicalDevice {
    self.physical
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn score(&self) -> u32 {
    self.score
  }

  pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
    &self.properties
  }

  pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
    &self.features
  }

  pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
    &self.memory_properties
  }

  pub fn queue_family_indices(&self) -> &QueueFamilyIndices {
    &self.indices
  }

  pub fn queue_families(&self) -> &[FamilyInfo] {
    &self.families
  }

  pub fn queue_plan(&self) -> &[QueueRequest] {
    &self.queue_plan
  }

  pub fn extensions(&self) -> &[&'static CStr] {
    &self.extensions
  }

  pub fn memory_caps(&self) -> MemoryCaps {
    self.memory_caps
  }

  pub fn queue(&self, role: QueueRole) -> Option<vk::Queue> {
    self.queues.get(role)
  }

  /// Transfer or compute work falls back to the graphics queue when the role has no family.
  pub fn queue_or_graphics(&self, role: QueueRole) -> Option<vk::Queue> {
    self.queues.get(role).or(self.queues.graphics)
  }

  pub fn raw(&self) -> &D {
    &self.raw
  }

  pub fn find_memory_type(&self, start: u32, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
    memory::find_memory_type(&self.memory_properties, start, type_bits, properties)
  }

  pub fn find_supported_format<I: InstanceApi>(
    &self,
    instance: &I,
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
  ) -> Option<vk::Format> {
    select::find_supported_format(instance, self.physical, candidates, tiling, features)
  }

  /// Allocates a whole block for `usage`; the returned range starts at offset 0.
  pub fn allocate(
    &self,
    requirements: &vk::MemoryRequirements,
    usage: MemoryUsage,
    dedicated: Option<DedicatedTarget>,
  ) -> Result<MemoryRange, DeviceError> {
    let (memory, _) = memory::allocate(
      &self.raw,
      &self.memory_properties,
      requirements.size,
      requirements.memory_type_bits,
      usage.property_flags(),
      dedicated,
    )?;
    Ok(MemoryRange { memory, offset: 0, size: requirements.size })
  }

  pub fn free(&self, range: &MemoryRange) {
    self.raw.free_memory(range.memory);
  }

  /// One batched call when bind2 is available, otherwise one call per image.
  pub fn bind_images(&self, binds: &[ImageBind]) -> Result<(), DeviceError> {
    if self.memory_caps.bind_memory2 {
      return self.raw.bind_image_memories(binds).map_err(DeviceError::vk("vkBindImageMemory2"));
    }
    for &b in binds {
      self.raw.bind_image_memory(b).map_err(DeviceError::vk("vkBindImageMemory"))?;
    }
    Ok(())
  }

  pub fn bind_buffers(&self, binds: &[BufferBind]) -> Result<(), DeviceError> {
    if self.memory_caps.bind_memory2 {
      return self.raw.bind_buffer_memories(binds).map_err(DeviceError::vk("vkBindBufferMemory2"));
    }
    for &b in binds {
      self.raw.bind_buffer_memory(b).map_err(DeviceError::vk("vkBindBufferMemory"))?;
    }
    Ok(())
  }
}
