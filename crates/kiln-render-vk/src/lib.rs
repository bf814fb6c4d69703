// SPDX-License-Identifier: CEPL-1.0
//! Vulkan device and presentation layer: picks a GPU, opens it with the right queues, and keeps a
//! swapchain with depth buffers alive across window resizes.
use std::rc::Rc;

use ash::vk;
use kiln_render::{RenderSize, WindowSource};
use tracing::{info, warn};

mod ash_driver;
pub mod device;
pub mod driver;
pub mod error;
pub mod host_alloc;
pub mod memory;
pub mod queue;
pub mod select;
pub mod suballoc;
pub mod swapchain;

#[cfg(test)]
mod testing;

pub use ash;
pub use ash_driver::{AshDevice, AshInstance};
pub use device::GpuDevice;
pub use driver::{DeviceApi, InstanceApi};
pub use error::DeviceError;
pub use memory::{MemoryCaps, MemoryRange, MemoryUsage};
pub use queue::{QueueFamilyIndices, QueueRole};
pub use select::{DeviceRequirements, ScoringPolicy};
pub use suballoc::DeviceAllocator;
pub use swapchain::{SwapchainImage, SwapchainManager, SwapchainSettings};

/// Owns the instance, the logical device, its memory pools and the swapchain, and tears them down in
/// reverse order.
///
/// Everything here is single-threaded. Destructive calls (`destroy_*`, `recreate_swapchain`,
/// `process_resize`, `set_swapchain_settings`) assume the caller has already waited for the GPU to
/// go idle.
pub struct RendererContext<I: InstanceApi> {
  instance: I,
  window: Rc<dyn WindowSource>,
  policy: ScoringPolicy,
  requirements: DeviceRequirements,
  device: Option<GpuDevice<I::Device>>,
  allocator: DeviceAllocator,
  swapchain: Option<SwapchainManager>,
}

impl<I: InstanceApi> RendererContext<I> {
  pub fn new(instance: I, window: Rc<dyn WindowSource>, policy: ScoringPolicy) -> Self {
    Self {
      instance,
      window,
      policy,
      requirements: DeviceRequirements::default(),
      device: None,
      allocator: DeviceAllocator::new(),
      swapchain: None,
    }
  }

  pub fn with_requirements(mut self, requirements: DeviceRequirements) -> Self {
    self.requirements = requirements;
    self
  }

  pub fn instance(&self) -> &I {
    &self.instance
  }

  pub fn create_device(&mut self) -> Result<(), DeviceError> {
    if self.device.is_some() {
      warn!("vk: create_device called twice, keeping the existing device");
      return Ok(());
    }
    self.device = Some(GpuDevice::create(&self.instance, &self.requirements, &self.policy)?);
    Ok(())
  }

  /// Also drops the swapchain and every pooled block, which cannot outlive their device.
  pub fn destroy_device(&mut self) {
    self.destroy_swapchain();
    if let Some(device) = self.device.take() {
      std::mem::take(&mut self.allocator).destroy(&device);
      device.destroy();
      info!("vk: device destroyed");
    }
  }

  pub fn device(&self) -> Option<&GpuDevice<I::Device>> {
    self.device.as_ref()
  }

  pub fn wait_idle(&self) -> Result<(), DeviceError> {
    match &self.device {
      Some(d) => d.raw().wait_idle().map_err(DeviceError::vk("vkDeviceWaitIdle")),
      None => Ok(()),
    }
  }

  pub fn find_memory_type(&self, start: u32, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
    self.device.as_ref()?.find_memory_type(start, type_bits, properties)
  }

  pub fn find_supported_format(
    &self,
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
  ) -> Option<vk::Format> {
    self.device.as_ref()?.find_supported_format(&self.instance, candidates, tiling, features)
  }

  /// Sub-allocates memory for `image` from the image pools. Bind it with [`Self::bind_image_memories`].
  pub fn alloc_image_memory(&mut self, image: vk::Image, usage: MemoryUsage) -> Result<MemoryRange, DeviceError> {
    let device = self.device.as_ref().ok_or(DeviceError::NoDevice("alloc_image_memory"))?;
    self.allocator.alloc_image_memory(device, image, usage)
  }

  pub fn alloc_buffer_memory(&mut self, buffer: vk::Buffer, usage: MemoryUsage) -> Result<MemoryRange, DeviceError> {
    let device = self.device.as_ref().ok_or(DeviceError::NoDevice("alloc_buffer_memory"))?;
    self.allocator.alloc_buffer_memory(device, buffer, usage)
  }

  pub fn free_memory(&mut self, range: &MemoryRange) {
    if let Some(device) = &self.device {
      self.allocator.free(device, range);
    }
  }

  /// Releases pooled blocks that no longer hold anything. Returns how many were freed.
  pub fn trim_memory(&mut self) -> usize {
    match &self.device {
      Some(device) => self.allocator.trim(device),
      None => 0,
    }
  }

  pub fn bind_image_memories(&self, images: &[vk::Image], ranges: &[MemoryRange]) -> Result<(), DeviceError> {
    let device = self.device.as_ref().ok_or(DeviceError::NoDevice("bind_image_memories"))?;
    self.allocator.bind_image_memories(device, images, ranges)
  }

  pub fn bind_buffer_memories(&self, buffers: &[vk::Buffer], ranges: &[MemoryRange]) -> Result<(), DeviceError> {
    let device = self.device.as_ref().ok_or(DeviceError::NoDevice("bind_buffer_memories"))?;
    self.allocator.bind_buffer_memories(device, buffers, ranges)
  }

  pub fn create_swapchain(&mut self) -> Result<(), DeviceError> {
    let device = self.device.as_ref().ok_or(DeviceError::NoDevice("create_swapchain"))?;
    if self.swapchain.is_some() {
      warn!("vk: create_swapchain called twice, keeping the existing swapchain");
      return Ok(());
    }
    let sc = SwapchainManager::create(&self.instance, device, self.window.pixel_size(), self.window.resize_event())?;
    self.swapchain = Some(sc);
    Ok(())
  }

  pub fn destroy_swapchain(&mut self) {
    if let (Some(sc), Some(device)) = (self.swapchain.take(), self.device.as_ref()) {
      sc.destroy(device, self.window.resize_event());
    }
  }

  pub fn recreate_swapchain(&mut self) -> Result<(), DeviceError> {
    let size = self.window.pixel_size();
    let device = self.device.as_ref().ok_or(DeviceError::NoDevice("recreate_swapchain"))?;
    let sc = self.swapchain.as_mut().ok_or(DeviceError::NoDevice("recreate_swapchain"))?;
    sc.recreate(&self.instance, device, size)
  }

  /// A resize arrived, or the last rebuild failed, and `process_resize` has not caught up yet.
  pub fn resize_pending(&self) -> bool {
    self.swapchain.as_ref().is_some_and(SwapchainManager::is_stale)
  }

  /// Rebuilds the swapchain if a resize arrived since the last call. Returns whether it did.
  pub fn process_resize(&mut self) -> Result<bool, DeviceError> {
    match &self.swapchain {
      Some(sc) if sc.take_stale() => {}
      _ => return Ok(false),
    }
    self.recreate_swapchain()?;
    Ok(true)
  }

  pub fn swapchain(&self) -> Option<&SwapchainManager> {
    self.swapchain.as_ref()
  }

  pub fn swapchain_settings(&self) -> Option<SwapchainSettings> {
    self.swapchain.as_ref().map(SwapchainManager::settings)
  }

  /// `Ok(false)` means the settings were rejected and nothing changed.
  pub fn set_swapchain_settings(&mut self, settings: SwapchainSettings) -> Result<bool, DeviceError> {
    let size = self.window.pixel_size();
    let device = self.device.as_ref().ok_or(DeviceError::NoDevice("set_swapchain_settings"))?;
    let sc = self.swapchain.as_mut().ok_or(DeviceError::NoDevice("set_swapchain_settings"))?;
    sc.set_settings(&self.instance, device, size, settings)
  }

  pub fn swapchain_images(&self) -> &[SwapchainImage] {
    match &self.swapchain {
      Some(sc) => sc.images(),
      None => &[],
    }
  }

  pub fn swapchain_extent(&self) -> vk::Extent2D {
    self.swapchain.as_ref().map(SwapchainManager::extent).unwrap_or_default()
  }

  pub fn swapchain_depth_format(&self) -> Option<vk::Format> {
    self.swapchain.as_ref().map(SwapchainManager::depth_format)
  }

  pub fn window_size(&self) -> RenderSize {
    self.window.pixel_size()
  }
}

impl<I: InstanceApi> Drop for RendererContext<I> {
  fn drop(&mut self) {
    if let Err(e) = self.wait_idle() {
      warn!("vk: wait idle before teardown failed: {e}");
    }
    self.destroy_device();
  }
}
