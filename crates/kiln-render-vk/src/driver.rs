// SPDX-License-Identifier: CEPL-1.0
//! The raw API boundary. Everything above this module talks to the driver through these two
//! traits, which keeps selection, queue planning, memory policy and swapchain lifecycle
//! testable without a GPU.
use std::ffi::{CStr, CString};

use ash::prelude::VkResult;
use ash::vk;

/// One `VkDeviceQueueCreateInfo` worth of intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueRequest {
  pub family: u32,
  pub count: u32,
}

/// Memory requirements of an image or buffer, plus the driver's dedicated-allocation hint.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceRequirements {
  pub requirements: vk::MemoryRequirements,
  pub prefers_dedicated: bool,
  pub requires_dedicated: bool,
}

impl ResourceRequirements {
  pub fn wants_dedicated(&self) -> bool {
    self.prefers_dedicated || self.requires_dedicated
  }
}

/// The single resource a dedicated allocation is made for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedicatedTarget {
  Image(vk::Image),
  Buffer(vk::Buffer),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBind {
  pub image: vk::Image,
  pub memory: vk::DeviceMemory,
  pub offset: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBind {
  pub buffer: vk::Buffer,
  pub memory: vk::DeviceMemory,
  pub offset: vk::DeviceSize,
}

pub trait InstanceApi {
  type Device: DeviceApi;

  fn surface(&self) -> vk::SurfaceKHR;
  /// Version the instance was created with; caps what a device can use from core.
  fn api_version(&self) -> u32;

  fn physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>>;
  fn properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties;
  fn features(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures;
  fn memory_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties;
  fn queue_families(&self, pd: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties>;
  fn device_extensions(&self, pd: vk::PhysicalDevice) -> VkResult<Vec<CString>>;
  fn format_properties(&self, pd: vk::PhysicalDevice, format: vk::Format) -> vk::FormatProperties;

  fn surface_support(&self, pd: vk::PhysicalDevice, family: u32, surface: vk::SurfaceKHR) -> VkResult<bool>;
  fn surface_capabilities(&self, pd: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR>;
  fn surface_formats(&self, pd: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
  fn present_modes(&self, pd: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>>;

  fn create_device(
    &self,
    pd: vk::PhysicalDevice,
    queues: &[QueueRequest],
    extensions: &[&'static CStr],
    features: &vk::PhysicalDeviceFeatures,
  ) -> VkResult<Self::Device>;
}

/// Logical-device calls. Destroy calls tolerate null handles as no-ops.
pub trait DeviceApi {
  fn get_queue(&self, family: u32, index: u32) -> vk::Queue;
  fn wait_idle(&self) -> VkResult<()>;
  fn destroy(&mut self);

  fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR>;
  fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
  fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;

  fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image>;
  fn destroy_image(&self, image: vk::Image);
  /// With `query_dedicated` false the dedicated flags are always false.
  fn image_memory_requirements(&self, image: vk::Image, query_dedicated: bool) -> ResourceRequirements;
  fn buffer_memory_requirements(&self, buffer: vk::Buffer, query_dedicated: bool) -> ResourceRequirements;

  fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;
  fn destroy_image_view(&self, view: vk::ImageView);

  fn allocate_memory(
    &self,
    size: vk::DeviceSize,
    memory_type_index: u32,
    dedicated: Option<DedicatedTarget>,
  ) -> VkResult<vk::DeviceMemory>;
  fn free_memory(&self, memory: vk::DeviceMemory);
  fn bind_image_memory(&self, bind: ImageBind) -> VkResult<()>;
  fn bind_image_memories(&self, binds: &[ImageBind]) -> VkResult<()>;
  fn bind_buffer_memory(&self, bind: BufferBind) -> VkResult<()>;
  fn bind_buffer_memories(&self, binds: &[BufferBind]) -> VkResult<()>;

  fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass>;
  fn destroy_render_pass(&self, render_pass: vk::RenderPass);
  fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>) -> VkResult<vk::Framebuffer>;
  fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
}

pub(crate) fn has_extension(available: &[CString], name: &CStr) -> bool {
  available.iter().any(|e| e.as_c_str() == name)
}
