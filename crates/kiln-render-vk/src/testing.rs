// SPDX-License-Identifier: CEPL-1.0
//! In-memory stand-ins for the driver used by the unit tests.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::ffi::{CStr, CString};

use ash::khr::{bind_memory2, dedicated_allocation, get_memory_requirements2, swapchain, synchronization2};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use kiln_render::{RenderSize, ResizeEvent, WindowSource};

use crate::driver::{
  BufferBind, DedicatedTarget, DeviceApi, ImageBind, InstanceApi, QueueRequest, ResourceRequirements,
};

#[derive(Default)]
pub(crate) struct FakeWindow {
  pub size: Cell<RenderSize>,
  pub resize: ResizeEvent,
}

impl FakeWindow {
  pub fn new(width: u32, height: u32) -> Rc<Self> {
    Rc::new(Self { size: Cell::new(RenderSize { width, height }), resize: ResizeEvent::new() })
  }

  /// What the platform layer does on a compositor resize.
  pub fn resize_to(&self, width: u32, height: u32) {
    self.size.set(RenderSize { width, height });
    self.resize.emit();
  }
}

impl WindowSource for FakeWindow {
  fn pixel_size(&self) -> RenderSize {
    self.size.get()
  }

  fn resize_event(&self) -> &ResizeEvent {
    &self.resize
  }
}

pub(crate) fn memory_props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
  let mut props = vk::PhysicalDeviceMemoryProperties {
    memory_type_count: types.len() as u32,
    memory_heap_count: 1,
    ..Default::default()
  };
  for (i, &flags) in types.iter().enumerate() {
    props.memory_types[i] = vk::MemoryType { property_flags: flags, heap_index: 0 };
  }
  props
}

pub(crate) fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
  vk::SurfaceFormatKHR { format, color_space }
}

#[derive(Clone, Debug)]
pub(crate) struct FakeGpu {
  pub api_version: u32,
  pub device_type: vk::PhysicalDeviceType,
  /// (flags, queue count, can present)
  pub families: Vec<(vk::QueueFlags, u32, bool)>,
  pub extensions: Vec<CString>,
  pub depth_formats: Vec<vk::Format>,
  pub surface_formats: Vec<vk::SurfaceFormatKHR>,
  pub present_modes: Vec<vk::PresentModeKHR>,
  pub memory_types: Vec<vk::MemoryPropertyFlags>,
}

impl FakeGpu {
  pub fn discrete() -> Self {
    Self {
      api_version: vk::make_api_version(0, 1, 3, 0),
      device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
      families: vec![(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 16, true)],
      extensions: vec![swapchain::NAME.to_owned()],
      depth_formats: vec![vk::Format::D32_SFLOAT],
      surface_formats: vec![
        surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
      ],
      present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
      memory_types: vec![
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
      ],
    }
  }

  pub fn integrated() -> Self {
    Self { device_type: vk::PhysicalDeviceType::INTEGRATED_GPU, ..Self::discrete() }
  }

  pub fn all_optional_extensions(&mut self) {
    for name in [get_memory_requirements2::NAME, dedicated_allocation::NAME, bind_memory2::NAME, synchronization2::NAME] {
      self.extensions.push(name.to_owned());
    }
  }
}

pub(crate) struct FakeInstance {
  pub gpus: Vec<FakeGpu>,
  pub api_version: u32,
  pub caps: Cell<vk::SurfaceCapabilitiesKHR>,
  pub fail_create_device: Cell<Option<vk::Result>>,
  pub created: RefCell<Vec<(Vec<QueueRequest>, Vec<&'static CStr>)>>,
  /// Events from every device this instance created, readable after the device is gone.
  pub journal: Rc<RefCell<Vec<&'static str>>>,
}

impl FakeInstance {
  pub fn new(gpus: Vec<FakeGpu>) -> Self {
    Self {
      gpus,
      api_version: vk::API_VERSION_1_1,
      caps: Cell::new(fixed_caps(800, 600)),
      fail_create_device: Cell::new(None),
      created: RefCell::new(Vec::new()),
      journal: Rc::default(),
    }
  }

  pub fn handle(&self, i: usize) -> vk::PhysicalDevice {
    vk::PhysicalDevice::from_raw(i as u64 + 1)
  }

  fn gpu(&self, pd: vk::PhysicalDevice) -> &FakeGpu {
    &self.gpus[pd.as_raw() as usize - 1]
  }

  pub fn set_extent(&self, width: u32, height: u32) {
    self.caps.set(fixed_caps(width, height));
  }
}

/// Capabilities of a surface whose size the compositor dictates.
pub(crate) fn fixed_caps(width: u32, height: u32) -> vk::SurfaceCapabilitiesKHR {
  vk::SurfaceCapabilitiesKHR {
    min_image_count: 2,
    max_image_count: 3,
    current_extent: vk::Extent2D { width, height },
    min_image_extent: vk::Extent2D { width: 1, height: 1 },
    max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
    max_image_array_layers: 1,
    supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
    current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
    supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
    supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
  }
}

impl InstanceApi for FakeInstance {
  type Device = FakeDevice;

  fn surface(&self) -> vk::SurfaceKHR {
    vk::SurfaceKHR::from_raw(0x5u64)
  }

  fn api_version(&self) -> u32 {
    self.api_version
  }

  fn physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
    Ok((0..self.gpus.len()).map(|i| self.handle(i)).collect())
  }

  fn properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
    let gpu = self.gpu(pd);
    vk::PhysicalDeviceProperties { api_version: gpu.api_version, device_type: gpu.device_type, ..Default::default() }
  }

  fn features(&self, _pd: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures { sampler_anisotropy: vk::TRUE, ..Default::default() }
  }

  fn memory_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties {
    memory_props(&self.gpu(pd).memory_types)
  }

  fn queue_families(&self, pd: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
    self
      .gpu(pd)
      .families
      .iter()
      .map(|&(flags, count, _)| vk::QueueFamilyProperties { queue_flags: flags, queue_count: count, ..Default::default() })
      .collect()
  }

  fn device_extensions(&self, pd: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
    Ok(self.gpu(pd).extensions.clone())
  }

  fn format_properties(&self, pd: vk::PhysicalDevice, format: vk::Format) -> vk::FormatProperties {
    let mut props = vk::FormatProperties::default();
    if self.gpu(pd).depth_formats.contains(&format) {
      props.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    props
  }

  fn surface_support(&self, pd: vk::PhysicalDevice, family: u32, _surface: vk::SurfaceKHR) -> VkResult<bool> {
    Ok(self.gpu(pd).families.get(family as usize).is_some_and(|f| f.2))
  }

  fn surface_capabilities(&self, _pd: vk::PhysicalDevice, _surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR> {
    Ok(self.caps.get())
  }

  fn surface_formats(&self, pd: vk::PhysicalDevice, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
    Ok(self.gpu(pd).surface_formats.clone())
  }

  fn present_modes(&self, pd: vk::PhysicalDevice, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>> {
    Ok(self.gpu(pd).present_modes.clone())
  }

  fn create_device(
    &self,
    _pd: vk::PhysicalDevice,
    queues: &[QueueRequest],
    extensions: &[&'static CStr],
    _features: &vk::PhysicalDeviceFeatures,
  ) -> VkResult<FakeDevice> {
    if let Some(err) = self.fail_create_device.get() {
      return Err(err);
    }
    self.created.borrow_mut().push((queues.to_vec(), extensions.to_vec()));
    Ok(FakeDevice { journal: Some(self.journal.clone()), ..FakeDevice::default() })
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SwapchainCall {
  pub handle: vk::SwapchainKHR,
  pub old: vk::SwapchainKHR,
  pub extent: vk::Extent2D,
  pub min_image_count: u32,
  pub sharing: vk::SharingMode,
  pub family_count: u32,
  pub format: vk::Format,
  pub color_space: vk::ColorSpaceKHR,
  pub present_mode: vk::PresentModeKHR,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocationCall {
  pub memory: vk::DeviceMemory,
  pub size: vk::DeviceSize,
  pub type_index: u32,
  pub dedicated: Option<DedicatedTarget>,
}

#[derive(Default)]
pub(crate) struct FakeDevice {
  next_handle: Cell<u64>,
  alloc_failures: RefCell<HashMap<u32, vk::Result>>,
  alloc_attempts: RefCell<Vec<u32>>,
  queue_lookups: RefCell<Vec<(u32, u32)>>,

  pub allocations: RefCell<Vec<AllocationCall>>,
  pub swapchains: RefCell<Vec<SwapchainCall>>,
  pub events: RefCell<Vec<&'static str>>,
  pub batched_binds: RefCell<Vec<Vec<ImageBind>>>,
  pub single_binds: RefCell<Vec<ImageBind>>,
  pub batched_buffer_binds: RefCell<Vec<Vec<BufferBind>>>,
  pub single_buffer_binds: RefCell<Vec<BufferBind>>,
  pub requirement_queries: RefCell<Vec<bool>>,

  pub prefers_dedicated: Cell<bool>,
  pub requires_dedicated: Cell<bool>,
  /// Size and alignment reported for every image; zero means 1 MiB at 4 KiB.
  pub image_requirements: Cell<(vk::DeviceSize, vk::DeviceSize)>,
  /// Per-handle overrides, keyed by raw image or buffer handle.
  pub resource_requirements: RefCell<HashMap<u64, vk::MemoryRequirements>>,
  pub swapchain_image_override: Cell<u32>,
  pub fail_swapchain: Cell<Option<vk::Result>>,

  live_memory: Cell<i64>,
  live_images: Cell<i64>,
  live_views: Cell<i64>,
  live_framebuffers: Cell<i64>,
  live_render_passes: Cell<i64>,
  live_swapchains: Cell<i64>,
  pub destroyed: Cell<bool>,
  journal: Option<Rc<RefCell<Vec<&'static str>>>>,
}

fn bump(c: &Cell<i64>, by: i64) {
  c.set(c.get() + by);
}

impl FakeDevice {
  fn next(&self) -> u64 {
    let n = self.next_handle.get() + 1;
    self.next_handle.set(n);
    0x1000 + n
  }

  fn log(&self, event: &'static str) {
    self.events.borrow_mut().push(event);
    if let Some(j) = &self.journal {
      j.borrow_mut().push(event);
    }
  }

  pub fn fail_alloc(&self, type_index: u32, result: vk::Result) {
    self.alloc_failures.borrow_mut().insert(type_index, result);
  }

  pub fn alloc_attempts(&self) -> Vec<u32> {
    self.alloc_attempts.borrow().clone()
  }

  pub fn queue_lookups(&self) -> Vec<(u32, u32)> {
    self.queue_lookups.borrow().clone()
  }

  pub fn set_requirements(&self, handle: u64, size: vk::DeviceSize, alignment: vk::DeviceSize, memory_type_bits: u32) {
    self
      .resource_requirements
      .borrow_mut()
      .insert(handle, vk::MemoryRequirements { size, alignment, memory_type_bits });
  }

  fn hinted(&self, requirements: vk::MemoryRequirements, query_dedicated: bool) -> ResourceRequirements {
    ResourceRequirements {
      requirements,
      prefers_dedicated: query_dedicated && self.prefers_dedicated.get(),
      requires_dedicated: query_dedicated && self.requires_dedicated.get(),
    }
  }

  pub fn live_memory(&self) -> i64 {
    self.live_memory.get()
  }

  /// (images, views, framebuffers, render passes, swapchains, memory blocks)
  pub fn live(&self) -> (i64, i64, i64, i64, i64, i64) {
    (
      self.live_images.get(),
      self.live_views.get(),
      self.live_framebuffers.get(),
      self.live_render_passes.get(),
      self.live_swapchains.get(),
      self.live_memory.get(),
    )
  }

  pub fn last_swapchain(&self) -> Option<SwapchainCall> {
    self.swapchains.borrow().last().copied()
  }
}

impl DeviceApi for FakeDevice {
  fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
    self.queue_lookups.borrow_mut().push((family, index));
    vk::Queue::from_raw(((family as u64 + 1) << 8) | (index as u64 + 1))
  }

  fn wait_idle(&self) -> VkResult<()> {
    self.log("wait_idle");
    Ok(())
  }

  fn destroy(&mut self) {
    self.log("destroy_device");
    self.destroyed.set(true);
  }

  fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR> {
    if let Some(err) = self.fail_swapchain.get() {
      return Err(err);
    }
    self.log("create_swapchain");
    let handle = vk::SwapchainKHR::from_raw(self.next());
    self.swapchains.borrow_mut().push(SwapchainCall {
      handle,
      old: info.old_swapchain,
      extent: info.image_extent,
      min_image_count: info.min_image_count,
      sharing: info.image_sharing_mode,
      family_count: info.queue_family_index_count,
      format: info.image_format,
      color_space: info.image_color_space,
      present_mode: info.present_mode,
    });
    bump(&self.live_swapchains, 1);
    Ok(handle)
  }

  fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
    if swapchain != vk::SwapchainKHR::null() {
      self.log("destroy_swapchain");
      bump(&self.live_swapchains, -1);
    }
  }

  fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
    let count = match self.swapchain_image_override.get() {
      0 => self
        .swapchains
        .borrow()
        .iter()
        .find(|c| c.handle == swapchain)
        .map_or(0, |c| c.min_image_count),
      n => n,
    };
    Ok((0..count).map(|_| vk::Image::from_raw(self.next())).collect())
  }

  fn create_image(&self, _info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
    bump(&self.live_images, 1);
    Ok(vk::Image::from_raw(self.next()))
  }

  fn destroy_image(&self, image: vk::Image) {
    if image != vk::Image::null() {
      bump(&self.live_images, -1);
    }
  }

  fn image_memory_requirements(&self, image: vk::Image, query_dedicated: bool) -> ResourceRequirements {
    self.requirement_queries.borrow_mut().push(query_dedicated);
    if let Some(&r) = self.resource_requirements.borrow().get(&image.as_raw()) {
      return self.hinted(r, query_dedicated);
    }
    let (size, alignment) = match self.image_requirements.get() {
      (0, _) => (1 << 20, 4096),
      r => r,
    };
    self.hinted(vk::MemoryRequirements { size, alignment, memory_type_bits: 0b11 }, query_dedicated)
  }

  /// 64 KiB at 256 unless overridden.
  fn buffer_memory_requirements(&self, buffer: vk::Buffer, query_dedicated: bool) -> ResourceRequirements {
    let r = match self.resource_requirements.borrow().get(&buffer.as_raw()) {
      Some(&r) => r,
      None => vk::MemoryRequirements { size: 64 << 10, alignment: 256, memory_type_bits: 0b11 },
    };
    self.hinted(r, query_dedicated)
  }

  fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
    bump(&self.live_views, 1);
    Ok(vk::ImageView::from_raw(self.next()))
  }

  fn destroy_image_view(&self, view: vk::ImageView) {
    if view != vk::ImageView::null() {
      bump(&self.live_views, -1);
    }
  }

  fn allocate_memory(
    &self,
    size: vk::DeviceSize,
    memory_type_index: u32,
    dedicated: Option<DedicatedTarget>,
  ) -> VkResult<vk::DeviceMemory> {
    self.alloc_attempts.borrow_mut().push(memory_type_index);
    if let Some(&err) = self.alloc_failures.borrow().get(&memory_type_index) {
      return Err(err);
    }
    let memory = vk::DeviceMemory::from_raw(self.next());
    self.allocations.borrow_mut().push(AllocationCall { memory, size, type_index: memory_type_index, dedicated });
    bump(&self.live_memory, 1);
    Ok(memory)
  }

  fn free_memory(&self, memory: vk::DeviceMemory) {
    if memory != vk::DeviceMemory::null() {
      self.log("free_memory");
      bump(&self.live_memory, -1);
    }
  }

  fn bind_image_memory(&self, bind: ImageBind) -> VkResult<()> {
    self.single_binds.borrow_mut().push(bind);
    Ok(())
  }

  fn bind_image_memories(&self, binds: &[ImageBind]) -> VkResult<()> {
    self.batched_binds.borrow_mut().push(binds.to_vec());
    Ok(())
  }

  fn bind_buffer_memory(&self, bind: BufferBind) -> VkResult<()> {
    self.single_buffer_binds.borrow_mut().push(bind);
    Ok(())
  }

  fn bind_buffer_memories(&self, binds: &[BufferBind]) -> VkResult<()> {
    self.batched_buffer_binds.borrow_mut().push(binds.to_vec());
    Ok(())
  }

  fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
    bump(&self.live_render_passes, 1);
    Ok(vk::RenderPass::from_raw(self.next()))
  }

  fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
    if render_pass != vk::RenderPass::null() {
      bump(&self.live_render_passes, -1);
    }
  }

  fn create_framebuffer(&self, _info: &vk::FramebufferCreateInfo<'_>) -> VkResult<vk::Framebuffer> {
    bump(&self.live_framebuffers, 1);
    Ok(vk::Framebuffer::from_raw(self.next()))
  }

  fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
    if framebuffer != vk::Framebuffer::null() {
      self.log("destroy_framebuffer");
      bump(&self.live_framebuffers, -1);
    }
  }
}
