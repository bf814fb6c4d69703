// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{CStr, CString};

use anyhow::{Context, Result};
use ash::khr::{bind_memory2, get_memory_requirements2, surface, swapchain};
use ash::prelude::VkResult;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use tracing::{debug, info};

use crate::driver::{
  BufferBind, DedicatedTarget, DeviceApi, ImageBind, InstanceApi, QueueRequest, ResourceRequirements,
};
use crate::host_alloc::{self, HostUsage};

/// Instance, window surface and the loaders hanging off them.
pub struct AshInstance {
  _entry: Entry,
  instance: Instance,
  surface_loader: surface::Instance,
  surface: vk::SurfaceKHR,
  api_version: u32,
  callbacks: vk::AllocationCallbacks<'static>,
}

impl AshInstance {
  pub fn new<W: HasWindowHandle + HasDisplayHandle>(window: &W, app_name: &str) -> Result<Self> {
    let entry = Entry::linked();
    let callbacks = host_alloc::callbacks(HostUsage::RendererBackend);

    let dh: RawDisplayHandle = window.display_handle()?.as_raw();
    let wh: RawWindowHandle = window.window_handle()?.as_raw();

    let loader_version = unsafe { entry.try_enumerate_instance_version() }
      .context("enumerate_instance_version")?
      .unwrap_or(vk::API_VERSION_1_0);
    let api_version = if loader_version >= vk::API_VERSION_1_1 { vk::API_VERSION_1_1 } else { vk::API_VERSION_1_0 };

    let instance = unsafe { create_instance(&entry, dh, app_name, api_version, &callbacks)? };
    let surface = match unsafe { ash_window::create_surface(&entry, &instance, dh, wh, Some(&callbacks)) } {
      Ok(s) => s,
      Err(e) => {
        unsafe { instance.destroy_instance(Some(&callbacks)) };
        return Err(e).context("create_surface");
      }
    };
    let surface_loader = surface::Instance::new(&entry, &instance);

    info!(
      "vk instance ready (api {}.{})",
      vk::api_version_major(api_version),
      vk::api_version_minor(api_version)
    );

    Ok(Self { _entry: entry, instance, surface_loader, surface, api_version, callbacks })
  }
}

impl Drop for AshInstance {
  fn drop(&mut self) {
    unsafe {
      self.surface_loader.destroy_surface(self.surface, Some(&self.callbacks));
      self.instance.destroy_instance(Some(&self.callbacks));
    }
  }
}

unsafe fn create_instance(
  entry: &Entry,
  display_raw: RawDisplayHandle,
  app_name: &str,
  api_version: u32,
  callbacks: &vk::AllocationCallbacks<'static>,
) -> Result<Instance> {
  let app_name = CString::new(app_name).context("application name contains NUL")?;
  let engine_name = c"kiln";

  let app_info = vk::ApplicationInfo {
    s_type: vk::StructureType::APPLICATION_INFO,
    p_application_name: app_name.as_ptr(),
    application_version: 0,
    p_engine_name: engine_name.as_ptr(),
    engine_version: 0,
    api_version,
    ..Default::default()
  };

  let ext_slice = ash_window::enumerate_required_extensions(display_raw)
    .context("enumerate_required_extensions")?;

  let create_info = vk::InstanceCreateInfo {
    s_type: vk::StructureType::INSTANCE_CREATE_INFO,
    p_application_info: &app_info,
    enabled_extension_count: ext_slice.len() as u32,
    pp_enabled_extension_names: ext_slice.as_ptr(),
    ..Default::default()
  };

  Ok(unsafe { entry.create_instance(&create_info, Some(callbacks)) }.context("create_instance")?)
}

impl InstanceApi for AshInstance {
  type Device = AshDevice;

  fn surface(&self) -> vk::SurfaceKHR {
    self.surface
  }

  fn api_version(&self) -> u32 {
    self.api_version
  }

  fn physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
    unsafe { self.instance.enumerate_physical_devices() }
  }

  fn properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
    unsafe { self.instance.get_physical_device_properties(pd) }
  }

  fn features(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures {
    unsafe { self.instance.get_physical_device_features(pd) }
  }

  fn memory_properties(&self, pd: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties {
    unsafe { self.instance.get_physical_device_memory_properties(pd) }
  }

  fn queue_families(&self, pd: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
    unsafe { self.instance.get_physical_device_queue_family_properties(pd) }
  }

  fn device_extensions(&self, pd: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
    let props = unsafe { self.instance.enumerate_device_extension_properties(pd) }?;
    Ok(
      props
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok().map(CStr::to_owned))
        .collect(),
    )
  }

  fn format_properties(&self, pd: vk::PhysicalDevice, format: vk::Format) -> vk::FormatProperties {
    unsafe { self.instance.get_physical_device_format_properties(pd, format) }
  }

  fn surface_support(&self, pd: vk::PhysicalDevice, family: u32, surface: vk::SurfaceKHR) -> VkResult<bool> {
    unsafe { self.surface_loader.get_physical_device_surface_support(pd, family, surface) }
  }

  fn surface_capabilities(&self, pd: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR> {
    unsafe { self.surface_loader.get_physical_device_surface_capabilities(pd, surface) }
  }

  fn surface_formats(&self, pd: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
    unsafe { self.surface_loader.get_physical_device_surface_formats(pd, surface) }
  }

  fn present_modes(&self, pd: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>> {
    unsafe { self.surface_loader.get_physical_device_surface_present_modes(pd, surface) }
  }

  fn create_device(
    &self,
    pd: vk::PhysicalDevice,
    queues: &[QueueRequest],
    extensions: &[&'static CStr],
    features: &vk::PhysicalDeviceFeatures,
  ) -> VkResult<AshDevice> {
    let max_count = queues.iter().map(|q| q.count).max().unwrap_or(1) as usize;
    let priorities = vec![1.0_f32; max_count];

    let qinfos: Vec<vk::DeviceQueueCreateInfo> = queues
      .iter()
      .map(|q| vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: q.family,
        queue_count: q.count,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
      })
      .collect();

    let ext_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();
    let dinfo = vk::DeviceCreateInfo {
      s_type: vk::StructureType::DEVICE_CREATE_INFO,
      queue_create_info_count: qinfos.len() as u32,
      p_queue_create_infos: qinfos.as_ptr(),
      enabled_extension_count: ext_ptrs.len() as u32,
      pp_enabled_extension_names: ext_ptrs.as_ptr(),
      p_enabled_features: features,
      ..Default::default()
    };

    let device = unsafe { self.instance.create_device(pd, &dinfo, Some(&self.callbacks)) }?;

    // Core 1.1 entry points are only usable when both the instance and the device expose 1.1.
    let device_version = self.properties(pd).api_version;
    let core_1_1 = self.api_version.min(device_version) >= vk::API_VERSION_1_1;
    let enabled = |name: &CStr| extensions.iter().any(|e| *e == name);

    let mem_req2 = (!core_1_1 && enabled(get_memory_requirements2::NAME))
      .then(|| get_memory_requirements2::Device::new(&self.instance, &device));
    let bind2 = (!core_1_1 && enabled(bind_memory2::NAME))
      .then(|| bind_memory2::Device::new(&self.instance, &device));
    let swapchain_loader = swapchain::Device::new(&self.instance, &device);

    debug!(
      "ash device: core_1_1={} mem_req2_ext={} bind2_ext={}",
      core_1_1,
      mem_req2.is_some(),
      bind2.is_some()
    );

    Ok(AshDevice {
      device,
      swapchain_loader,
      mem_req2,
      bind2,
      core_1_1,
      callbacks: self.callbacks,
      destroyed: false,
    })
  }
}

pub struct AshDevice {
  device: ash::Device,
  swapchain_loader: swapchain::Device,
  mem_req2: Option<get_memory_requirements2::Device>,
  bind2: Option<bind_memory2::Device>,
  core_1_1: bool,
  callbacks: vk::AllocationCallbacks<'static>,
  destroyed: bool,
}

impl AshDevice {
  pub fn raw(&self) -> &ash::Device {
    &self.device
  }

  fn cb(&self) -> Option<&vk::AllocationCallbacks<'static>> {
    Some(&self.callbacks)
  }

  fn can_query_dedicated(&self, wanted: bool) -> bool {
    wanted && (self.core_1_1 || self.mem_req2.is_some())
  }
}

fn with_dedicated_hint(
  requirements: vk::MemoryRequirements,
  dedicated: &vk::MemoryDedicatedRequirements<'_>,
) -> ResourceRequirements {
  ResourceRequirements {
    requirements,
    prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
    requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
  }
}

impl DeviceApi for AshDevice {
  fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
    unsafe { self.device.get_device_queue(family, index) }
  }

  fn wait_idle(&self) -> VkResult<()> {
    unsafe { self.device.device_wait_idle() }
  }

  fn destroy(&mut self) {
    if self.destroyed {
      return;
    }
    self.destroyed = true;
    unsafe { self.device.destroy_device(self.cb()) };
  }

  fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR> {
    unsafe { self.swapchain_loader.create_swapchain(info, self.cb()) }
  }

  fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
    unsafe { self.swapchain_loader.destroy_swapchain(swapchain, self.cb()) }
  }

  fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
    unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
  }

  fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
    unsafe { self.device.create_image(info, self.cb()) }
  }

  fn destroy_image(&self, image: vk::Image) {
    unsafe { self.device.destroy_image(image, self.cb()) }
  }

  fn image_memory_requirements(&self, image: vk::Image, query_dedicated: bool) -> ResourceRequirements {
    if !self.can_query_dedicated(query_dedicated) {
      let requirements = unsafe { self.device.get_image_memory_requirements(image) };
      return ResourceRequirements { requirements, ..Default::default() };
    }

    let info = vk::ImageMemoryRequirementsInfo2 {
      s_type: vk::StructureType::IMAGE_MEMORY_REQUIREMENTS_INFO_2,
      image,
      ..Default::default()
    };
    let mut dedicated = vk::MemoryDedicatedRequirements {
      s_type: vk::StructureType::MEMORY_DEDICATED_REQUIREMENTS,
      ..Default::default()
    };
    let mut out = vk::MemoryRequirements2 {
      s_type: vk::StructureType::MEMORY_REQUIREMENTS_2,
      ..Default::default()
    }
    .push_next(&mut dedicated);

    unsafe {
      match &self.mem_req2 {
        Some(ext) => ext.get_image_memory_requirements2(&info, &mut out),
        None => self.device.get_image_memory_requirements2(&info, &mut out),
      }
    }
    let requirements = out.memory_requirements;
    with_dedicated_hint(requirements, &dedicated)
  }

  fn buffer_memory_requirements(&self, buffer: vk::Buffer, query_dedicated: bool) -> ResourceRequirements {
    if !self.can_query_dedicated(query_dedicated) {
      let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
      return ResourceRequirements { requirements, ..Default::default() };
    }

    let info = vk::BufferMemoryRequirementsInfo2 {
      s_type: vk::StructureType::BUFFER_MEMORY_REQUIREMENTS_INFO_2,
      buffer,
      ..Default::default()
    };
    let mut dedicated = vk::MemoryDedicatedRequirements {
      s_type: vk::StructureType::MEMORY_DEDICATED_REQUIREMENTS,
      ..Default::default()
    };
    let mut out = vk::MemoryRequirements2 {
      s_type: vk::StructureType::MEMORY_REQUIREMENTS_2,
      ..Default::default()
    }
    .push_next(&mut dedicated);

    unsafe {
      match &self.mem_req2 {
        Some(ext) => ext.get_buffer_memory_requirements2(&info, &mut out),
        None => self.device.get_buffer_memory_requirements2(&info, &mut out),
      }
    }
    let requirements = out.memory_requirements;
    with_dedicated_hint(requirements, &dedicated)
  }

  fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
    unsafe { self.device.create_image_view(info, self.cb()) }
  }

  fn destroy_image_view(&self, view: vk::ImageView) {
    unsafe { self.device.destroy_image_view(view, self.cb()) }
  }

  fn allocate_memory(
    &self,
    size: vk::DeviceSize,
    memory_type_index: u32,
    dedicated: Option<DedicatedTarget>,
  ) -> VkResult<vk::DeviceMemory> {
    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo {
      s_type: vk::StructureType::MEMORY_DEDICATED_ALLOCATE_INFO,
      ..Default::default()
    };
    let mut info = vk::MemoryAllocateInfo {
      s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
      allocation_size: size,
      memory_type_index,
      ..Default::default()
    };
    if let Some(target) = dedicated {
      match target {
        DedicatedTarget::Image(image) => dedicated_info.image = image,
        DedicatedTarget::Buffer(buffer) => dedicated_info.buffer = buffer,
      }
      info = info.push_next(&mut dedicated_info);
    }
    unsafe { self.device.allocate_memory(&info, self.cb()) }
  }

  fn free_memory(&self, memory: vk::DeviceMemory) {
    unsafe { self.device.free_memory(memory, self.cb()) }
  }

  fn bind_image_memory(&self, bind: ImageBind) -> VkResult<()> {
    unsafe { self.device.bind_image_memory(bind.image, bind.memory, bind.offset) }
  }

  fn bind_image_memories(&self, binds: &[ImageBind]) -> VkResult<()> {
    let infos: Vec<vk::BindImageMemoryInfo> = binds
      .iter()
      .map(|b| vk::BindImageMemoryInfo {
        s_type: vk::StructureType::BIND_IMAGE_MEMORY_INFO,
        image: b.image,
        memory: b.memory,
        memory_offset: b.offset,
        ..Default::default()
      })
      .collect();

    // the KHR loader is a bare function table
    unsafe {
      match &self.bind2 {
        Some(ext) => (ext.fp().bind_image_memory2_khr)(ext.device(), infos.len() as u32, infos.as_ptr()).result(),
        None if self.core_1_1 => self.device.bind_image_memory2(&infos),
        None => binds.iter().try_for_each(|&b| self.bind_image_memory(b)),
      }
    }
  }

  fn bind_buffer_memory(&self, bind: BufferBind) -> VkResult<()> {
    unsafe { self.device.bind_buffer_memory(bind.buffer, bind.memory, bind.offset) }
  }

  fn bind_buffer_memories(&self, binds: &[BufferBind]) -> VkResult<()> {
    let infos: Vec<vk::BindBufferMemoryInfo> = binds
      .iter()
      .map(|b| vk::BindBufferMemoryInfo {
        s_type: vk::StructureType::BIND_BUFFER_MEMORY_INFO,
        buffer: b.buffer,
        memory: b.memory,
        memory_offset: b.offset,
        ..Default::default()
      })
      .collect();

    unsafe {
      match &self.bind2 {
        Some(ext) => (ext.fp().bind_buffer_memory2_khr)(ext.device(), infos.len() as u32, infos.as_ptr()).result(),
        None if self.core_1_1 => self.device.bind_buffer_memory2(&infos),
        None => binds.iter().try_for_each(|&b| self.bind_buffer_memory(b)),
      }
    }
  }

  fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
    unsafe { self.device.create_render_pass(info, self.cb()) }
  }

  fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
    unsafe { self.device.destroy_render_pass(render_pass, self.cb()) }
  }

  fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo<'_>) -> VkResult<vk::Framebuffer> {
    unsafe { self.device.create_framebuffer(info, self.cb()) }
  }

  fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
    unsafe { self.device.destroy_framebuffer(framebuffer, self.cb()) }
  }
}
