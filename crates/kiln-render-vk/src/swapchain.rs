// SPDX-License-Identifier: CEPL-1.0
//! Presentable image chain plus the per-image depth buffers, render pass and framebuffers.
//!
//! A zero-area surface (minimized window) is represented by a null swapchain handle and an empty
//! image list; every build step below returns early on a null handle.
//!
//! Teardown order per image is strict: framebuffer, depth view, depth image, color view. Depth memory
//! is freed after all depth images are gone, then the render pass. The swapchain handle itself is
//! only destroyed once its replacement exists.
use std::cell::Cell;
use std::rc::Rc;

use ash::vk;
use kiln_render::{ListenerId, RenderSize, ResizeEvent};
use tracing::{debug, info, warn};

use crate::device::GpuDevice;
use crate::driver::{DedicatedTarget, DeviceApi, ImageBind, InstanceApi};
use crate::error::DeviceError;
use crate::memory::{MemoryRange, MemoryUsage, SharedLayout};
use crate::queue::QueueFamilyIndices;
use crate::select;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainSettings {
  pub image_format: vk::Format,
  pub color_space: vk::ColorSpaceKHR,
  pub depth_format: vk::Format,
  pub composite_alpha: vk::CompositeAlphaFlagsKHR,
  pub present_mode: vk::PresentModeKHR,
  pub clipped: bool,
}

/// Color image and view are owned by the presentation engine; everything else is ours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwapchainImage {
  pub image: vk::Image,
  pub view: vk::ImageView,
  pub depth_image: vk::Image,
  pub depth_view: vk::ImageView,
  pub depth_memory: MemoryRange,
  pub framebuffer: vk::Framebuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthBacking {
  None,
  /// One block, each image at its own offset.
  Shared(vk::DeviceMemory),
  /// One block per image, recorded in each image's `depth_memory`.
  Dedicated,
}

pub fn surface_format_score(f: &vk::SurfaceFormatKHR) -> u32 {
  let srgb8 = matches!(f.format, vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_SRGB);
  let nonlinear = f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;
  srgb8 as u32 + nonlinear as u32
}

/// Highest scoring pair; the earliest one wins a tie.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
  let mut best: Option<vk::SurfaceFormatKHR> = None;
  for f in formats {
    if best.map_or(true, |b| surface_format_score(f) > surface_format_score(&b)) {
      best = Some(*f);
    }
  }
  best
}

pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, window: RenderSize) -> vk::Extent2D {
  if caps.current_extent.width != u32::MAX && caps.current_extent.height != u32::MAX {
    return caps.current_extent;
  }
  vk::Extent2D {
    width: window.width.max(caps.min_image_extent.width).min(caps.max_image_extent.width),
    height: window.height.max(caps.min_image_extent.height).min(caps.max_image_extent.height),
  }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
  if caps.max_image_count == 0 {
    caps.min_image_count + 1
  } else {
    (caps.min_image_count + 1).min(caps.max_image_count)
  }
}

fn sharing(indices: &QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
  match (indices.graphics, indices.present) {
    (Some(g), Some(p)) if g != p => (vk::SharingMode::CONCURRENT, vec![g, p]),
    _ => (vk::SharingMode::EXCLUSIVE, Vec::new()),
  }
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
  match format {
    vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT => {
      vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    }
    _ => vk::ImageAspectFlags::DEPTH,
  }
}

/// First supported mode in this order; the surface always reports at least one.
fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
  use vk::CompositeAlphaFlagsKHR as A;
  [A::OPAQUE, A::PRE_MULTIPLIED, A::POST_MULTIPLIED, A::INHERIT]
    .into_iter()
    .find(|&a| supported.contains(a))
    .unwrap_or(A::OPAQUE)
}

pub fn default_settings<I, D>(instance: &I, device: &GpuDevice<D>) -> Result<SwapchainSettings, DeviceError>
where
  I: InstanceApi,
  D: DeviceApi,
{
  let formats = instance
    .surface_formats(device.physical(), instance.surface())
    .map_err(DeviceError::vk("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
  let surface_format = choose_surface_format(&formats)
    .ok_or(DeviceError::Vk { op: "vkGetPhysicalDeviceSurfaceFormatsKHR", result: vk::Result::ERROR_SURFACE_LOST_KHR })?;
  let depth_format = select::find_depth_format(instance, device.physical()).ok_or(DeviceError::NoSupportedFormat {
    tiling: vk::ImageTiling::OPTIMAL,
    features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
  })?;
  let caps = instance
    .surface_capabilities(device.physical(), instance.surface())
    .map_err(DeviceError::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

  Ok(SwapchainSettings {
    image_format: surface_format.format,
    color_space: surface_format.color_space,
    depth_format,
    composite_alpha: choose_composite_alpha(caps.supported_composite_alpha),
    present_mode: vk::PresentModeKHR::FIFO,
    clipped: true,
  })
}

/// The format/color-space pair, present mode and composite alpha must be offered by the surface, and
/// the depth format must be usable as an optimal-tiling depth attachment.
pub fn settings_supported<I, D>(
  instance: &I,
  device: &GpuDevice<D>,
  settings: &SwapchainSettings,
) -> Result<bool, DeviceError>
where
  I: InstanceApi,
  D: DeviceApi,
{
  let pd = device.physical();
  let surface = instance.surface();
  let formats = instance
    .surface_formats(pd, surface)
    .map_err(DeviceError::vk("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
  if !formats.iter().any(|f| f.format == settings.image_format && f.color_space == settings.color_space) {
    return Ok(false);
  }
  let modes = instance
    .present_modes(pd, surface)
    .map_err(DeviceError::vk("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;
  if !modes.contains(&settings.present_mode) {
    return Ok(false);
  }
  let caps = instance
    .surface_capabilities(pd, surface)
    .map_err(DeviceError::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;
  if settings.composite_alpha.is_empty() || !caps.supported_composite_alpha.contains(settings.composite_alpha) {
    return Ok(false);
  }
  let depth = instance.format_properties(pd, settings.depth_format);
  Ok(depth.optimal_tiling_features.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT))
}

pub struct SwapchainManager {
  settings: SwapchainSettings,
  handle: vk::SwapchainKHR,
  extent: vk::Extent2D,
  images: Vec<SwapchainImage>,
  render_pass: vk::RenderPass,
  depth_backing: DepthBacking,
  generation: u64,
  stale: Rc<Cell<bool>>,
  listener: Option<ListenerId>,
}

impl SwapchainManager {
  /// Builds the chain with default settings and subscribes to `resize`. A zero-area surface yields a
  /// valid manager with a null handle.
  pub fn create<I, D>(
    instance: &I,
    device: &GpuDevice<D>,
    window_size: RenderSize,
    resize: &ResizeEvent,
  ) -> Result<Self, DeviceError>
  where
    I: InstanceApi,
    D: DeviceApi,
  {
    let settings = default_settings(instance, device)?;
    let mut sc = Self {
      settings,
      handle: vk::SwapchainKHR::null(),
      extent: vk::Extent2D::default(),
      images: Vec::new(),
      render_pass: vk::RenderPass::null(),
      depth_backing: DepthBacking::None,
      generation: 0,
      stale: Rc::new(Cell::new(false)),
      listener: None,
    };

    if let Err(e) = sc.build(instance, device, window_size, vk::SwapchainKHR::null()) {
      sc.release_images(device);
      device.raw().destroy_swapchain(sc.handle);
      return Err(e);
    }

    let stale = sc.stale.clone();
    sc.listener = Some(resize.add_listener(move || stale.set(true)));
    Ok(sc)
  }

  /// Caller guarantees no GPU work still references the chain.
  pub fn destroy<D: DeviceApi>(mut self, device: &GpuDevice<D>, resize: &ResizeEvent) {
    if let Some(id) = self.listener.take() {
      resize.remove_listener(id);
    }
    self.release_images(device);
    device.raw().destroy_swapchain(self.handle);
    self.handle = vk::SwapchainKHR::null();
    info!("vk: swapchain destroyed");
  }

  /// Tears down images, depth buffers and framebuffers, then builds a new chain that takes over from
  /// the current handle. Caller guarantees no GPU work still references the chain.
  pub fn recreate<I, D>(&mut self, instance: &I, device: &GpuDevice<D>, window_size: RenderSize) -> Result<(), DeviceError>
  where
    I: InstanceApi,
    D: DeviceApi,
  {
    self.stale.set(false);
    self.release_images(device);
    let old = self.handle;
    let result = self.build(instance, device, window_size, old);
    if result.is_err() {
      self.release_images(device);
      if self.handle != old {
        device.raw().destroy_swapchain(self.handle);
      }
      self.handle = vk::SwapchainKHR::null();
      // try again on the next process_resize
      self.stale.set(true);
    }
    result
  }

  /// Returns `Ok(false)` and leaves everything untouched when the surface or device cannot honor
  /// `settings`.
  pub fn set_settings<I, D>(
    &mut self,
    instance: &I,
    device: &GpuDevice<D>,
    window_size: RenderSize,
    settings: SwapchainSettings,
  ) -> Result<bool, DeviceError>
  where
    I: InstanceApi,
    D: DeviceApi,
  {
    if !settings_supported(instance, device, &settings)? {
      warn!(
        "vk: rejected swapchain settings {:?}/{:?} present={:?} depth={:?} alpha={:?}",
        settings.image_format,
        settings.color_space,
        settings.present_mode,
        settings.depth_format,
        settings.composite_alpha
      );
      return Ok(false);
    }
    self.settings = settings;
    self.recreate(instance, device, window_size)?;
    Ok(true)
  }

  pub fn settings(&self) -> SwapchainSettings {
    self.settings
  }

  pub fn handle(&self) -> vk::SwapchainKHR {
    self.handle
  }

  pub fn is_minimized(&self) -> bool {
    self.handle == vk::SwapchainKHR::null()
  }

  pub fn extent(&self) -> vk::Extent2D {
    self.extent
  }

  pub fn depth_format(&self) -> vk::Format {
    self.settings.depth_format
  }

  pub fn images(&self) -> &[SwapchainImage] {
    &self.images
  }

  pub fn render_pass(&self) -> vk::RenderPass {
    self.render_pass
  }

  pub fn depth_backing(&self) -> DepthBacking {
    self.depth_backing
  }

  /// Bumped every time a chain is built, including the null chain of a minimized window.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  /// True once after each resize notification.
  pub fn is_stale(&self) -> bool {
    self.stale.get()
  }

  pub fn take_stale(&self) -> bool {
    self.stale.replace(false)
  }

  fn build<I, D>(
    &mut self,
    instance: &I,
    device: &GpuDevice<D>,
    window_size: RenderSize,
    old: vk::SwapchainKHR,
  ) -> Result<(), DeviceError>
  where
    I: InstanceApi,
    D: DeviceApi,
  {
    self.generation += 1;
    let created = self.create_handle(instance, device, window_size, old);
    // retired either way
    if old != vk::SwapchainKHR::null() {
      device.raw().destroy_swapchain(old);
    }
    self.handle = created?;

    if self.handle == vk::SwapchainKHR::null() {
      info!("vk: surface is {}x{}, swapchain left null", self.extent.width, self.extent.height);
      return Ok(());
    }

    self.create_color_views(device)?;
    self.create_depth_images(device)?;
    self.create_render_pass(device)?;
    self.create_framebuffers(device)?;

    info!(
      "vk: swapchain #{} ready ({}x{}, {} images, fmt {:?}/{:?}, present {:?}, depth {:?} {:?})",
      self.generation,
      self.extent.width,
      self.extent.height,
      self.images.len(),
      self.settings.image_format,
      self.settings.color_space,
      self.settings.present_mode,
      self.settings.depth_format,
      self.depth_backing
    );
    Ok(())
  }

  fn create_handle<I, D>(
    &mut self,
    instance: &I,
    device: &GpuDevice<D>,
    window_size: RenderSize,
    old: vk::SwapchainKHR,
  ) -> Result<vk::SwapchainKHR, DeviceError>
  where
    I: InstanceApi,
    D: DeviceApi,
  {
    let surface = instance.surface();
    let caps = instance
      .surface_capabilities(device.physical(), surface)
      .map_err(DeviceError::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

    self.extent = extent_from_caps(&caps, window_size);
    if self.extent.width == 0 || self.extent.height == 0 {
      return Ok(vk::SwapchainKHR::null());
    }

    let (sharing_mode, families) = sharing(device.queue_family_indices());
    let info = vk::SwapchainCreateInfoKHR {
      s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
      surface,
      min_image_count: image_count(&caps),
      image_format: self.settings.image_format,
      image_color_space: self.settings.color_space,
      image_extent: self.extent,
      image_array_layers: 1,
      image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
      image_sharing_mode: sharing_mode,
      queue_family_index_count: families.len() as u32,
      p_queue_family_indices: families.as_ptr(),
      pre_transform: caps.current_transform,
      composite_alpha: self.settings.composite_alpha,
      present_mode: self.settings.present_mode,
      clipped: if self.settings.clipped { vk::TRUE } else { vk::FALSE },
      old_swapchain: old,
      ..Default::default()
    };

    debug!("vk: creating swapchain (min images {}, sharing {:?}, old {:?})", info.min_image_count, sharing_mode, old);
    device.raw().create_swapchain(&info).map_err(DeviceError::vk("vkCreateSwapchainKHR"))
  }

  fn create_color_views<D: DeviceApi>(&mut self, device: &GpuDevice<D>) -> Result<(), DeviceError> {
    let images = device
      .raw()
      .swapchain_images(self.handle)
      .map_err(DeviceError::vk("vkGetSwapchainImagesKHR"))?;
    self.images = images.into_iter().map(|image| SwapchainImage { image, ..Default::default() }).collect();

    let format = self.settings.image_format;
    for img in &mut self.images {
      img.view = create_view(device, img.image, format, vk::ImageAspectFlags::COLOR)?;
    }
    Ok(())
  }

  fn create_depth_images<D: DeviceApi>(&mut self, device: &GpuDevice<D>) -> Result<(), DeviceError> {
    if self.images.is_empty() {
      return Ok(());
    }
    let depth_format = self.settings.depth_format;
    let (sharing_mode, families) = sharing(device.queue_family_indices());

    let image_info = vk::ImageCreateInfo {
      s_type: vk::StructureType::IMAGE_CREATE_INFO,
      image_type: vk::ImageType::TYPE_2D,
      format: depth_format,
      extent: vk::Extent3D { width: self.extent.width, height: self.extent.height, depth: 1 },
      mip_levels: 1,
      array_layers: 1,
      samples: vk::SampleCountFlags::TYPE_1,
      tiling: vk::ImageTiling::OPTIMAL,
      usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
      sharing_mode,
      queue_family_index_count: families.len() as u32,
      p_queue_family_indices: families.as_ptr(),
      initial_layout: vk::ImageLayout::UNDEFINED,
      ..Default::default()
    };
    for img in &mut self.images {
      img.depth_image = device.raw().create_image(&image_info).map_err(DeviceError::vk("vkCreateImage"))?;
    }

    // one representative image stands in for all of them
    let caps = device.memory_caps();
    let reqs = device.raw().image_memory_requirements(self.images[0].depth_image, caps.dedicated_allocation);
    let size = reqs.requirements.size;

    if reqs.wants_dedicated() {
      self.depth_backing = DepthBacking::Dedicated;
      for img in &mut self.images {
        img.depth_memory = device.allocate(&reqs.requirements, MemoryUsage::Gpu, Some(DedicatedTarget::Image(img.depth_image)))?;
      }
    } else {
      let layout = SharedLayout::new(size, reqs.requirements.alignment, self.images.len() as u32);
      let block_reqs = vk::MemoryRequirements { size: layout.total_size(), ..reqs.requirements };
      let block = device.allocate(&block_reqs, MemoryUsage::Gpu, None)?;
      self.depth_backing = DepthBacking::Shared(block.memory);
      for (i, img) in self.images.iter_mut().enumerate() {
        img.depth_memory = MemoryRange { memory: block.memory, offset: layout.offset(i as u32), size };
      }
    }

    let binds: Vec<ImageBind> = self
      .images
      .iter()
      .map(|img| ImageBind { image: img.depth_image, memory: img.depth_memory.memory, offset: img.depth_memory.offset })
      .collect();
    device.bind_images(&binds)?;

    let aspect = depth_aspect(depth_format);
    for img in &mut self.images {
      img.depth_view = create_view(device, img.depth_image, depth_format, aspect)?;
    }
    Ok(())
  }

  fn create_render_pass<D: DeviceApi>(&mut self, device: &GpuDevice<D>) -> Result<(), DeviceError> {
    let attachments = [
      vk::AttachmentDescription {
        format: self.settings.image_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
      },
      vk::AttachmentDescription {
        format: self.settings.depth_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
      },
    ];
    let color_ref = vk::AttachmentReference { attachment: 0, layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL };
    let depth_ref = vk::AttachmentReference { attachment: 1, layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL };

    let subpass = vk::SubpassDescription {
      pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
      color_attachment_count: 1,
      p_color_attachments: &color_ref,
      p_depth_stencil_attachment: &depth_ref,
      ..Default::default()
    };

    let rp_info = vk::RenderPassCreateInfo {
      s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
      attachment_count: attachments.len() as u32,
      p_attachments: attachments.as_ptr(),
      subpass_count: 1,
      p_subpasses: &subpass,
      ..Default::default()
    };
    self.render_pass = device.raw().create_render_pass(&rp_info).map_err(DeviceError::vk("vkCreateRenderPass"))?;
    Ok(())
  }

  fn create_framebuffers<D: DeviceApi>(&mut self, device: &GpuDevice<D>) -> Result<(), DeviceError> {
    for img in &mut self.images {
      let views = [img.view, img.depth_view];
      let fb_info = vk::FramebufferCreateInfo {
        s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
        render_pass: self.render_pass,
        attachment_count: views.len() as u32,
        p_attachments: views.as_ptr(),
        width: self.extent.width,
        height: self.extent.height,
        layers: 1,
        ..Default::default()
      };
      img.framebuffer = device.raw().create_framebuffer(&fb_info).map_err(DeviceError::vk("vkCreateFramebuffer"))?;
    }
    Ok(())
  }

  /// Frees everything but the swapchain handle. Safe on partially built chains.
  fn release_images<D: DeviceApi>(&mut self, device: &GpuDevice<D>) {
    let raw = device.raw();
    for img in &self.images {
      raw.destroy_framebuffer(img.framebuffer);
      raw.destroy_image_view(img.depth_view);
      raw.destroy_image(img.depth_image);
      raw.destroy_image_view(img.view);
    }
    match std::mem::replace(&mut self.depth_backing, DepthBacking::None) {
      DepthBacking::Shared(memory) => raw.free_memory(memory),
      DepthBacking::Dedicated => {
        for img in &self.images {
          device.free(&img.depth_memory);
        }
      }
      DepthBacking::None => {}
    }
    self.images.clear();
    raw.destroy_render_pass(self.render_pass);
    self.render_pass = vk::RenderPass::null();
  }
}

fn create_view<D: DeviceApi>(
  device: &GpuDevice<D>,
  image: vk::Image,
  format: vk::Format,
  aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView, DeviceError> {
  let info = vk::ImageViewCreateInfo {
    s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
    image,
    view_type: vk::ImageViewType::TYPE_2D,
    format,
    subresource_range: vk::ImageSubresourceRange {
      aspect_mask,
      base_mip_level: 0,
      level_count: 1,
      base_array_layer: 0,
      layer_count: 1,
    },
    ..Default::default()
  };
  device.raw().create_image_view(&info).map_err(DeviceError::vk("vkCreateImageView"))
}
