// SPDX-License-Identifier: CEPL-1.0
use std::ffi::CStr;

use ash::khr::{bind_memory2, dedicated_allocation, get_memory_requirements2, swapchain, synchronization2};
use ash::vk;
use tracing::{debug, info, warn};

use crate::driver::{has_extension, InstanceApi};
use crate::error::DeviceError;
use crate::queue::{self, FamilyInfo, QueueFamilyIndices};

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] =
  [vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT];

/// Weights used to rank physical devices. A disqualified device always scores 0; every
/// qualified device scores at least 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoringPolicy {
  pub version_major_weight: u32,
  pub version_minor_weight: u32,
  pub discrete_bonus: u32,
  pub optional_extension_bonus: u32,
  pub dedicated_transfer_bonus: u32,
  pub dedicated_compute_bonus: u32,
  pub shared_graphics_present_bonus: u32,
}

impl Default for ScoringPolicy {
  fn default() -> Self {
    Self {
      version_major_weight: 8,
      version_minor_weight: 1,
      discrete_bonus: 128,
      optional_extension_bonus: 8,
      dedicated_transfer_bonus: 8,
      dedicated_compute_bonus: 8,
      shared_graphics_present_bonus: 16,
    }
  }
}

/// The facts about a qualified device that feed its score.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceTraits {
  pub api_version: u32,
  pub discrete: bool,
  pub optional_extensions: u32,
  pub dedicated_transfer: bool,
  pub dedicated_compute: bool,
  pub shared_graphics_present: bool,
}

impl ScoringPolicy {
  pub fn score(&self, t: &DeviceTraits) -> u32 {
    let bonus = |on: bool, value: u32| if on { value } else { 0 };
    1u32
      .saturating_add(vk::api_version_major(t.api_version).saturating_mul(self.version_major_weight))
      .saturating_add(vk::api_version_minor(t.api_version).saturating_mul(self.version_minor_weight))
      .saturating_add(bonus(t.discrete, self.discrete_bonus))
      .saturating_add(t.optional_extensions.saturating_mul(self.optional_extension_bonus))
      .saturating_add(bonus(t.dedicated_transfer, self.dedicated_transfer_bonus))
      .saturating_add(bonus(t.dedicated_compute, self.dedicated_compute_bonus))
      .saturating_add(bonus(t.shared_graphics_present, self.shared_graphics_present_bonus))
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRequirements {
  pub required: Vec<&'static CStr>,
  pub optional: Vec<&'static CStr>,
}

impl Default for DeviceRequirements {
  fn default() -> Self {
    Self {
      required: vec![swapchain::NAME],
      optional: vec![
        get_memory_requirements2::NAME,
        dedicated_allocation::NAME,
        bind_memory2::NAME,
        synchronization2::NAME,
      ],
    }
  }
}

/// Result of checking one physical device.
#[derive(Clone, Debug)]
pub struct Evaluation {
  pub physical: vk::PhysicalDevice,
  pub name: String,
  pub score: u32,
  pub indices: QueueFamilyIndices,
  pub families: Vec<FamilyInfo>,
  /// Required plus supported optional extensions.
  pub extensions: Vec<&'static CStr>,
  pub depth_format: Option<vk::Format>,
}

pub fn find_supported_format<I: InstanceApi>(
  instance: &I,
  pd: vk::PhysicalDevice,
  candidates: &[vk::Format],
  tiling: vk::ImageTiling,
  features: vk::FormatFeatureFlags,
) -> Option<vk::Format> {
  candidates.iter().copied().find(|&format| {
    let props = instance.format_properties(pd, format);
    let have = match tiling {
      vk::ImageTiling::LINEAR => props.linear_tiling_features,
      vk::ImageTiling::OPTIMAL => props.optimal_tiling_features,
      _ => vk::FormatFeatureFlags::empty(),
    };
    have.contains(features)
  })
}

pub fn find_depth_format<I: InstanceApi>(instance: &I, pd: vk::PhysicalDevice) -> Option<vk::Format> {
  find_supported_format(
    instance,
    pd,
    &DEPTH_FORMAT_CANDIDATES,
    vk::ImageTiling::OPTIMAL,
    vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
  )
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
  props
    .device_name_as_c_str()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default()
}

/// Scores one device. Disqualified devices come back with score 0 and the reason logged.
pub fn evaluate<I: InstanceApi>(
  instance: &I,
  pd: vk::PhysicalDevice,
  reqs: &DeviceRequirements,
  policy: &ScoringPolicy,
) -> Evaluation {
  let props = instance.properties(pd);
  let mut eval = Evaluation {
    physical: pd,
    name: device_name(&props),
    score: 0,
    indices: QueueFamilyIndices::default(),
    families: Vec::new(),
    extensions: Vec::new(),
    depth_format: None,
  };

  match assess(instance, pd, &props, reqs, &mut eval) {
    Ok(traits) => eval.score = policy.score(&traits),
    Err(reason) => debug!("gpu \"{}\" disqualified: {}", eval.name, reason),
  }
  eval
}

fn assess<I: InstanceApi>(
  instance: &I,
  pd: vk::PhysicalDevice,
  props: &vk::PhysicalDeviceProperties,
  reqs: &DeviceRequirements,
  eval: &mut Evaluation,
) -> Result<DeviceTraits, &'static str> {
  let available = instance.device_extensions(pd).map_err(|_| "extension query failed")?;
  if !reqs.required.iter().all(|e| has_extension(&available, e)) {
    return Err("missing a required extension");
  }
  let optional: Vec<&'static CStr> =
    reqs.optional.iter().copied().filter(|e| has_extension(&available, e)).collect();

  let surface = instance.surface();
  let formats = instance.surface_formats(pd, surface).unwrap_or_default();
  let modes = instance.present_modes(pd, surface).unwrap_or_default();
  if formats.is_empty() || modes.is_empty() {
    return Err("no surface formats or present modes");
  }

  eval.depth_format = find_depth_format(instance, pd);
  if eval.depth_format.is_none() {
    return Err("no depth-stencil attachment format");
  }

  eval.families = queue::query_families(instance, pd, surface);
  eval.indices = queue::resolve(&eval.families);
  if !eval.indices.is_complete() {
    return Err("no graphics or no present queue family");
  }

  eval.extensions = reqs.required.iter().copied().chain(optional.iter().copied()).collect();

  Ok(DeviceTraits {
    api_version: props.api_version,
    discrete: props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU,
    optional_extensions: optional.len() as u32,
    dedicated_transfer: eval.indices.has_dedicated_transfer(),
    dedicated_compute: eval.indices.has_dedicated_compute(),
    shared_graphics_present: eval.indices.shares_graphics_present(),
  })
}

/// Highest score wins; ties keep the earlier device.
pub fn select_device<I: InstanceApi>(
  instance: &I,
  reqs: &DeviceRequirements,
  policy: &ScoringPolicy,
) -> Result<Evaluation, DeviceError> {
  let devices = instance
    .physical_devices()
    .map_err(|result| DeviceError::Vk { op: "vkEnumeratePhysicalDevices", result })?;
  if devices.is_empty() {
    warn!("vk: instance reports no physical devices");
  }

  let mut best: Option<Evaluation> = None;
  for pd in devices {
    let eval = evaluate(instance, pd, reqs, policy);
    info!("gpu candidate \"{}\" score={}", eval.name, eval.score);
    if eval.score > best.as_ref().map_or(0, |b| b.score) {
      best = Some(eval);
    }
  }

  best.ok_or(DeviceError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{FakeGpu, FakeInstance};

  #[test]
  fn default_policy_matches_documented_weights() {
    let p = ScoringPolicy::default();
    let t = DeviceTraits {
      api_version: vk::make_api_version(0, 1, 3, 0),
      discrete: true,
      optional_extensions: 3,
      dedicated_transfer: true,
      dedicated_compute: false,
      shared_graphics_present: true,
    };
    // 1 + (8 + 3) + 128 + 24 + 8 + 16
    assert_eq!(p.score(&t), 188);
    assert_eq!(p.score(&DeviceTraits::default()), 1);
  }

  #[test]
  fn score_is_monotonic_in_each_trait() {
    let p = ScoringPolicy::default();
    for minor in 0..4 {
      for exts in 0..4 {
        for flags in 0u8..16 {
          let base = DeviceTraits {
            api_version: vk::make_api_version(0, 1, minor, 0),
            discrete: flags & 1 != 0,
            optional_extensions: exts,
            dedicated_transfer: flags & 2 != 0,
            dedicated_compute: flags & 4 != 0,
            shared_graphics_present: flags & 8 != 0,
          };
          let s = p.score(&base);
          assert!(p.score(&DeviceTraits { discrete: true, ..base }) >= s);
          assert!(p.score(&DeviceTraits { optional_extensions: exts + 1, ..base }) > s);
          assert!(p.score(&DeviceTraits { api_version: vk::make_api_version(0, 1, minor + 1, 0), ..base }) > s);
          assert!(p.score(&DeviceTraits { api_version: vk::make_api_version(0, 2, 0, 0), ..base }) > s);
        }
      }
    }
  }

  #[test]
  fn custom_policy_changes_the_winner() {
    let discrete = FakeGpu::discrete();
    let mut integrated = FakeGpu::integrated();
    integrated.all_optional_extensions();
    let inst = FakeInstance::new(vec![discrete, integrated]);

    let reqs = DeviceRequirements::default();
    let picked = select_device(&inst, &reqs, &ScoringPolicy::default()).unwrap();
    assert_eq!(picked.physical, inst.handle(0));

    let flat = ScoringPolicy { discrete_bonus: 0, ..ScoringPolicy::default() };
    let picked = select_device(&inst, &reqs, &flat).unwrap();
    assert_eq!(picked.physical, inst.handle(1));
  }

  #[test]
  fn ties_keep_the_first_device() {
    let inst = FakeInstance::new(vec![FakeGpu::integrated(), FakeGpu::integrated()]);
    let picked = select_device(&inst, &DeviceRequirements::default(), &ScoringPolicy::default()).unwrap();
    assert_eq!(picked.physical, inst.handle(0));
  }

  #[test]
  fn disqualifications_score_zero() {
    let mut no_swapchain = FakeGpu::discrete();
    no_swapchain.extensions.clear();

    let mut no_depth = FakeGpu::discrete();
    no_depth.depth_formats.clear();

    let mut no_formats = FakeGpu::discrete();
    no_formats.surface_formats.clear();

    let mut no_present = FakeGpu::discrete();
    for f in &mut no_present.families {
      f.2 = false;
    }

    let inst = FakeInstance::new(vec![no_swapchain, no_depth, no_formats, no_present]);
    let reqs = DeviceRequirements::default();
    let policy = ScoringPolicy::default();
    for i in 0..4 {
      assert_eq!(evaluate(&inst, inst.handle(i), &reqs, &policy).score, 0, "device {i}");
    }
    assert_eq!(select_device(&inst, &reqs, &policy).unwrap_err(), DeviceError::NoSuitableDevice);
  }

  #[test]
  fn empty_instance_has_no_device() {
    let inst = FakeInstance::new(vec![]);
    let err = select_device(&inst, &DeviceRequirements::default(), &ScoringPolicy::default()).unwrap_err();
    assert_eq!(err, DeviceError::NoSuitableDevice);
  }

  #[test]
  fn depth_search_respects_priority_order() {
    let mut gpu = FakeGpu::discrete();
    gpu.depth_formats = vec![vk::Format::D24_UNORM_S8_UINT];
    let inst = FakeInstance::new(vec![gpu]);
    assert_eq!(find_depth_format(&inst, inst.handle(0)), Some(vk::Format::D24_UNORM_S8_UINT));

    let mut gpu = FakeGpu::discrete();
    gpu.depth_formats = vec![vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT_S8_UINT];
    let inst = FakeInstance::new(vec![gpu]);
    assert_eq!(find_depth_format(&inst, inst.handle(0)), Some(vk::Format::D32_SFLOAT_S8_UINT));
  }

  #[test]
  fn linear_tiling_is_checked_separately() {
    let inst = FakeInstance::new(vec![FakeGpu::discrete()]);
    let found = find_supported_format(
      &inst,
      inst.handle(0),
      &DEPTH_FORMAT_CANDIDATES,
      vk::ImageTiling::LINEAR,
      vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    );
    assert_eq!(found, None);
  }

  #[test]
  fn enabled_extensions_are_required_plus_supported_optional() {
    let mut gpu = FakeGpu::discrete();
    gpu.extensions.push(bind_memory2::NAME.to_owned());
    let inst = FakeInstance::new(vec![gpu]);
    let eval = evaluate(&inst, inst.handle(0), &DeviceRequirements::default(), &ScoringPolicy::default());
    assert_eq!(eval.extensions, vec![swapchain::NAME, bind_memory2::NAME]);
  }
}
