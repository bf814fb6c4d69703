// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;

use ash::vk;
use tracing::warn;

use crate::driver::{DeviceApi, InstanceApi, QueueRequest};

/// Queue family chosen for each role. `None` means no family; transfer and compute
/// may stay unset, in which case the graphics queue serves that role.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
  pub graphics: Option<u32>,
  pub present: Option<u32>,
  pub transfer: Option<u32>,
  pub compute: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
  Graphics,
  Present,
  Transfer,
  Compute,
}

impl QueueRole {
  pub const ALL: [QueueRole; 4] = [QueueRole::Graphics, QueueRole::Present, QueueRole::Transfer, QueueRole::Compute];
}

impl QueueFamilyIndices {
  pub fn get(&self, role: QueueRole) -> Option<u32> {
    match role {
      QueueRole::Graphics => self.graphics,
      QueueRole::Present => self.present,
      QueueRole::Transfer => self.transfer,
      QueueRole::Compute => self.compute,
    }
  }

  /// Graphics and present both resolved.
  pub fn is_complete(&self) -> bool {
    self.graphics.is_some() && self.present.is_some()
  }

  pub fn shares_graphics_present(&self) -> bool {
    self.graphics.is_some() && self.graphics == self.present
  }

  fn is_dedicated(&self, idx: Option<u32>) -> bool {
    idx.is_some() && idx != self.graphics && idx != self.present
  }

  pub fn has_dedicated_transfer(&self) -> bool {
    self.is_dedicated(self.transfer)
  }

  pub fn has_dedicated_compute(&self) -> bool {
    self.is_dedicated(self.compute)
  }
}

/// What the resolver needs to know about one family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FamilyInfo {
  pub flags: vk::QueueFlags,
  pub queue_count: u32,
  pub present: bool,
}

impl FamilyInfo {
  fn has(&self, flag: vk::QueueFlags) -> bool {
    self.flags.contains(flag)
  }
}

/// Family table with per-family presentation support for `surface`. A failed support query counts as
/// "cannot present".
pub fn query_families<I: InstanceApi>(
  instance: &I,
  pd: vk::PhysicalDevice,
  surface: vk::SurfaceKHR,
) -> Vec<FamilyInfo> {
  instance
    .queue_families(pd)
    .iter()
    .enumerate()
    .map(|(i, q)| {
      let present = instance.surface_support(pd, i as u32, surface).unwrap_or_else(|e| {
        warn!("surface support query failed for family {}: {:?}", i, e);
        false
      });
      FamilyInfo { flags: q.queue_flags, queue_count: q.queue_count, present }
    })
    .collect()
}

pub fn resolve(families: &[FamilyInfo]) -> QueueFamilyIndices {
  let mut out = QueueFamilyIndices::default();

  // graphics + present on one family if possible, first graphics family otherwise
  for (i, f) in families.iter().enumerate() {
    if !f.has(vk::QueueFlags::GRAPHICS) {
      continue;
    }
    if f.present {
      out.graphics = Some(i as u32);
      out.present = Some(i as u32);
      break;
    }
    out.graphics.get_or_insert(i as u32);
  }

  // graphics families were all checked above, none of them present
  if out.present.is_none() {
    out.present = families
      .iter()
      .position(|f| !f.has(vk::QueueFlags::GRAPHICS) && f.present)
      .map(|i| i as u32);
  }

  for (i, f) in families.iter().enumerate() {
    let i = i as u32;
    if Some(i) == out.graphics || Some(i) == out.present {
      continue;
    }
    if out.compute.is_none() && f.has(vk::QueueFlags::COMPUTE) {
      out.compute = Some(i);
    }
    if out.transfer.is_none() && f.has(vk::QueueFlags::TRANSFER) {
      out.transfer = Some(i);
    }
    if out.compute.is_some() && out.transfer.is_some() {
      break;
    }
  }

  let capable = |idx: Option<u32>, flag: vk::QueueFlags| {
    idx.filter(|&i| families.get(i as usize).is_some_and(|f| f.has(flag)))
  };

  if out.compute.is_none() {
    out.compute = capable(out.graphics, vk::QueueFlags::COMPUTE)
      .or_else(|| capable(out.present, vk::QueueFlags::COMPUTE));
  }
  if out.transfer.is_none() {
    out.transfer = capable(out.compute, vk::QueueFlags::TRANSFER)
      .or_else(|| capable(out.graphics, vk::QueueFlags::TRANSFER))
      .or_else(|| capable(out.present, vk::QueueFlags::TRANSFER));
  }

  out
}

/// One request per distinct family, asking for as many queues as roles land on it, capped by
/// what the family offers. Requests come out in role order.
pub fn plan_queue_requests(indices: &QueueFamilyIndices, families: &[FamilyInfo]) -> Vec<QueueRequest> {
  let mut plan: Vec<QueueRequest> = Vec::with_capacity(4);
  for role in QueueRole::ALL {
    let Some(family) = indices.get(role) else { continue };
    match plan.iter_mut().find(|r| r.family == family) {
      Some(req) => req.count += 1,
      None => plan.push(QueueRequest { family, count: 1 }),
    }
  }
  for req in &mut plan {
    let available = families.get(req.family as usize).map_or(1, |f| f.queue_count.max(1));
    req.count = req.count.min(available);
  }
  plan
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Queues {
  pub graphics: Option<vk::Queue>,
  pub present: Option<vk::Queue>,
  pub transfer: Option<vk::Queue>,
  pub compute: Option<vk::Queue>,
}

impl Queues {
  pub fn get(&self, role: QueueRole) -> Option<vk::Queue> {
    match role {
      QueueRole::Graphics => self.graphics,
      QueueRole::Present => self.present,
      QueueRole::Transfer => self.transfer,
      QueueRole::Compute => self.compute,
    }
  }

  fn slot(&mut self, role: QueueRole) -> &mut Option<vk::Queue> {
    match role {
      QueueRole::Graphics => &mut self.graphics,
      QueueRole::Present => &mut self.present,
      QueueRole::Transfer => &mut self.transfer,
      QueueRole::Compute => &mut self.compute,
    }
  }
}

/// Queue index each role gets inside its family. Counts down from the allocated count so roles on a
/// family with enough queues get distinct queues; once the counter hits 0 further roles share queue 0.
pub fn queue_slots(indices: &QueueFamilyIndices, plan: &[QueueRequest]) -> Vec<(QueueRole, u32, u32)> {
  let mut next: HashMap<u32, u32> = plan.iter().map(|r| (r.family, r.count)).collect();
  let mut slots = Vec::with_capacity(4);
  for role in QueueRole::ALL {
    let Some(family) = indices.get(role) else { continue };
    let counter = next.entry(family).or_insert(1);
    *counter -= (*counter != 0) as u32;
    slots.push((role, family, *counter));
  }
  slots
}

pub fn retrieve_queues<D: DeviceApi>(device: &D, indices: &QueueFamilyIndices, plan: &[QueueRequest]) -> Queues {
  let mut queues = Queues::default();
  for (role, family, index) in queue_slots(indices, plan) {
    *queues.slot(role) = Some(device.get_queue(family, index));
  }
  queues
}
