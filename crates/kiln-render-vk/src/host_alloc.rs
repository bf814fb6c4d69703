// SPDX-License-Identifier: CEPL-1.0
//! Host allocation callbacks handed to every Vulkan create/destroy call made by this crate.
//!
//! Each block carries a small header in front of the pointer returned to the driver recording
//! the requested size and alignment, so free and realloc can rebuild the `Layout`.
use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ptr;

use ash::vk;
use portable_atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostUsage {
  RendererBackend,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
  pub live_bytes: usize,
  pub peak_bytes: usize,
  pub allocations: usize,
}

struct UsageCounter {
  live: AtomicUsize,
  peak: AtomicUsize,
  allocations: AtomicUsize,
}

impl UsageCounter {
  const fn new() -> Self {
    Self { live: AtomicUsize::new(0), peak: AtomicUsize::new(0), allocations: AtomicUsize::new(0) }
  }

  fn add(&self, bytes: usize) {
    let live = self.live.fetch_add(bytes, Ordering::Relaxed) + bytes;
    self.peak.fetch_max(live, Ordering::Relaxed);
    self.allocations.fetch_add(1, Ordering::Relaxed);
  }

  fn sub(&self, bytes: usize) {
    self.live.fetch_sub(bytes, Ordering::Relaxed);
    self.allocations.fetch_sub(1, Ordering::Relaxed);
  }
}

static RENDERER_BACKEND: UsageCounter = UsageCounter::new();

fn counter(usage: HostUsage) -> &'static UsageCounter {
  match usage {
    HostUsage::RendererBackend => &RENDERER_BACKEND,
  }
}

pub fn usage(category: HostUsage) -> UsageSnapshot {
  let c = counter(category);
  UsageSnapshot {
    live_bytes: c.live.load(Ordering::Relaxed),
    peak_bytes: c.peak.load(Ordering::Relaxed),
    allocations: c.allocations.load(Ordering::Relaxed),
  }
}

/// The callback set for a category. The returned struct only points at statics.
pub fn callbacks(category: HostUsage) -> vk::AllocationCallbacks<'static> {
  vk::AllocationCallbacks {
    p_user_data: counter(category) as *const UsageCounter as *mut c_void,
    pfn_allocation: Some(vk_alloc),
    pfn_reallocation: Some(vk_realloc),
    pfn_free: Some(vk_free),
    pfn_internal_allocation: None,
    pfn_internal_free: None,
    ..Default::default()
  }
}

#[repr(C)]
struct Header {
  size: usize,
  align: usize,
}

const HEADER: usize = std::mem::size_of::<Header>();

// Distance from the start of the real block to the pointer handed out.
fn prefix(align: usize) -> usize {
  align.max(HEADER)
}

fn layout_for(size: usize, align: usize) -> Option<Layout> {
  let align = align.max(std::mem::align_of::<Header>());
  Layout::from_size_align(size.checked_add(prefix(align))?, align).ok()
}

unsafe fn alloc_block(user: *mut c_void, size: usize, align: usize) -> *mut c_void {
  if size == 0 || !align.is_power_of_two() {
    return ptr::null_mut();
  }
  let Some(layout) = layout_for(size, align) else { return ptr::null_mut() };
  let base = unsafe { alloc::alloc(layout) };
  if base.is_null() {
    return ptr::null_mut();
  }
  let align = layout.align();
  unsafe {
    let user_ptr = base.add(prefix(align));
    (user_ptr.sub(HEADER) as *mut Header).write(Header { size, align });
    if let Some(c) = (user as *const UsageCounter).as_ref() {
      c.add(size);
    }
    user_ptr as *mut c_void
  }
}

unsafe fn free_block(user: *mut c_void, memory: *mut c_void) {
  if memory.is_null() {
    return;
  }
  unsafe {
    let user_ptr = memory as *mut u8;
    let Header { size, align } = (user_ptr.sub(HEADER) as *const Header).read();
    if let Some(c) = (user as *const UsageCounter).as_ref() {
      c.sub(size);
    }
    if let Some(layout) = layout_for(size, align) {
      alloc::dealloc(user_ptr.sub(prefix(align)), layout);
    }
  }
}

unsafe extern "system" fn vk_alloc(
  user: *mut c_void,
  size: usize,
  align: usize,
  _scope: vk::SystemAllocationScope,
) -> *mut c_void {
  unsafe { alloc_block(user, size, align) }
}

unsafe extern "system" fn vk_realloc(
  user: *mut c_void,
  original: *mut c_void,
  size: usize,
  align: usize,
  _scope: vk::SystemAllocationScope,
) -> *mut c_void {
  if original.is_null() {
    return unsafe { alloc_block(user, size, align) };
  }
  if size == 0 {
    unsafe { free_block(user, original) };
    return ptr::null_mut();
  }
  unsafe {
    let old = ((original as *const u8).sub(HEADER) as *const Header).read();
    let fresh = alloc_block(user, size, align);
    if fresh.is_null() {
      // original stays valid on failure
      return ptr::null_mut();
    }
    ptr::copy_nonoverlapping(original as *const u8, fresh as *mut u8, old.size.min(size));
    free_block(user, original);
    fresh
  }
}

unsafe extern "system" fn vk_free(user: *mut c_void, memory: *mut c_void) {
  unsafe { free_block(user, memory) }
}
