// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use kiln_render::{RenderSize, ResizeEvent, WindowSource};
use tracing::info;

pub use winit;

use winit::{
    dpi::PhysicalSize,
    event_loop::ActiveEventLoop,
    raw_window_handle::{
        DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
    },
    window::{Window, WindowId},
};

/// A winit window paired with the resize subscription the renderer listens on.
pub struct PlatformWindow {
    window: Window,
    resize: ResizeEvent,
}

impl PlatformWindow {
    pub fn create(event_loop: &ActiveEventLoop, title: &str, size: RenderSize) -> Result<Self> {
        let attrs = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(size.width.max(1), size.height.max(1)));
        let window = event_loop.create_window(attrs).context("create_window")?;
        let inner = window.inner_size();
        info!("window \"{}\" created ({}x{})", title, inner.width, inner.height);
        Ok(Self {
            window,
            resize: ResizeEvent::new(),
        })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Fires the resize subscription. Call from the event loop thread.
    pub fn notify_resized(&self) {
        self.resize.emit();
    }
}

impl WindowSource for PlatformWindow {
    fn pixel_size(&self) -> RenderSize {
        let s = self.window.inner_size();
        RenderSize {
            width: s.width,
            height: s.height,
        }
    }

    fn resize_event(&self) -> &ResizeEvent {
        &self.resize
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}
