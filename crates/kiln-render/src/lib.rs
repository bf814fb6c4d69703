// SPDX-License-Identifier: CEPL-1.0
use std::cell::{Cell, RefCell};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// The window as the renderer backend sees it: a pixel size and a resize notification.
pub trait WindowSource {
    fn pixel_size(&self) -> RenderSize;
    fn resize_event(&self) -> &ResizeEvent;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Single-threaded subscription list fired with no payload whenever the window is resized.
///
/// Listeners run in registration order on the thread that calls [`ResizeEvent::emit`]. A listener
/// must not add or remove listeners on the same event while it runs.
#[derive(Default)]
pub struct ResizeEvent {
    listeners: RefCell<Vec<(ListenerId, Box<dyn FnMut()>)>>,
    next_id: Cell<u64>,
}

impl ResizeEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: impl FnMut() + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, Box::new(listener)));
        id
    }

    /// Returns false when the handle was never registered or was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn emit(&self) {
        let mut listeners = self.listeners.borrow_mut();
        tracing::debug!("resize event → {} listener(s)", listeners.len());
        for (_, listener) in listeners.iter_mut() {
            listener();
        }
    }
}
