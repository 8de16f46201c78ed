//! Windows and their input event queues.

use alloc::vec;
use alloc::vec::Vec;

use planck_noalloc::ringbuf::RingBuf;

/// Events a window queue holds before the oldest is dropped.
pub const EVENT_QUEUE_CAPACITY: usize = 20;

/// Height of the draggable title-bar strip, in pixels.
pub const TITLE_BAR_HEIGHT: i32 = 22;

/// A window identifier. 0 is "no window".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u32);

/// A keyboard event as routed to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardEvent {
    /// The decoded key (ASCII for printable keys).
    pub key: u8,
    /// Press or release.
    pub pressed: bool,
    /// Whether an Alt modifier was held.
    pub alt_down: bool,
}

/// A mouse event in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    /// Cursor X after the movement.
    pub x: i32,
    /// Cursor Y after the movement.
    pub y: i32,
    /// Left button state.
    pub left_down: bool,
    /// Right button state.
    pub right_down: bool,
}

/// One window: geometry, pixel content, and bounded input queues.
pub struct Window {
    /// Identifier, stable for the window's lifetime.
    pub id: WindowId,
    /// Z position; higher is closer to the viewer.
    pub z: i32,
    /// Left edge in screen coordinates (may be negative while dragged).
    pub x: i32,
    /// Top edge in screen coordinates.
    pub y: i32,
    /// Content width in pixels.
    pub width: u32,
    /// Content height in pixels.
    pub height: u32,
    /// Row-major RGB0 content.
    pub pixels: Vec<u32>,
    /// Hidden windows are skipped by compositing and hit testing.
    pub visible: bool,
    /// Whether the title bar accepts dragging.
    pub movable: bool,
    keyboard_queue: RingBuf<KeyboardEvent, { EVENT_QUEUE_CAPACITY + 1 }>,
    mouse_queue: RingBuf<MouseEvent, { EVENT_QUEUE_CAPACITY + 1 }>,
}

impl Window {
    /// Creates a visible, movable window with black content.
    #[must_use]
    pub fn new(id: WindowId, x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            id,
            z: 0,
            x,
            y,
            width,
            height,
            pixels: vec![0; (width * height) as usize],
            visible: true,
            movable: true,
            keyboard_queue: RingBuf::new(),
            mouse_queue: RingBuf::new(),
        }
    }

    /// Whether the point lies inside the window bounds.
    #[must_use]
    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x
            && px < self.x + self.width as i32
            && py >= self.y
            && py < self.y + self.height as i32
    }

    /// Queues a keyboard event, dropping the oldest on overflow.
    pub fn push_keyboard_event(&mut self, event: KeyboardEvent) {
        if self.keyboard_queue.is_full() {
            let _ = self.keyboard_queue.pop();
        }
        let _ = self.keyboard_queue.try_push(event);
    }

    /// Queues a mouse event, dropping the oldest on overflow.
    pub fn push_mouse_event(&mut self, event: MouseEvent) {
        if self.mouse_queue.is_full() {
            let _ = self.mouse_queue.pop();
        }
        let _ = self.mouse_queue.try_push(event);
    }

    /// Pops the oldest queued keyboard event.
    pub fn pop_keyboard_event(&mut self) -> Option<KeyboardEvent> {
        self.keyboard_queue.pop()
    }

    /// Pops the oldest queued mouse event.
    pub fn pop_mouse_event(&mut self) -> Option<MouseEvent> {
        self.mouse_queue.pop()
    }

    /// Queued keyboard events.
    #[must_use]
    pub fn keyboard_queue_len(&self) -> usize {
        self.keyboard_queue.len()
    }

    /// Queued mouse events.
    #[must_use]
    pub fn mouse_queue_len(&self) -> usize {
        self.mouse_queue.len()
    }
}
