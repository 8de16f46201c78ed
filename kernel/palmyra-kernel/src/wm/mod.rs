//! Cooperative windowing compositor.
//!
//! Z-ordered window list with one active window, click-to-focus, alt-tab
//! cycling, title-bar dragging, and a double-buffered composite pass. The
//! compositor task calls [`WindowManager::composite`] once per frame; the
//! front/back swap is bracketed by the scheduler's atomic section so no
//! yield can land mid-swap.
//!
//! Input routing: a mouse event goes to the topmost visible window under
//! the cursor, a keyboard event to the active window; events that hit no
//! window are dropped. Per-window queues are bounded and drop their oldest
//! event on overflow.

mod surface;
mod window;

pub use surface::Surface;
pub use window::{KeyboardEvent, MouseEvent, Window, WindowId, EVENT_QUEUE_CAPACITY};

use alloc::vec::Vec;

use palmyra_core::sched::AtomicSection;

use crate::wm::window::TITLE_BAR_HEIGHT;

/// Background fill color (dark gray, RGB0).
const BACKGROUND_COLOR: u32 = 0x0030_3030;
/// Cursor color.
const CURSOR_COLOR: u32 = 0x00FF_FFFF;
/// Cursor square size in pixels.
const CURSOR_SIZE: i32 = 6;
/// Pixels of a dragged window that must stay on screen.
const DRAG_KEEP_VISIBLE: i32 = 2;

/// An in-progress title-bar drag.
struct DragState {
    window: WindowId,
    offset_x: i32,
    offset_y: i32,
}

/// The window manager and compositor.
pub struct WindowManager {
    windows: Vec<Window>,
    next_id: u32,
    active: WindowId,
    sort_requested: bool,
    pending_close: Vec<WindowId>,
    drag: Option<DragState>,
    cursor_x: i32,
    cursor_y: i32,
    left_was_down: bool,
    front: Surface,
    back: Surface,
}

impl WindowManager {
    /// Creates the manager for a screen of the given size.
    #[must_use]
    pub fn new(screen_width: u32, screen_height: u32) -> Self {
        Self {
            windows: Vec::new(),
            next_id: 1,
            active: WindowId(0),
            sort_requested: false,
            pending_close: Vec::new(),
            drag: None,
            cursor_x: screen_width as i32 / 2,
            cursor_y: screen_height as i32 / 2,
            left_was_down: false,
            front: Surface::new(screen_width, screen_height),
            back: Surface::new(screen_width, screen_height),
        }
    }

    /// Creates a window and makes it active.
    pub fn create_window(&mut self, x: i32, y: i32, width: u32, height: u32) -> WindowId {
        let id = WindowId(self.next_id);
        self.next_id += 1;
        self.windows.push(Window::new(id, x, y, width, height));
        self.set_active(id);
        id
    }

    /// Marks a window for closure: invisible immediately, erased from the
    /// list on the next composite.
    pub fn close_window(&mut self, id: WindowId) {
        if let Some(window) = self.window_mut(id) {
            window.visible = false;
            self.pending_close.push(id);
        }
        if self.active == id {
            self.active = WindowId(0);
        }
    }

    /// Number of live windows (including those pending erasure).
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// The active window id (0 = none).
    #[must_use]
    pub fn active_window(&self) -> WindowId {
        self.active
    }

    /// Cursor position.
    #[must_use]
    pub fn cursor(&self) -> (i32, i32) {
        (self.cursor_x, self.cursor_y)
    }

    /// Shared access to a window.
    #[must_use]
    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.iter().find(|w| w.id == id)
    }

    /// Exclusive access to a window.
    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.iter_mut().find(|w| w.id == id)
    }

    /// The topmost visible window containing the point.
    #[must_use]
    pub fn window_at(&self, x: i32, y: i32) -> Option<WindowId> {
        self.windows
            .iter()
            .filter(|w| w.visible && w.contains(x, y))
            .max_by_key(|w| w.z)
            .map(|w| w.id)
    }

    /// Raises `id` to the top of the z order and makes it active.
    ///
    /// The active window gets the maximum z; everyone else drops one step,
    /// keeping the order dense. The actual list resort is deferred to the
    /// next composite so hit testing stays stable within a frame.
    pub fn set_active(&mut self, id: WindowId) {
        let top = self.windows.len() as i32;
        for window in &mut self.windows {
            if window.id == id {
                window.z = top;
            } else if window.z > 0 {
                window.z -= 1;
            }
        }
        if self.window(id).is_some() {
            self.active = id;
        }
        self.sort_requested = true;
    }

    /// Cycles the active window to the next visible one (alt-tab).
    pub fn cycle_active(&mut self) {
        if self.windows.is_empty() {
            self.active = WindowId(0);
            return;
        }
        let start = self
            .windows
            .iter()
            .position(|w| w.id == self.active)
            .unwrap_or(0);

        for step in 1..=self.windows.len() {
            let candidate = &self.windows[(start + step) % self.windows.len()];
            if candidate.visible {
                let id = candidate.id;
                self.set_active(id);
                return;
            }
        }
        self.active = WindowId(0);
    }

    /// Feeds a relative mouse event: moves the cursor (clamped to the
    /// screen), handles click-to-focus and title-bar dragging, and routes
    /// the event to the window under the cursor.
    pub fn handle_mouse(&mut self, delta_x: i32, delta_y: i32, left_down: bool, right_down: bool) {
        self.cursor_x = (self.cursor_x + delta_x).clamp(0, self.front.width() as i32 - 1);
        self.cursor_y = (self.cursor_y + delta_y).clamp(0, self.front.height() as i32 - 1);

        let pressed = left_down && !self.left_was_down;
        let released = !left_down && self.left_was_down;
        self.left_was_down = left_down;

        if pressed {
            self.begin_drag_or_focus();
        } else if left_down {
            self.update_drag();
        } else if released {
            self.drag = None;
        }

        // Route to the window under the cursor; no window drops the event.
        let event = MouseEvent {
            x: self.cursor_x,
            y: self.cursor_y,
            left_down,
            right_down,
        };
        if let Some(id) = self.window_at(self.cursor_x, self.cursor_y) {
            if let Some(window) = self.window_mut(id) {
                window.push_mouse_event(event);
            }
        }
    }

    /// Feeds a keyboard event: alt-tab is consumed, everything else goes to
    /// the active window (or is dropped when none is active).
    pub fn handle_key(&mut self, event: KeyboardEvent) {
        if event.key == b'\t' && event.alt_down && !event.pressed {
            self.cycle_active();
            return;
        }
        let active = self.active;
        if let Some(window) = self.window_mut(active) {
            window.push_keyboard_event(event);
        }
    }

    /// Left button press: focus the hit window, and when the press lands in
    /// the title bar of a movable window, capture a drag with the cursor
    /// offset.
    fn begin_drag_or_focus(&mut self) {
        let Some(id) = self.window_at(self.cursor_x, self.cursor_y) else {
            return;
        };
        self.set_active(id);

        let Some(window) = self.window(id) else {
            return;
        };
        if !window.movable || self.cursor_y - window.y > TITLE_BAR_HEIGHT {
            return;
        }
        self.drag = Some(DragState {
            window: id,
            offset_x: self.cursor_x - window.x,
            offset_y: self.cursor_y - window.y,
        });
    }

    /// Drag update: the window follows the cursor, clamped so at least
    /// [`DRAG_KEEP_VISIBLE`] pixels stay on screen.
    fn update_drag(&mut self) {
        let Some(drag) = self.drag.as_ref() else {
            return;
        };
        let id = drag.window;
        let new_x = self.cursor_x - drag.offset_x;
        let new_y = self.cursor_y - drag.offset_y;
        let screen_w = self.front.width() as i32;
        let screen_h = self.front.height() as i32;

        if let Some(window) = self.window_mut(id) {
            window.x = new_x.clamp(-(screen_w - DRAG_KEEP_VISIBLE), screen_w - DRAG_KEEP_VISIBLE);
            window.y = new_y.clamp(0, screen_h - DRAG_KEEP_VISIBLE);
        }
    }

    /// Renders one frame: erases closed windows, sorts by z when requested,
    /// fills the background, paints every visible window clipped to the
    /// screen, draws the cursor, and swaps the buffers inside an atomic
    /// section.
    pub fn composite(&mut self) {
        // Deferred erasure of closed windows.
        if !self.pending_close.is_empty() {
            let pending = core::mem::take(&mut self.pending_close);
            self.windows.retain(|w| !pending.contains(&w.id));
        }

        if self.sort_requested {
            self.windows.sort_by_key(|w| w.z);
            self.sort_requested = false;
        }

        self.back.fill(BACKGROUND_COLOR);
        for window in &self.windows {
            if window.visible {
                self.back.blit(
                    window.x,
                    window.y,
                    window.width,
                    window.height,
                    &window.pixels,
                );
            }
        }
        self.back.fill_rect(
            self.cursor_x,
            self.cursor_y,
            CURSOR_SIZE as u32,
            CURSOR_SIZE as u32,
            CURSOR_COLOR,
        );

        // The swap must not be interleaved with a yield.
        let _atomic = AtomicSection::enter();
        core::mem::swap(&mut self.front, &mut self.back);
    }

    /// The most recently composited frame.
    #[must_use]
    pub fn front(&self) -> &Surface {
        &self.front
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> WindowManager {
        WindowManager::new(640, 480)
    }

    #[test]
    fn create_makes_active_and_top() {
        let mut wm = manager();
        let a = wm.create_window(10, 10, 100, 100);
        let b = wm.create_window(50, 50, 100, 100);
        assert_eq!(wm.active_window(), b);
        assert!(wm.window(b).unwrap().z > wm.window(a).unwrap().z);
    }

    #[test]
    fn focus_scenario() {
        // Three windows at distinct spots; activating the oldest brings it
        // to the top of the z order and hit testing.
        let mut wm = manager();
        let a = wm.create_window(0, 0, 100, 100);
        let b = wm.create_window(200, 0, 100, 100);
        let c = wm.create_window(0, 200, 100, 100);
        let _ = (b, c);

        wm.set_active(a);
        assert_eq!(wm.active_window(), a);
        let a_z = wm.window(a).unwrap().z;
        assert!(wm.windows.iter().all(|w| w.id == a || w.z < a_z));
        assert_eq!(wm.window_at(50, 50), Some(a));
    }

    #[test]
    fn overlapping_hit_test_prefers_top() {
        let mut wm = manager();
        let bottom = wm.create_window(0, 0, 100, 100);
        let top = wm.create_window(0, 0, 100, 100);
        assert_eq!(wm.window_at(50, 50), Some(top));

        wm.set_active(bottom);
        assert_eq!(wm.window_at(50, 50), Some(bottom));
    }

    #[test]
    fn click_to_focus() {
        let mut wm = manager();
        let a = wm.create_window(0, 0, 100, 100);
        let b = wm.create_window(200, 200, 100, 100);
        assert_eq!(wm.active_window(), b);

        // Cursor starts at (320, 240); move over A and click.
        wm.handle_mouse(-300, -220, false, false);
        wm.handle_mouse(0, 0, true, false);
        assert_eq!(wm.active_window(), a);
    }

    #[test]
    fn title_bar_drag_moves_window() {
        let mut wm = manager();
        let a = wm.create_window(100, 100, 200, 150);

        // Press in the title bar (within 22 px of the top edge).
        wm.handle_mouse(-320 + 150, -240 + 110, false, false); // cursor (150, 110)
        wm.handle_mouse(0, 0, true, false);
        // Drag 30 right, 20 down.
        wm.handle_mouse(30, 20, true, false);
        let win = wm.window(a).unwrap();
        assert_eq!((win.x, win.y), (130, 120));

        // Release ends the drag; further movement does nothing.
        wm.handle_mouse(0, 0, false, false);
        wm.handle_mouse(50, 50, false, false);
        let win = wm.window(a).unwrap();
        assert_eq!((win.x, win.y), (130, 120));
    }

    #[test]
    fn drag_clamps_to_screen() {
        let mut wm = manager();
        let a = wm.create_window(100, 100, 200, 150);

        wm.handle_mouse(-320 + 150, -240 + 110, false, false);
        wm.handle_mouse(0, 0, true, false);
        // Fling far up-left: the cursor clamps to (0, 0), the window never
        // goes above the top edge.
        wm.handle_mouse(-5000, -5000, true, false);
        let win = wm.window(a).unwrap();
        assert_eq!((win.x, win.y), (-50, 0));

        // Fling far down-right: the cursor clamps to the screen corner and
        // the window follows with its grab offset, still partly visible.
        wm.handle_mouse(5000, 5000, true, false);
        let win = wm.window(a).unwrap();
        assert_eq!((win.x, win.y), (639 - 50, 469));
        assert!(win.x < 640 - DRAG_KEEP_VISIBLE);
        assert!(win.y < 480 - DRAG_KEEP_VISIBLE);
    }

    #[test]
    fn body_click_does_not_drag() {
        let mut wm = manager();
        let a = wm.create_window(100, 100, 200, 150);

        // Press well below the title bar, then move.
        wm.handle_mouse(-320 + 150, -240 + 200, false, false); // cursor (150, 200)
        wm.handle_mouse(0, 0, true, false);
        wm.handle_mouse(30, 30, true, false);
        let win = wm.window(a).unwrap();
        assert_eq!((win.x, win.y), (100, 100));
    }

    #[test]
    fn mouse_routed_to_window_under_cursor() {
        let mut wm = manager();
        let a = wm.create_window(0, 0, 100, 100);
        wm.handle_mouse(-320 + 50, -240 + 50, false, false);
        let win = wm.window_mut(a).unwrap();
        let event = win.pop_mouse_event().unwrap();
        assert_eq!((event.x, event.y), (50, 50));
        assert!(win.pop_mouse_event().is_none());
    }

    #[test]
    fn keyboard_routed_to_active_only() {
        let mut wm = manager();
        let a = wm.create_window(0, 0, 100, 100);
        let b = wm.create_window(200, 200, 100, 100);

        wm.handle_key(KeyboardEvent { key: b'x', pressed: true, alt_down: false });
        assert!(wm.window_mut(b).unwrap().pop_keyboard_event().is_some());
        assert!(wm.window_mut(a).unwrap().pop_keyboard_event().is_none());
    }

    #[test]
    fn alt_tab_cycles_visible_windows() {
        let mut wm = manager();
        let a = wm.create_window(0, 0, 10, 10);
        let b = wm.create_window(0, 0, 10, 10);
        let c = wm.create_window(0, 0, 10, 10);
        assert_eq!(wm.active_window(), c);

        let alt_tab = KeyboardEvent { key: b'\t', pressed: false, alt_down: true };
        wm.handle_key(alt_tab);
        assert_eq!(wm.active_window(), a);
        wm.handle_key(alt_tab);
        assert_eq!(wm.active_window(), b);

        // Hidden windows are skipped.
        wm.close_window(c);
        wm.handle_key(alt_tab);
        assert_eq!(wm.active_window(), a);
    }

    #[test]
    fn close_is_deferred_until_composite() {
        let mut wm = manager();
        let a = wm.create_window(0, 0, 10, 10);
        wm.close_window(a);
        assert_eq!(wm.window_count(), 1);
        assert!(!wm.window(a).unwrap().visible);
        assert_eq!(wm.active_window(), WindowId(0));

        wm.composite();
        assert_eq!(wm.window_count(), 0);
        assert!(wm.window(a).is_none());
    }

    #[test]
    fn composite_paints_in_z_order() {
        let mut wm = manager();
        let bottom = wm.create_window(0, 0, 4, 4);
        let top = wm.create_window(1, 1, 4, 4);
        wm.window_mut(bottom).unwrap().pixels.fill(0x1111);
        wm.window_mut(top).unwrap().pixels.fill(0x2222);

        wm.composite();
        let frame = wm.front();
        // Non-overlapping corner of bottom.
        assert_eq!(frame.pixel(0, 0), 0x1111);
        // Overlap: top wins.
        assert_eq!(frame.pixel(2, 2), 0x2222);
        // Outside both: background.
        assert_eq!(frame.pixel(100, 100), BACKGROUND_COLOR);
    }

    #[test]
    fn composite_clips_offscreen_windows() {
        let mut wm = manager();
        let a = wm.create_window(-2, 0, 4, 4);
        wm.window_mut(a).unwrap().pixels.fill(0x3333);
        wm.composite();
        // Only the on-screen half is painted.
        assert_eq!(wm.front().pixel(0, 0), 0x3333);
        assert_eq!(wm.front().pixel(1, 0), 0x3333);
        assert_eq!(wm.front().pixel(2, 0), BACKGROUND_COLOR);
    }
}
