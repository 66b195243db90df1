use crate::config::{BUTTON_DEBOUNCE_MS, BUTTON_LONG_PRESS_MS};
use crate::ui::ButtonEvent;

/// Classify a completed press by how long it was held.
///
/// Presses shorter than the debounce time are contact bounce.
pub fn classify_press(held_ms: u64) -> Option<ButtonEvent> {
    if held_ms < BUTTON_DEBOUNCE_MS {
        None
    } else if held_ms < BUTTON_LONG_PRESS_MS {
        Some(ButtonEvent::ShortPress)
    } else {
        Some(ButtonEvent::LongPress)
    }
}

/// Edge-driven press tracker; feed it pin levels with timestamps.
#[derive(Default)]
pub struct PressTracker {
    pressed_at: Option<u64>,
}

impl PressTracker {
    pub const fn new() -> Self {
        Self { pressed_at: None }
    }

    /// Pin went active.
    pub fn press(&mut self, now_ms: u64) {
        if self.pressed_at.is_none() {
            self.pressed_at = Some(now_ms);
        }
    }

    /// Pin released; returns the gesture, if any.
    pub fn release(&mut self, now_ms: u64) -> Option<ButtonEvent> {
        let start = self.pressed_at.take()?;
        classify_press(now_ms.saturating_sub(start))
    }

    pub fn is_pressed(&self) -> bool {
        self.pressed_at.is_some()
    }
}
