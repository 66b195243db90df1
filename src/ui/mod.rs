//! User interface: one push button.
//!
//! - **Short press**: dump the device list and the grade safety table to
//!   the event stream.
//! - **Long press** (held ≥ [`BUTTON_LONG_PRESS_MS`]): disconnect every
//!   sensor, forget all saved ones and open the priority window.
//!
//! [`BUTTON_LONG_PRESS_MS`]: crate::config::BUTTON_LONG_PRESS_MS

#[cfg(feature = "embedded")]
pub mod buttons;
pub mod input_logic;

/// Button gestures (after debouncing).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ButtonEvent {
    ShortPress,
    LongPress,
}
