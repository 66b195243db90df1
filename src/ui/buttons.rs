//! GPIO button input with async debouncing.
//!
//! One button (active-low with internal pull-up). The task waits for a
//! falling edge, debounces it, times the hold and sends the resulting
//! [`ButtonEvent`] to the engine channel.

use embassy_nrf::gpio::{AnyPin, Input, Pull};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Sender;
use embassy_time::{Duration, Instant, Timer};

use crate::config::BUTTON_DEBOUNCE_MS;
use crate::ui::input_logic::PressTracker;
use crate::ui::ButtonEvent;

/// Run the button loop forever.
pub async fn button_task(
    pin: AnyPin,
    tx: Sender<'static, CriticalSectionRawMutex, ButtonEvent, 4>,
) -> ! {
    let mut btn = Input::new(pin, Pull::Up);
    let mut tracker = PressTracker::new();

    loop {
        btn.wait_for_falling_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        if btn.is_high() {
            continue;
        }
        tracker.press(Instant::now().as_millis());

        btn.wait_for_rising_edge().await;
        if let Some(event) = tracker.release(Instant::now().as_millis()) {
            info!("button: {:?}", event);
            tx.send(event).await;
        }
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
    }
}
