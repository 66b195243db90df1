//! Line-oriented event stream on UARTE0.
//!
//! The engine serializes into [`UartSink`]'s line buffer; whole lines are
//! pushed into a pipe and drained by [`uart_task`]. A line the pipe cannot
//! take right now is dropped, never split.

use defmt::warn;
use embassy_nrf::peripherals::UARTE0;
use embassy_nrf::uarte::UarteTx;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pipe::Pipe;

use zrelay::config::EVENT_LINE_MAX;
use zrelay::events::EventSink;

const PIPE_SIZE: usize = 4096;

static EVENT_PIPE: Pipe<CriticalSectionRawMutex, PIPE_SIZE> = Pipe::new();

pub struct UartSink {
    line: [u8; EVENT_LINE_MAX],
}

impl UartSink {
    pub const fn new() -> Self {
        Self {
            line: [0; EVENT_LINE_MAX],
        }
    }
}

impl EventSink for UartSink {
    fn buffer(&mut self) -> &mut [u8] {
        &mut self.line
    }

    fn commit(&mut self, len: usize) {
        let bytes = &self.line[..len];
        if EVENT_PIPE.free_capacity() < bytes.len() {
            warn!("uart: output backed up, line dropped");
        } else if EVENT_PIPE.try_write(bytes).is_err() {
            warn!("uart: pipe write failed");
        }
    }
}

#[embassy_executor::task]
pub async fn uart_task(mut tx: UarteTx<'static, UARTE0>) -> ! {
    let mut buf = [0u8; 64];
    loop {
        let n = EVENT_PIPE.read(&mut buf).await;
        if let Err(e) = tx.write(&buf[..n]).await {
            warn!("uart: write failed: {:?}", e);
        }
    }
}
