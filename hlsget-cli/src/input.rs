use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Blocking key listener: pressing `q` cancels `cancel`.
///
/// Raw mode is enabled for the duration of the loop and restored once either
/// `cancel` or `done` is cancelled. Run it on a blocking thread.
pub fn input_handler(cancel: CancellationToken, done: CancellationToken) {
    if terminal::enable_raw_mode().is_err() {
        info!("Failed to enable raw mode. Input handling will be disabled.");
        return;
    }

    while !cancel.is_cancelled() && !done.is_cancelled() {
        if let Ok(true) = event::poll(Duration::from_millis(100))
            && let Ok(Event::Key(KeyEvent {
                code: KeyCode::Char('q'),
                modifiers: KeyModifiers::NONE,
                ..
            })) = event::read()
        {
            info!("Stop requested, finishing in-flight segments...");
            cancel.cancel();
            break;
        }
    }

    if terminal::disable_raw_mode().is_err() {
        debug!("Failed to disable raw mode.");
    }
}
