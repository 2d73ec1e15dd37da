//! Terminal UI for the softphone.
//!
//! Full-screen ratatui interface: call panel, history list, status bar, and
//! an optional pane showing captured log lines.

mod app;
mod logbuf;
mod ui;

pub use logbuf::LogBuffer;

use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{Event, EventStream, KeyEventKind};
use futures::{FutureExt, StreamExt};
use ratatui::DefaultTerminal;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;

use crate::call::controller::PhoneHandle;
use crate::session::ConnectionStatus;
use app::App;

/// Terminal bell cadence while an incoming call rings.
const BELL_INTERVAL: Duration = Duration::from_secs(2);
/// How long to wait for the un-REGISTER after quitting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Run the TUI application with panic-safe terminal restore
pub async fn run(phone: PhoneHandle, logs: LogBuffer) -> Result<()> {
    let mut terminal = ratatui::init();
    let result = AssertUnwindSafe(run_app(&mut terminal, &phone, &logs))
        .catch_unwind()
        .await;
    ratatui::restore();

    match result {
        Ok(r) => r,
        Err(e) => std::panic::resume_unwind(e),
    }
}

async fn run_app(
    terminal: &mut DefaultTerminal,
    phone: &PhoneHandle,
    logs: &LogBuffer,
) -> Result<()> {
    let mut app = App::new(phone.snapshot());
    let mut keys = EventStream::new();
    let mut snapshots = WatchStream::new(phone.watch());
    let mut bell = time::interval(BELL_INTERVAL);
    bell.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !app.should_exit {
        terminal.draw(|frame| ui::render(frame, &app, logs))?;

        tokio::select! {
            event = keys.next() => match event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    app.handle_key(key, phone);
                }
                // Resize and the rest just trigger the redraw above.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("terminal input stream failed"),
                None => break,
            },
            snapshot = snapshots.next() => match snapshot {
                Some(snapshot) => app.snapshot = snapshot,
                None => break,
            },
            _ = bell.tick(), if app.is_ringing() => ring_bell()?,
        }
    }

    drain_disconnect(phone).await;
    Ok(())
}

/// Sound the terminal bell once.
fn ring_bell() -> Result<()> {
    let mut out = std::io::stdout();
    out.write_all(b"\x07")?;
    out.flush()?;
    Ok(())
}

/// Wait briefly for the controller to finish tearing down, so the BYE and
/// un-REGISTER make it onto the wire before the process exits.
async fn drain_disconnect(phone: &PhoneHandle) {
    let mut watch = phone.watch();
    let _ = time::timeout(SHUTDOWN_GRACE, async {
        while !matches!(
            watch.borrow().connection,
            ConnectionStatus::Disconnected | ConnectionStatus::Error(_)
        ) {
            if watch.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
}
