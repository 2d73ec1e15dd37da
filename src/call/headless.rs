//! Headless phone runs for the `connect` and `call` subcommands.
//!
//! Both drive the same controller the TUI uses, just without a screen:
//! intents in, snapshots out, tracing on stderr tells the story.

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::time::{self, Duration};

use crate::call::controller::{self, Intent, PhoneHandle, PhoneSnapshot};
use crate::call::fmt_duration;
use crate::config::Config;
use crate::session::ConnectionStatus;

/// How long `call` waits for the controller to take the dial at all.
const DIAL_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period for the BYE and un-REGISTER on the way out.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// `connect`: register to the PBX and stay online until Ctrl-C. Incoming
/// invitations ring (and are logged) but nothing answers them here.
pub async fn listen(config: Config) -> Result<()> {
    let phone = controller::spawn(config);
    let mut snapshots = phone.watch();

    phone.send(Intent::Connect);
    let registered_as = wait_connected(&mut snapshots).await?;
    println!("Registered as {registered_as}; listening for calls, Ctrl-C to exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
            changed = snapshots.changed() => {
                changed.context("phone controller gone")?;
                let connection = snapshots.borrow().connection.clone();
                match connection {
                    ConnectionStatus::Error(reason) => bail!("connection lost: {reason}"),
                    ConnectionStatus::Disconnected => break,
                    _ => {}
                }
            }
        }
    }

    shutdown(&phone, &mut snapshots).await;
    Ok(())
}

/// `call`: dial one number, hold the line, then hang up and exit. A zero
/// duration keeps the call up until Ctrl-C or the remote side hangs up.
pub async fn dial_once(config: Config, number: String, duration_secs: u64) -> Result<()> {
    let phone = controller::spawn(config);
    let mut snapshots = phone.watch();

    phone.send(Intent::Connect);
    let registered_as = wait_connected(&mut snapshots).await?;
    tracing::info!("Registered as {}", registered_as);

    phone.send(Intent::Dial { number: number.clone() });

    // The dial was taken once the call slot fills; a refusal leaves the
    // slot empty and the reason in the notice.
    let accepted = time::timeout(DIAL_ACCEPT_TIMEOUT, async {
        loop {
            if snapshots.borrow().call.is_some() {
                return true;
            }
            if snapshots.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;
    if !matches!(accepted, Ok(true)) {
        let notice = snapshots.borrow().notice.clone();
        shutdown(&phone, &mut snapshots).await;
        bail!(
            "dial refused: {}",
            notice.unwrap_or_else(|| "no reason given".to_string())
        );
    }

    println!("Calling {number}... Ctrl-C hangs up");

    let hangup_at = async {
        if duration_secs > 0 {
            time::sleep(Duration::from_secs(duration_secs)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(hangup_at);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                phone.send(Intent::Hangup);
                break;
            }
            _ = &mut hangup_at => {
                tracing::info!("Requested duration reached, hanging up");
                phone.send(Intent::Hangup);
                break;
            }
            changed = snapshots.changed() => {
                changed.context("phone controller gone")?;
                // Ended from the far side, or refused mid-setup.
                if snapshots.borrow().call.is_none() {
                    break;
                }
            }
        }
    }

    // Let the slot clear so the history entry below is final.
    let _ = time::timeout(SHUTDOWN_GRACE, async {
        while snapshots.borrow().call.is_some() {
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    })
    .await;

    let snapshot = snapshots.borrow().clone();
    match snapshot.history.first() {
        Some(entry) => println!(
            "Call to {} {}, {}",
            entry.remote,
            entry.outcome.label(),
            fmt_duration(entry.duration_secs)
        ),
        None => println!("Call to {number} left no history entry"),
    }

    shutdown(&phone, &mut snapshots).await;
    Ok(())
}

/// Wait for registration to complete; connection errors become the
/// command's error.
async fn wait_connected(snapshots: &mut watch::Receiver<PhoneSnapshot>) -> Result<String> {
    loop {
        let connection = snapshots.borrow().connection.clone();
        match connection {
            ConnectionStatus::Connected { registered_as } => return Ok(registered_as),
            ConnectionStatus::Error(reason) => bail!("{reason}"),
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {}
        }
        snapshots.changed().await.context("phone controller gone")?;
    }
}

/// Ask for a disconnect and wait briefly so the un-REGISTER makes it onto
/// the wire before the process exits.
async fn shutdown(phone: &PhoneHandle, snapshots: &mut watch::Receiver<PhoneSnapshot>) {
    phone.send(Intent::Disconnect);
    let _ = time::timeout(SHUTDOWN_GRACE, async {
        loop {
            if matches!(
                snapshots.borrow().connection,
                ConnectionStatus::Disconnected | ConnectionStatus::Error(_)
            ) {
                break;
            }
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
}
