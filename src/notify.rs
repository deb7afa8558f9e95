//! Foreground presence notification.
//!
//! Keeps one persistent desktop notification alive while the engine is
//! running, mirroring the current timeout into its body. Re-notifying with
//! the same replaces id is idempotent, so updates are last-write-wins.

use crate::engine::EngineStatus;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zbus::Connection;
use zbus::zvariant::Value;

const NOTIFY_SERVICE: &str = "org.freedesktop.Notifications";
const NOTIFY_PATH: &str = "/org/freedesktop/Notifications";
const NOTIFY_INTERFACE: &str = "org.freedesktop.Notifications";

const APP_NAME: &str = "autolockd";
const ICON: &str = "system-lock-screen";

/// Publishes the running/timeout state as a persistent notification.
pub struct PresencePublisher {
    conn: Connection,

    /// Server-assigned id of our notification; 0 when none is shown.
    notification_id: u32,
}

impl PresencePublisher {
    /// Connect to the session bus notification service.
    pub async fn connect() -> Result<Self> {
        let conn = Connection::session()
            .await
            .context("Failed to connect to session DBus")?;
        Ok(Self {
            conn,
            notification_id: 0,
        })
    }

    /// Follow the engine status channel until shutdown.
    ///
    /// Notification failures are logged and retried on the next status
    /// change; they never take the daemon down.
    pub async fn run(mut self, mut status: watch::Receiver<EngineStatus>, shutdown: CancellationToken) {
        loop {
            let current = *status.borrow_and_update();
            if let Err(e) = self.publish(current).await {
                warn!("Failed to update presence notification: {}", e);
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.close().await {
            debug!("Failed to close presence notification: {}", e);
        }
    }

    async fn publish(&mut self, status: EngineStatus) -> Result<()> {
        if status.running {
            self.show(status.timeout).await
        } else {
            self.close().await
        }
    }

    /// Show or update the persistent notification.
    async fn show(&mut self, timeout: Duration) -> Result<()> {
        let proxy = self.proxy().await?;

        let hints: HashMap<&str, Value<'_>> = HashMap::from([
            ("urgency", Value::U8(1)),
            ("resident", Value::Bool(true)),
        ]);

        let id: u32 = proxy
            .call(
                "Notify",
                &(
                    APP_NAME,
                    self.notification_id,
                    ICON,
                    "Auto-lock active",
                    notification_body(timeout),
                    Vec::<&str>::new(),
                    hints,
                    0i32, // never expire
                ),
            )
            .await
            .context("Notify call failed")?;

        debug!("Presence notification shown (id={})", id);
        self.notification_id = id;
        Ok(())
    }

    /// Remove the notification if one is shown.
    async fn close(&mut self) -> Result<()> {
        if self.notification_id == 0 {
            return Ok(());
        }

        let proxy = self.proxy().await?;
        proxy
            .call::<_, _, ()>("CloseNotification", &(self.notification_id,))
            .await
            .context("CloseNotification call failed")?;

        debug!("Presence notification closed");
        self.notification_id = 0;
        Ok(())
    }

    async fn proxy(&self) -> Result<zbus::Proxy<'static>> {
        zbus::Proxy::new(&self.conn, NOTIFY_SERVICE, NOTIFY_PATH, NOTIFY_INTERFACE)
            .await
            .context("Failed to create Notifications proxy")
    }
}

/// Notification body: timeout in whole minutes, fractional minutes truncated.
fn notification_body(timeout: Duration) -> String {
    let minutes = timeout.as_millis() / 60_000;
    format!("Locks after {minutes} min of inactivity")
}
