//! Screen event source.
//!
//! Subscribes to the logind session and translates its signals 1:1 into
//! [`LockEvent`]s: `IdleHint` flipping false/true stands in for screen
//! on/off, the session `Unlock` signal for user presence. The monitor is a
//! transparent relay; it never buffers, coalesces, or reorders.

use crate::engine::LockEvent;
use crate::privilege::logind::{
    LOGIND_SERVICE, PROPERTIES_INTERFACE, SESSION_INTERFACE, get_session_property,
    resolve_session_path,
};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, trace};
use zbus::Connection;
use zbus::proxy::SignalStream;

/// Screen/user-presence event source for the current logind session.
pub struct ScreenMonitor {
    conn: Connection,
    session_path: String,
    unlocks: SignalStream<'static>,
    properties: SignalStream<'static>,
}

impl ScreenMonitor {
    /// Connect to the system bus and subscribe to the current session.
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system()
            .await
            .context("Failed to connect to system DBus")?;
        let session_path = resolve_session_path(&conn).await?;
        info!("Resolved session path: {}", session_path);
        Self::subscribe(conn, session_path).await
    }

    /// Subscribe to an already-resolved session.
    pub async fn subscribe(conn: Connection, session_path: String) -> Result<Self> {
        let session_proxy = zbus::Proxy::new(
            &conn,
            LOGIND_SERVICE,
            session_path.clone(),
            SESSION_INTERFACE,
        )
        .await
        .context("Failed to create Session proxy")?;

        let properties_proxy = zbus::Proxy::new(
            &conn,
            LOGIND_SERVICE,
            session_path.clone(),
            PROPERTIES_INTERFACE,
        )
        .await
        .context("Failed to create Properties proxy")?;

        let unlocks = session_proxy
            .receive_signal("Unlock")
            .await
            .context("Failed to subscribe to Unlock signal")?;

        let properties = properties_proxy
            .receive_signal("PropertiesChanged")
            .await
            .context("Failed to subscribe to PropertiesChanged signal")?;

        info!("Subscribed to screen events on {}", session_path);

        Ok(Self {
            conn,
            session_path,
            unlocks,
            properties,
        })
    }

    /// Query whether the screen is currently interactive.
    ///
    /// Used once at startup so the engine's belief matches reality even when
    /// monitoring begins while the screen is already off.
    pub async fn initial_screen_on(&self) -> Result<bool> {
        let idle: bool = get_session_property(&self.conn, &self.session_path, "IdleHint").await?;
        Ok(!idle)
    }

    /// Wait for the next screen/user-presence event.
    ///
    /// Fails when both signal streams end (bus connection lost).
    pub async fn next_event(&mut self) -> Result<LockEvent> {
        loop {
            tokio::select! {
                msg = self.unlocks.next() => match msg {
                    Some(_) => {
                        debug!("Session Unlock signal received");
                        return Ok(LockEvent::UserPresent);
                    }
                    None => anyhow::bail!("Unlock signal stream ended"),
                },
                msg = self.properties.next() => match msg {
                    Some(msg) => {
                        if let Some(event) = parse_properties_changed(&msg) {
                            debug!("Screen event: {:?}", event);
                            return Ok(event);
                        }
                        // Unrelated property change, keep waiting.
                    }
                    None => anyhow::bail!("PropertiesChanged signal stream ended"),
                },
            }
        }
    }
}

/// Extract a screen event from a PropertiesChanged signal, if it carries an
/// IdleHint change on the session interface.
fn parse_properties_changed(msg: &zbus::Message) -> Option<LockEvent> {
    type Body = (String, HashMap<String, zbus::zvariant::OwnedValue>, Vec<String>);

    let Ok((interface, changed, _invalidated)) = msg.body().deserialize::<Body>() else {
        trace!("Ignoring malformed PropertiesChanged signal");
        return None;
    };

    if interface != SESSION_INTERFACE {
        trace!("Ignoring PropertiesChanged for {}", interface);
        return None;
    }

    let idle: bool = changed.get("IdleHint")?.downcast_ref().ok()?;
    Some(if idle {
        LockEvent::ScreenOff
    } else {
        LockEvent::ScreenOn
    })
}
