//! Privilege gate bound to systemd-logind.
//!
//! The "admin" capability maps to access to the current logind session:
//! activation probes the session object, `lock_now` calls `Session.Lock`.

use super::{PrivilegeError, PrivilegeGate};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zbus::Connection;

/// DBus interface for login1.
pub(crate) const LOGIND_SERVICE: &str = "org.freedesktop.login1";
pub(crate) const LOGIND_PATH: &str = "/org/freedesktop/login1";
pub(crate) const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
pub(crate) const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
pub(crate) const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Privilege gate backed by the logind session of the current user.
pub struct LogindGate {
    conn: Connection,

    /// Session object path, the cached component identity.
    session_path: String,

    /// Whether the capability has been activated.
    active: AtomicBool,

    /// Serializes activation requests (one outstanding at a time).
    request_guard: Mutex<()>,

    /// Log the lock call instead of issuing it.
    dry_run: bool,
}

impl LogindGate {
    /// Create a gate for the given session. Starts inactive.
    pub fn new(conn: Connection, session_path: String, dry_run: bool) -> Self {
        Self {
            conn,
            session_path,
            active: AtomicBool::new(false),
            request_guard: Mutex::new(()),
            dry_run,
        }
    }
}

#[async_trait]
impl PrivilegeGate for LogindGate {
    async fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    async fn request_activation(&self) -> Result<bool, PrivilegeError> {
        let _guard = self.request_guard.lock().await;

        if self.active.load(Ordering::Relaxed) {
            return Ok(true);
        }

        // Probe the session: if we can read its Active property we can also
        // ask logind to lock it.
        let active: bool = get_session_property(&self.conn, &self.session_path, "Active")
            .await
            .map_err(|e| PrivilegeError::Platform(e.to_string()))?;

        debug!(
            "Session probe succeeded (Active={}), granting lock capability",
            active
        );
        self.active.store(true, Ordering::Relaxed);
        Ok(true)
    }

    async fn lock_now(&self) -> Result<(), PrivilegeError> {
        if !self.active.load(Ordering::Relaxed) {
            return Err(PrivilegeError::NotPrivileged);
        }

        if self.dry_run {
            info!("[DRY RUN] Would lock session {}", self.session_path);
            return Ok(());
        }

        let proxy = zbus::Proxy::new(
            &self.conn,
            LOGIND_SERVICE,
            self.session_path.clone(),
            SESSION_INTERFACE,
        )
        .await?;

        proxy.call::<_, _, ()>("Lock", &()).await?;
        info!("Session {} locked", self.session_path);
        Ok(())
    }

    async fn revoke(&self) {
        if self.active.swap(false, Ordering::Relaxed) {
            info!("Lock capability revoked");
        }
    }
}

/// Resolve the session object path for the current session.
pub(crate) async fn resolve_session_path(conn: &Connection) -> Result<String> {
    // First try XDG_SESSION_ID if available
    if let Ok(session_id) = env::var("XDG_SESSION_ID") {
        debug!("Using XDG_SESSION_ID: {}", session_id);
        return get_session_by_id(conn, &session_id).await;
    }

    debug!("XDG_SESSION_ID not set, trying to find current session");

    let self_path = format!("{LOGIND_PATH}/session/self");
    if check_session_exists(conn, &self_path).await {
        return Ok(self_path);
    }

    let auto_path = format!("{LOGIND_PATH}/session/auto");
    if check_session_exists(conn, &auto_path).await {
        return Ok(auto_path);
    }

    anyhow::bail!(
        "Could not resolve session path. Set XDG_SESSION_ID or ensure logind session is available."
    )
}

/// Get session object path by session ID via Manager.GetSession.
async fn get_session_by_id(conn: &Connection, session_id: &str) -> Result<String> {
    let proxy = zbus::Proxy::new(conn, LOGIND_SERVICE, LOGIND_PATH, MANAGER_INTERFACE)
        .await
        .context("Failed to create Manager proxy")?;

    let path: zbus::zvariant::OwnedObjectPath = proxy
        .call("GetSession", &(session_id,))
        .await
        .context("GetSession call failed")?;

    Ok(path.to_string())
}

/// Check if a session path exists by trying to read IdleHint.
async fn check_session_exists(conn: &Connection, path: &str) -> bool {
    match get_session_property::<bool>(conn, path, "IdleHint").await {
        Ok(_) => true,
        Err(e) => {
            warn!("Session probe at {} failed: {}", path, e);
            false
        }
    }
}

/// Read a property from the session interface.
pub(crate) async fn get_session_property<T>(
    conn: &Connection,
    session_path: &str,
    name: &str,
) -> Result<T>
where
    T: TryFrom<zbus::zvariant::OwnedValue>,
{
    let proxy = zbus::Proxy::new(
        conn,
        LOGIND_SERVICE,
        session_path.to_owned(),
        PROPERTIES_INTERFACE,
    )
    .await
    .context("Failed to create Properties proxy")?;

    let value: zbus::zvariant::OwnedValue = proxy
        .call("Get", &(SESSION_INTERFACE, name))
        .await
        .with_context(|| format!("Failed to get {name} property"))?;

    T::try_from(value).map_err(|_| anyhow::anyhow!("{name} has unexpected type"))
}
