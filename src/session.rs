//! Session cookie persistence
//!
//! Keeps the portal session cookie between runs so reconnects skip the
//! interactive login. One JSON file per portal lives in the store directory
//! (default `~/.gp-connect/sessions/`):
//!
//! ```json
//! {
//!   "version": 1,
//!   "cookie": {
//!     "portal": "vpn.example.com",
//!     "username": "alice",
//!     "token": "…",
//!     "kind": "portal-userauthcookie",
//!     "issued_at": 1705314600,
//!     "expires_at": null
//!   }
//! }
//! ```
//!
//! Writes go through a temp file and a rename and invalidation is a single
//! unlink, so a concurrent reader sees either the old entry or none. Access
//! to one portal's entry is serialised through a per-portal async lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

const ENTRY_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to access session file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to encode session entry: {0}")]
    EncodeError(#[from] serde_json::Error),
    #[error("Session directory not found: {0}")]
    DirectoryError(String),
}

/// Which portal cookie the token is; decides the request parameter name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    PortalUserAuthCookie,
    PreloginCookie,
}

impl TokenKind {
    pub fn param_name(&self) -> &'static str {
        match self {
            TokenKind::PortalUserAuthCookie => "portal-userauthcookie",
            TokenKind::PreloginCookie => "prelogin-cookie",
        }
    }
}

/// Proof of portal authentication
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    /// Normalised portal identity (see [`portal_identity`])
    pub portal: String,
    pub username: String,
    pub token: String,
    pub kind: TokenKind,
    /// Unix seconds
    pub issued_at: u64,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl SessionCookie {
    pub fn new(portal: &str, username: &str, token: &str, kind: TokenKind) -> Self {
        Self {
            portal: portal_identity(portal),
            username: username.to_string(),
            token: token.to_string(),
            kind,
            issued_at: now_secs(),
            expires_at: None,
        }
    }

    pub fn with_lifetime(mut self, secs: u64) -> Self {
        self.expires_at = Some(self.issued_at.saturating_add(secs));
        self
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }
}

// Token stays out of logs
impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookie")
            .field("portal", &self.portal)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .field("kind", &self.kind)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionEntry {
    version: u32,
    cookie: SessionCookie,
}

/// Shared store of session cookies, cheap to clone
#[derive(Clone)]
pub struct SessionStore {
    dir: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `~/.gp-connect/sessions` (HOME, then USERPROFILE, then LOCALAPPDATA)
    pub fn default_dir() -> Result<PathBuf, SessionError> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .or_else(|_| std::env::var("LOCALAPPDATA"))
            .map_err(|_| {
                SessionError::DirectoryError("HOME/USERPROFILE/LOCALAPPDATA not set".into())
            })?;

        Ok(PathBuf::from(home).join(".gp-connect").join("sessions"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stored cookie for a portal. Expired or unreadable entries are removed
    /// and reported as absent.
    pub async fn load(&self, portal: &str) -> Result<Option<SessionCookie>, SessionError> {
        let portal = portal_identity(portal);
        let lock = self.lock_for(&portal);
        let _guard = lock.lock().await;

        let path = self.entry_path(&portal);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: SessionEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Discarding unreadable session entry for {}: {}", portal, e);
                remove_if_present(&path)?;
                return Ok(None);
            }
        };

        if entry.version != ENTRY_VERSION || entry.cookie.portal != portal {
            warn!("Discarding session entry with mismatched version or portal");
            remove_if_present(&path)?;
            return Ok(None);
        }

        if entry.cookie.is_expired() {
            info!("Stored session for {} has expired", portal);
            remove_if_present(&path)?;
            return Ok(None);
        }

        debug!("Loaded stored session for {} ({})", portal, entry.cookie.username);
        Ok(Some(entry.cookie))
    }

    pub async fn save(&self, cookie: &SessionCookie) -> Result<(), SessionError> {
        let lock = self.lock_for(&cookie.portal);
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.dir)?;
        let entry = SessionEntry {
            version: ENTRY_VERSION,
            cookie: cookie.clone(),
        };
        let content = serde_json::to_string_pretty(&entry)?;
        write_atomic(&self.entry_path(&cookie.portal), content.as_bytes())?;

        debug!("Stored session for {}", cookie.portal);
        Ok(())
    }

    /// Unconditionally drop the portal's entry
    pub async fn invalidate(&self, portal: &str) -> Result<(), SessionError> {
        let portal = portal_identity(portal);
        let lock = self.lock_for(&portal);
        let _guard = lock.lock().await;

        if remove_if_present(&self.entry_path(&portal))? {
            info!("Session for {} invalidated", portal);
        }
        Ok(())
    }

    /// Drop the portal's entry only if it still holds `token`, so a stale
    /// rejection cannot delete a cookie another attempt just stored.
    /// Returns whether an entry was removed.
    pub async fn invalidate_token(&self, portal: &str, token: &str) -> Result<bool, SessionError> {
        let portal = portal_identity(portal);
        let lock = self.lock_for(&portal);
        let _guard = lock.lock().await;

        let path = self.entry_path(&portal);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let matches = serde_json::from_str::<SessionEntry>(&content)
            .map(|entry| entry.cookie.token == token)
            .unwrap_or(true);

        if !matches {
            debug!("Stored session for {} was replaced, keeping it", portal);
            return Ok(false);
        }

        let removed = remove_if_present(&path)?;
        if removed {
            info!("Session for {} invalidated", portal);
        }
        Ok(removed)
    }

    pub async fn record_gateway(&self, portal: &str, gateway: &str) -> Result<(), SessionError> {
        let portal = portal_identity(portal);
        let lock = self.lock_for(&portal);
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.gateway_path(&portal), gateway.as_bytes())?;
        Ok(())
    }

    pub fn last_gateway(&self, portal: &str) -> Option<String> {
        let path = self.gateway_path(&portal_identity(portal));
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn lock_for(&self, portal: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(portal.to_string()).or_default().clone()
    }

    fn entry_path(&self, portal: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_key(portal)))
    }

    fn gateway_path(&self, portal: &str) -> PathBuf {
        self.dir.join(format!("{}.gateway", file_key(portal)))
    }
}

/// Normalised portal identity: host[:port], lowercase, no scheme or path
pub fn portal_identity(portal: &str) -> String {
    let trimmed = portal.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host = without_scheme.split('/').next().unwrap_or_default();
    host.to_ascii_lowercase()
}

fn file_key(portal: &str) -> String {
    portal
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), SessionError> {
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool, SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
