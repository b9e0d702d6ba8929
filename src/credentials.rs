//! Credentials for portals that use direct (username/password) login
//!
//! Passwords are kept in the OS credential manager (Keychain, Credential
//! Manager, Secret Service) under one entry per `user@portal`, mirrored to a
//! `0600` file for headless hosts where no keyring is reachable. The file is
//! obfuscated, not encrypted.

use crate::error::GpError;
use crate::gp::portal::DirectChallenge;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use keyring::Entry;
use std::fmt;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const SERVICE_NAME: &str = "gp-connect";
const CREDENTIALS_FILENAME: &str = "credentials";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to access credentials file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Answer to a gateway MFA challenge that triggers a push notification
pub const PUSH_PASSCODE: &str = "push";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Second factor for gateways that challenge after login
    pub passcode: Option<String>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            passcode: None,
        }
    }

    pub fn with_passcode(mut self, passcode: &str) -> Self {
        self.passcode = Some(passcode.to_string());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("passcode", &self.passcode.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Supplies credentials when a portal asks for direct login, and the second
/// factor when a gateway answers login with a challenge
pub trait CredentialSource: Send + Sync {
    fn credentials(&self, portal: &str, challenge: &DirectChallenge) -> Result<Credentials, GpError>;

    /// Passcode for a gateway challenge; `message` is the gateway's prompt
    fn passcode(&self, gateway: &str, message: &str) -> Result<String, GpError> {
        Err(GpError::AuthRejected(format!(
            "{} requested an additional factor ({}) and none is available",
            gateway, message
        )))
    }
}

/// Fixed credentials, for non-interactive use
pub struct StaticCredentials(pub Credentials);

impl CredentialSource for StaticCredentials {
    fn credentials(&self, _portal: &str, _challenge: &DirectChallenge) -> Result<Credentials, GpError> {
        Ok(self.0.clone())
    }

    fn passcode(&self, gateway: &str, message: &str) -> Result<String, GpError> {
        match &self.0.passcode {
            Some(passcode) => Ok(passcode.clone()),
            None => Err(GpError::AuthRejected(format!(
                "{} requested an additional factor ({}) and none is configured",
                gateway, message
            ))),
        }
    }
}

/// Stored password if there is one, terminal prompt otherwise
pub struct PromptCredentialSource {
    username: Option<String>,
    vault: CredentialVault,
    remember: bool,
}

impl PromptCredentialSource {
    pub fn new(username: Option<String>, vault: CredentialVault, remember: bool) -> Self {
        Self {
            username,
            vault,
            remember,
        }
    }
}

impl CredentialSource for PromptCredentialSource {
    fn credentials(&self, portal: &str, challenge: &DirectChallenge) -> Result<Credentials, GpError> {
        let username = match &self.username {
            Some(u) => u.clone(),
            None => prompt_line(&challenge.username_label)
                .map_err(|e| GpError::AuthRejected(format!("no username: {}", e)))?,
        };
        if username.is_empty() {
            return Err(GpError::AuthRejected("username is required".to_string()));
        }

        if let Some(password) = self.vault.get(portal, &username) {
            return Ok(Credentials {
                username,
                password,
                passcode: None,
            });
        }

        let password = rpassword::prompt_password(format!("{}: ", challenge.password_label))
            .map_err(|e| GpError::AuthRejected(format!("no password: {}", e)))?;

        if self.remember {
            if let Err(e) = self.vault.store(portal, &username, &password) {
                debug!("Could not remember password: {}", e);
            }
        }
        Ok(Credentials {
            username,
            password,
            passcode: None,
        })
    }

    /// Empty input sends a push request
    fn passcode(&self, _gateway: &str, message: &str) -> Result<String, GpError> {
        let code = rpassword::prompt_password(format!("{} (empty for push): ", message))
            .map_err(|e| GpError::AuthRejected(format!("no passcode: {}", e)))?;
        let code = code.trim();
        if code.is_empty() {
            info!("Sending push request, approve it on your device");
            return Ok(PUSH_PASSCODE.to_string());
        }
        Ok(code.to_string())
    }
}

fn prompt_line(label: &str) -> std::io::Result<String> {
    eprint!("{}: ", label);
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Keyring-backed password store with a file mirror
#[derive(Debug, Clone)]
pub struct CredentialVault {
    service: String,
    file: PathBuf,
    use_keyring: bool,
}

impl CredentialVault {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            file: file.into(),
            use_keyring: true,
        }
    }

    /// Vault at the default location (`<config dir>/gp-connect/credentials`)
    pub fn default_location() -> Result<Self, CredentialError> {
        Ok(Self::new(default_credentials_path().ok_or(CredentialError::NoConfigDir)?))
    }

    /// File-only vault, for hosts without a keyring
    pub fn file_only(file: impl Into<PathBuf>) -> Self {
        Self {
            use_keyring: false,
            ..Self::new(file)
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Store to the file first (headless contexts), then the keyring
    pub fn store(&self, portal: &str, username: &str, password: &str) -> Result<(), CredentialError> {
        let account = account_name(portal, username);

        let mut entries = self.read_file();
        entries.retain(|(a, _)| *a != account);
        entries.push((account.clone(), password.to_string()));
        self.write_file(&entries)?;

        if self.use_keyring {
            match Entry::new(&self.service, &account).and_then(|e| e.set_password(password)) {
                Ok(()) => info!("Password also stored in keychain for {}", account),
                Err(e) => debug!("Keyring storage failed (file fallback available): {}", e),
            }
        }
        Ok(())
    }

    /// Keyring first, then the file
    pub fn get(&self, portal: &str, username: &str) -> Option<String> {
        let account = account_name(portal, username);

        if self.use_keyring {
            match Entry::new(&self.service, &account).and_then(|e| e.get_password()) {
                Ok(password) => {
                    info!("Retrieved stored password from keychain for {}", account);
                    return Some(password);
                }
                Err(keyring::Error::NoEntry) => debug!("No keychain entry for {}", account),
                Err(e) => debug!("Keyring retrieval failed: {}", e),
            }
        }

        self.read_file()
            .into_iter()
            .find(|(a, _)| *a == account)
            .map(|(_, password)| password)
    }

    pub fn delete(&self, portal: &str, username: &str) -> Result<(), CredentialError> {
        let account = account_name(portal, username);

        if self.use_keyring {
            match Entry::new(&self.service, &account).and_then(|e| e.delete_credential()) {
                Ok(()) => info!("Password deleted from keychain for {}", account),
                Err(keyring::Error::NoEntry) => debug!("No keychain password for {}", account),
                Err(e) => return Err(e.into()),
            }
        }

        let mut entries = self.read_file();
        let before = entries.len();
        entries.retain(|(a, _)| *a != account);
        if entries.len() != before {
            self.write_file(&entries)?;
            info!("Password deleted from credentials file for {}", account);
        }
        Ok(())
    }

    fn read_file(&self) -> Vec<(String, String)> {
        match fs::read_to_string(&self.file) {
            Ok(content) => content.lines().filter_map(decode_line).collect(),
            Err(e) => {
                debug!("No credentials file at {:?}: {}", self.file, e);
                Vec::new()
            }
        }
    }

    fn write_file(&self, entries: &[(String, String)]) -> Result<(), CredentialError> {
        if entries.is_empty() {
            if self.file.exists() {
                fs::remove_file(&self.file)?;
            }
            return Ok(());
        }
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)?;
        }

        let content: String = entries
            .iter()
            .map(|(account, password)| format!("{}\n", encode_line(account, password)))
            .collect();
        fs::write(&self.file, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.file, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

fn account_name(portal: &str, username: &str) -> String {
    format!("{}@{}", username, crate::session::portal_identity(portal))
}

fn default_credentials_path() -> Option<PathBuf> {
    crate::config::config_dir().map(|dir| dir.join(CREDENTIALS_FILENAME))
}

/// One line per account: base64(account):base64(password)
fn encode_line(account: &str, password: &str) -> String {
    format!("{}:{}", BASE64.encode(account), BASE64.encode(password))
}

fn decode_line(line: &str) -> Option<(String, String)> {
    let (account, password) = line.trim().split_once(':')?;
    let account = String::from_utf8(BASE64.decode(account).ok()?).ok()?;
    let password = String::from_utf8(BASE64.decode(password).ok()?).ok()?;
    Some((account, password))
}
