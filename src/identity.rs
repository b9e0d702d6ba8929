//! Client identity references
//!
//! A client certificate is given either as a file on disk or as a PKCS#11
//! URI naming an object on a smartcard / HSM. Classification is pure string
//! inspection: a token URI is never probed as a path, and a file path is
//! only read by whoever actually uses it.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

/// RFC 7512 scheme prefix (matched case-insensitively)
pub const PKCS11_SCHEME: &str = "pkcs11:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityReference {
    /// PEM bundle (certificate + key) on the local filesystem
    FilePath(PathBuf),
    /// Opaque hardware token reference, forwarded unchanged
    HardwareTokenUri(String),
}

impl IdentityReference {
    /// Classify a user-supplied certificate argument. Never fails and never
    /// touches the filesystem.
    pub fn classify(input: &str) -> Self {
        let input = input.trim();
        if is_pkcs11_uri(input) {
            IdentityReference::HardwareTokenUri(input.to_string())
        } else {
            IdentityReference::FilePath(PathBuf::from(input))
        }
    }

    pub fn is_hardware_token(&self) -> bool {
        matches!(self, IdentityReference::HardwareTokenUri(_))
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            IdentityReference::FilePath(path) => Some(path),
            IdentityReference::HardwareTokenUri(_) => None,
        }
    }

    /// Value handed to the TLS layer of the tunnel engine, unmodified
    pub fn forward_value(&self) -> Cow<'_, str> {
        match self {
            IdentityReference::FilePath(path) => path.to_string_lossy(),
            IdentityReference::HardwareTokenUri(uri) => Cow::Borrowed(uri),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            IdentityReference::FilePath(_) => "file-path",
            IdentityReference::HardwareTokenUri(_) => "pkcs11-uri",
        }
    }
}

/// Display form is safe to log: PINs embedded in a token URI are redacted
impl fmt::Display for IdentityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityReference::FilePath(path) => write!(f, "{}", path.display()),
            IdentityReference::HardwareTokenUri(uri) => f.write_str(&redact_pin(uri)),
        }
    }
}

pub fn is_pkcs11_uri(input: &str) -> bool {
    input
        .get(..PKCS11_SCHEME.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(PKCS11_SCHEME))
}

/// Replace any `pin-value=...` attribute in a message with `<redacted>`
pub fn redact_pin(message: &str) -> Cow<'_, str> {
    let marker = "pin-value=";
    let Some(start) = message.find(marker) else {
        return Cow::Borrowed(message);
    };

    let value_start = start + marker.len();
    let tail = &message[value_start..];
    let value_len = tail
        .find(['&', ';', ' ', '\'', '"', ')'])
        .unwrap_or(tail.len());

    let mut redacted = String::with_capacity(message.len());
    redacted.push_str(&message[..value_start]);
    redacted.push_str("<redacted>");
    redacted.push_str(&redact_pin(&tail[value_len..]));
    Cow::Owned(redacted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkcs11_uri_is_hardware_token() {
        let uri = "pkcs11:token=YubiKey%20PIV;object=PIV%20AUTH%20key;type=private";
        let id = IdentityReference::classify(uri);
        assert_eq!(id, IdentityReference::HardwareTokenUri(uri.to_string()));
        assert!(id.is_hardware_token());
        assert_eq!(id.file_path(), None);
        assert_eq!(id.forward_value(), uri);
    }

    #[test]
    fn test_scheme_match_is_case_insensitive() {
        let id = IdentityReference::classify("PKCS11:model=PKCS%2315;serial=0011");
        assert!(id.is_hardware_token());
    }

    #[test]
    fn test_path_like_uri_still_hardware_token() {
        // Attribute values that look like paths must not flip classification
        let id = IdentityReference::classify("pkcs11:object=/etc/ssl/client.pem;type=cert");
        assert!(id.is_hardware_token());
    }

    #[test]
    fn test_missing_file_is_still_file_path() {
        let id = IdentityReference::classify("/nonexistent/dir/client.pem");
        assert_eq!(
            id,
            IdentityReference::FilePath(PathBuf::from("/nonexistent/dir/client.pem"))
        );
        assert_eq!(id.mode(), "file-path");
    }

    #[test]
    fn test_relative_path_and_whitespace() {
        let id = IdentityReference::classify("  certs/me.pem \n");
        assert_eq!(id.file_path(), Some(Path::new("certs/me.pem")));
    }

    #[test]
    fn test_display_redacts_pin() {
        let id = IdentityReference::classify("pkcs11:token=card;pin-value=123456;type=private");
        assert_eq!(
            id.to_string(),
            "pkcs11:token=card;pin-value=<redacted>;type=private"
        );
        // forwarding keeps the original
        assert!(id.forward_value().contains("123456"));
    }

    #[test]
    fn test_redact_pin_multiple_and_absent() {
        assert_eq!(redact_pin("no secrets here"), "no secrets here");
        assert_eq!(
            redact_pin("a pin-value=1 b pin-value=2"),
            "a pin-value=<redacted> b pin-value=<redacted>"
        );
        assert_eq!(redact_pin("pin-value=9999"), "pin-value=<redacted>");
    }
}
