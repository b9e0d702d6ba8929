//! Capability report for `gp-connect diagnose`

use crate::gp::hip::find_hip_wrapper;
use crate::gp::http::{computer_name, os_version_string};
use crate::identity::IdentityReference;
use crate::session::SessionStore;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

const VPNC_SCRIPT_LOCATIONS: &[&str] = &[
    "/usr/local/share/vpnc-scripts/vpnc-script",
    "/usr/local/sbin/vpnc-script",
    "/usr/share/vpnc-scripts/vpnc-script",
    "/usr/sbin/vpnc-script",
    "/etc/vpnc/vpnc-script",
    "/etc/openconnect/vpnc-script",
    "/opt/homebrew/etc/vpnc/vpnc-script",
];

const NOT_FOUND: &str = "<not-found>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    NotSpecified,
    HardwareToken,
    File { path: PathBuf, exists: bool },
}

#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub os_version: String,
    pub device: String,
    pub certificate: CertificateStatus,
    pub hip_wrapper: Option<PathBuf>,
    pub vpnc_script: Option<PathBuf>,
    pub openconnect: Option<String>,
    pub last_gateway: Option<String>,
    /// Extra detail for `--verbose`
    pub session_dir: Option<PathBuf>,
}

/// Collect the report. Probing a certificate file for existence is the one
/// place a file-backed identity is looked at before use.
pub fn collect(
    certificate: Option<&IdentityReference>,
    hip_wrapper: Option<&str>,
    store: Option<(&SessionStore, &str)>,
    verbose: bool,
) -> DiagnosticsReport {
    let certificate = match certificate {
        None => CertificateStatus::NotSpecified,
        Some(IdentityReference::HardwareTokenUri(_)) => CertificateStatus::HardwareToken,
        Some(IdentityReference::FilePath(path)) => CertificateStatus::File {
            path: path.clone(),
            exists: path.exists(),
        },
    };

    DiagnosticsReport {
        os_version: os_version_string(),
        device: computer_name(),
        certificate,
        hip_wrapper: find_hip_wrapper(hip_wrapper),
        vpnc_script: find_vpnc_script(VPNC_SCRIPT_LOCATIONS),
        openconnect: detect_openconnect_version(),
        last_gateway: store.and_then(|(store, portal)| store.last_gateway(portal)),
        session_dir: store.filter(|_| verbose).map(|(store, _)| store.dir().to_path_buf()),
    }
}

fn find_vpnc_script(locations: &[&str]) -> Option<PathBuf> {
    locations
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

fn detect_openconnect_version() -> Option<String> {
    let output = Command::new("openconnect").arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8(output.stdout).ok()?;
    stdout.lines().next().map(|line| line.trim().to_string())
}

fn or_missing(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| NOT_FOUND.to_string())
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== gp-connect diagnose ==")?;
        writeln!(f, "host.os_version={}", self.os_version)?;
        writeln!(f, "host.device={}", self.device)?;

        match &self.certificate {
            CertificateStatus::NotSpecified => writeln!(f, "certificate.mode=not-specified")?,
            CertificateStatus::HardwareToken => writeln!(f, "certificate.mode=pkcs11-uri")?,
            CertificateStatus::File { path, exists } => {
                writeln!(f, "certificate.mode=file-path")?;
                writeln!(f, "certificate.path={}", path.display())?;
                writeln!(f, "certificate.exists={}", exists)?;
            }
        }

        writeln!(f, "runtime.vpnc_script={}", or_missing(&self.vpnc_script))?;
        writeln!(f, "runtime.hip_wrapper={}", or_missing(&self.hip_wrapper))?;
        writeln!(
            f,
            "runtime.openconnect={}",
            self.openconnect.as_deref().unwrap_or("<not-detected>")
        )?;
        writeln!(f, "session.last_gateway={}", self.last_gateway.as_deref().unwrap_or("<none>"))?;
        if let Some(dir) = &self.session_dir {
            writeln!(f, "session.dir={}", dir.display())?;
        }
        Ok(())
    }
}
