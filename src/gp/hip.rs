//! Host Information Profile (HIP) reports
//!
//! Gateways that enforce posture want a report describing the host before
//! they hand out tunnel configuration. The report comes from an external
//! wrapper script when one is installed (the openconnect `hipreport.sh`
//! convention) and from a minimal built-in generator otherwise.

use crate::error::GpError;
use md5::{Digest, Md5};
use quick_xml::escape::escape;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Overrides wrapper discovery when set to an executable path
pub const HIP_WRAPPER_ENV: &str = "GP_CONNECT_HIP_WRAPPER";

const HIP_WRAPPER_LOCATIONS: &[&str] = &[
    "/usr/libexec/gp-connect/hipreport.sh",
    #[cfg(target_arch = "x86_64")]
    "/usr/lib/x86_64-linux-gnu/openconnect/hipreport.sh",
    #[cfg(target_arch = "aarch64")]
    "/usr/lib/aarch64-linux-gnu/openconnect/hipreport.sh",
    "/usr/lib/openconnect/hipreport.sh",
    "/usr/libexec/openconnect/hipreport.sh",
    #[cfg(target_os = "macos")]
    "/opt/homebrew/opt/openconnect/libexec/openconnect/hipreport.sh",
];

/// Token fields that change on every login and must not move the fingerprint
const VOLATILE_TOKEN_FIELDS: &[&str] = &["authcookie", "preferred-ip", "preferred-ipv6"];

/// Everything a report generator needs to know about the session
#[derive(Debug, Clone)]
pub struct HipContext {
    pub user: String,
    pub domain: String,
    pub host: String,
    pub client_ip: String,
    pub client_os: String,
    pub os_version: String,
    pub client_version: String,
    /// Gateway bootstrap token (`authcookie=...&portal=...`)
    pub token: String,
}

impl HipContext {
    /// MD5 of the bootstrap token with the per-login fields removed, sent to
    /// the gateway as the report's `md5` key
    pub fn fingerprint(&self) -> String {
        let stable: Vec<&str> = self
            .token
            .split('&')
            .filter(|pair| {
                let key = pair.split('=').next().unwrap_or_default();
                !VOLATILE_TOKEN_FIELDS.contains(&key)
            })
            .collect();

        hex::encode(Md5::digest(stable.join("&").as_bytes()))
    }
}

/// A generated report, keyed by user, host and policy version. Built fresh
/// for every attempt.
#[derive(Debug, Clone)]
pub struct HipReport {
    pub user: String,
    pub host: String,
    pub policy_version: String,
    pub document: String,
}

impl HipReport {
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.user, &self.host, &self.policy_version)
    }
}

pub trait HipReporter: Send + Sync {
    /// Short description for logs and diagnostics
    fn name(&self) -> String;

    fn generate(&self, ctx: &HipContext, policy_version: &str) -> Result<HipReport, GpError>;
}

/// Minimal report: host information only, no security products
pub struct BuiltinHipReporter;

impl HipReporter for BuiltinHipReporter {
    fn name(&self) -> String {
        "built-in".to_string()
    }

    fn generate(&self, ctx: &HipContext, policy_version: &str) -> Result<HipReport, GpError> {
        let document = format!(
            r#"<hip-report name="hip-report">
  <md5-sum>{md5}</md5-sum>
  <user-name>{user}</user-name>
  <domain>{domain}</domain>
  <host-name>{host}</host-name>
  <ip-address>{ip}</ip-address>
  <generate-time>{time}</generate-time>
  <hip-report-version>4</hip-report-version>
  <categories>
    <entry name="host-info">
      <client-version>{client_version}</client-version>
      <os>{os_version}</os>
      <os-vendor>{os_vendor}</os-vendor>
      <domain>{domain}</domain>
      <host-name>{host}</host-name>
    </entry>
  </categories>
</hip-report>
"#,
            md5 = escape(policy_version),
            user = escape(ctx.user.as_str()),
            domain = escape(ctx.domain.as_str()),
            host = escape(ctx.host.as_str()),
            ip = escape(ctx.client_ip.as_str()),
            time = format_generate_time(SystemTime::now()),
            client_version = escape(ctx.client_version.as_str()),
            os_version = escape(ctx.os_version.as_str()),
            os_vendor = escape(ctx.client_os.as_str()),
        );

        Ok(HipReport {
            user: ctx.user.clone(),
            host: ctx.host.clone(),
            policy_version: policy_version.to_string(),
            document,
        })
    }
}

/// Runs an external `hipreport.sh`-style script and uses its stdout
pub struct WrapperHipReporter {
    path: PathBuf,
}

impl WrapperHipReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HipReporter for WrapperHipReporter {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn generate(&self, ctx: &HipContext, policy_version: &str) -> Result<HipReport, GpError> {
        debug!("Running HIP wrapper {}", self.path.display());

        let output = Command::new(&self.path)
            .args(["--cookie", ctx.token.as_str()])
            .args(["--client-ip", ctx.client_ip.as_str()])
            .args(["--md5", policy_version])
            .args(["--client-os", ctx.client_os.as_str()])
            .output()
            .map_err(|e| {
                GpError::HipSubmissionFailed(format!(
                    "failed to run {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GpError::HipSubmissionFailed(format!(
                "{} exited with {}: {}",
                self.path.display(),
                output.status,
                stderr.trim()
            )));
        }

        let document = String::from_utf8(output.stdout).map_err(|_| {
            GpError::HipSubmissionFailed(format!("{} produced non-UTF-8 output", self.path.display()))
        })?;
        if !document.trim_start().starts_with('<') {
            return Err(GpError::HipSubmissionFailed(format!(
                "{} produced no HIP report",
                self.path.display()
            )));
        }

        Ok(HipReport {
            user: ctx.user.clone(),
            host: ctx.host.clone(),
            policy_version: policy_version.to_string(),
            document,
        })
    }
}

/// Wrapper if one can be found, built-in generator otherwise
pub fn reporter_for(wrapper: Option<PathBuf>) -> Arc<dyn HipReporter> {
    match wrapper {
        Some(path) => Arc::new(WrapperHipReporter::new(path)),
        None => Arc::new(BuiltinHipReporter),
    }
}

/// Locate the posture wrapper: env override, then configured path, then
/// the usual install locations
pub fn find_hip_wrapper(configured: Option<&str>) -> Option<PathBuf> {
    let env_override = std::env::var(HIP_WRAPPER_ENV).ok();
    let overrides = [env_override.as_deref(), configured];
    resolve_hip_wrapper(&overrides, HIP_WRAPPER_LOCATIONS)
}

fn resolve_hip_wrapper(overrides: &[Option<&str>], locations: &[&str]) -> Option<PathBuf> {
    overrides
        .iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .chain(locations.iter())
        .map(Path::new)
        .find(|path| is_executable(path))
        .map(Path::to_path_buf)
}

pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// `MM/DD/YYYY HH:MM:SS` in UTC
fn format_generate_time(now: SystemTime) -> String {
    let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:02}/{:02}/{:04} {:02}:{:02}:{:02}",
        month,
        day,
        year,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Howard Hinnant's days-to-civil conversion
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
