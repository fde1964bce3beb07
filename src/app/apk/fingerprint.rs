use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use tempfile::TempDir;
use tracing::info;
use zip::ZipArchive;

use crate::app::adb::runner::{CommandRunner, DEFAULT_TOOL_TIMEOUT};
use crate::app::apk::SIGNATURE_DIR;
use crate::app::error::{AppError, Result};

/// MD5 digest of a signing certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertificateFingerprint([u8; 16]);

impl CertificateFingerprint {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        f.write_str(&rendered)
    }
}

impl FromStr for CertificateFingerprint {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        let pairs: Vec<&str> = value.trim().split(':').collect();
        if pairs.len() != 16 {
            return Err(AppError::Fingerprint(format!(
                "Expected 16 colon-separated bytes, got '{value}'"
            )));
        }
        let mut bytes = [0u8; 16];
        for (slot, pair) in bytes.iter_mut().zip(pairs) {
            if pair.len() != 2 {
                return Err(AppError::Fingerprint(format!("Invalid byte '{pair}' in '{value}'")));
            }
            *slot = u8::from_str_radix(pair, 16)
                .map_err(|_| AppError::Fingerprint(format!("Invalid byte '{pair}' in '{value}'")))?;
        }
        Ok(Self(bytes))
    }
}

/// First MD5 fingerprint in `keytool -printcert` output.
pub fn extract_md5_fingerprint(output: &str) -> Result<CertificateFingerprint> {
    let re = Regex::new(r"MD5.*?((?:[a-fA-F\d]{2}:){15}[a-fA-F\d]{2})")
        .map_err(|err| AppError::Fingerprint(format!("Invalid pattern: {err}")))?;
    let captured = re
        .captures(output)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| AppError::Fingerprint(format!("No MD5 fingerprint found:\n {output}")))?;
    captured.parse()
}

fn is_certificate_entry(name: &str) -> bool {
    let Some(file_name) = name.strip_prefix(SIGNATURE_DIR) else {
        return false;
    };
    if file_name.is_empty() || file_name.contains('/') {
        return false;
    }
    let upper = file_name.to_ascii_uppercase();
    upper.ends_with(".RSA") || upper.ends_with(".DSA") || upper.ends_with(".EC")
}

/// Extracts the single certificate block of `apk` into `dir`.
pub fn extract_certificate(apk: &Path, dir: &Path) -> Result<PathBuf> {
    let file = File::open(apk)
        .map_err(|err| AppError::Fingerprint(format!("Failed to open {}: {err}", apk.display())))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| AppError::Fingerprint(format!("Invalid package {}: {err}", apk.display())))?;
    let names: Vec<String> = archive
        .file_names()
        .filter(|name| is_certificate_entry(name))
        .map(str::to_string)
        .collect();

    match names.len() {
        0 => {
            return Err(AppError::Fingerprint(
                "No certificate file found in META-INF. Cannot proceed.".to_string(),
            ))
        }
        1 => {}
        _ => {
            return Err(AppError::Fingerprint(format!(
                "More than one certificate file found in META-INF ({}). Cannot proceed.",
                names.join(", ")
            )))
        }
    }

    let name = &names[0];
    let target_dir = dir.join(SIGNATURE_DIR.trim_end_matches('/'));
    fs::create_dir_all(&target_dir)?;
    let file_name = Path::new(name)
        .file_name()
        .ok_or_else(|| AppError::Fingerprint(format!("Invalid entry name {name}")))?;
    let target = target_dir.join(file_name);
    let mut entry = archive
        .by_name(name)
        .map_err(|err| AppError::Fingerprint(format!("Failed to read {name}: {err}")))?;
    let mut output = File::create(&target)?;
    io::copy(&mut entry, &mut output)?;
    Ok(target)
}

pub struct FingerprintExtractor {
    keytool: String,
    runner: Arc<dyn CommandRunner>,
}

impl FingerprintExtractor {
    pub fn new(keytool: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            keytool: keytool.into(),
            runner,
        }
    }

    pub fn fingerprint(&self, apk: &Path) -> Result<CertificateFingerprint> {
        let scratch = TempDir::new()?;
        let certificate = extract_certificate(apk, scratch.path())?;
        let args = vec![
            "-v".to_string(),
            "-printcert".to_string(),
            "-J-Dfile.encoding=utf-8".to_string(),
            "-file".to_string(),
            certificate.to_string_lossy().to_string(),
        ];
        let output = self
            .runner
            .run_checked(&self.keytool, &args, DEFAULT_TOOL_TIMEOUT)
            .map_err(|err| AppError::Fingerprint(err.to_string()))?;
        let fingerprint = extract_md5_fingerprint(&output.stdout)?;
        info!(apk = %apk.display(), fingerprint = %fingerprint, "signing certificate fingerprint");
        Ok(fingerprint)
    }
}
