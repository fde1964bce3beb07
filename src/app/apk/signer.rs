use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir};
use tracing::info;
use zip::{ZipArchive, ZipWriter};

use crate::app::adb::runner::{CommandRunner, DEFAULT_TOOL_TIMEOUT};
use crate::app::apk::keystore::Keystore;
use crate::app::apk::SIGNATURE_DIR;
use crate::app::error::{AppError, Result, SigningPhase};

/// Removes every entry under the signature directory, rewriting the archive in place.
/// Returns how many entries were dropped; an unsigned package is left untouched.
pub fn strip_signature(path: &Path) -> std::result::Result<usize, String> {
    let file = File::open(path).map_err(|err| format!("Failed to open package: {err}"))?;
    let mut archive = ZipArchive::new(file).map_err(|err| format!("Invalid package: {err}"))?;
    let removed = archive
        .file_names()
        .filter(|name| name.starts_with(SIGNATURE_DIR))
        .count();
    if removed == 0 {
        return Ok(0);
    }

    let stripped_path = path.with_extension("stripped");
    let output = File::create(&stripped_path)
        .map_err(|err| format!("Failed to create stripped package: {err}"))?;
    let mut writer = ZipWriter::new(output);
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|err| format!("Failed to read entry {index}: {err}"))?;
        if entry.name().starts_with(SIGNATURE_DIR) {
            continue;
        }
        writer
            .raw_copy_file(entry)
            .map_err(|err| format!("Failed to copy entry {index}: {err}"))?;
    }
    writer
        .finish()
        .map_err(|err| format!("Failed to finish stripped package: {err}"))?;
    fs::rename(&stripped_path, path)
        .map_err(|err| format!("Failed to replace package: {err}"))?;
    Ok(removed)
}

/// Re-signs packages with one signing identity so instrumentation can attach to them.
#[derive(Clone)]
pub struct PackageSigner {
    jarsigner: String,
    zipalign: String,
    keystore: Keystore,
    runner: Arc<dyn CommandRunner>,
}

impl PackageSigner {
    pub fn new(
        jarsigner: impl Into<String>,
        zipalign: impl Into<String>,
        keystore: Keystore,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            jarsigner: jarsigner.into(),
            zipalign: zipalign.into(),
            keystore,
            runner,
        }
    }

    /// Copy, unsign, sign, align, then swap the result over `apk`. Every step works inside
    /// a scratch directory, so a failure leaves `apk` as it was.
    pub fn resign(&self, apk: &Path) -> Result<()> {
        info!(apk = %apk.display(), "resign package");
        let workspace = TempDir::new()
            .map_err(|err| AppError::signing(SigningPhase::Copy, format!("Failed to create temp dir: {err}")))?;
        let unsigned = workspace.path().join("unsigned.apk");
        let unaligned = workspace.path().join("unaligned.apk");
        let aligned = workspace.path().join("aligned.apk");

        fs::copy(apk, &unsigned)
            .map_err(|err| AppError::signing(SigningPhase::Copy, format!("{}: {err}", apk.display())))?;

        let removed = strip_signature(&unsigned)
            .map_err(|message| AppError::signing(SigningPhase::Unsign, message))?;
        if removed == 0 {
            info!("package wasn't signed, nothing to unsign");
        } else {
            info!(entries = removed, "removed existing signature");
        }

        self.keystore
            .sign(&self.jarsigner, self.runner.as_ref(), &unsigned, &unaligned)?;

        let align_args = vec![
            "-f".to_string(),
            "4".to_string(),
            unaligned.to_string_lossy().to_string(),
            aligned.to_string_lossy().to_string(),
        ];
        self.runner
            .run_checked(&self.zipalign, &align_args, DEFAULT_TOOL_TIMEOUT)
            .map_err(|err| AppError::signing(SigningPhase::Align, err.to_string()))?;
        if !aligned.is_file() {
            return Err(AppError::signing(
                SigningPhase::Align,
                format!("{} produced no output", self.zipalign),
            ));
        }

        replace_file(&aligned, apk)
            .map_err(|message| AppError::signing(SigningPhase::Replace, message))?;
        Ok(())
    }
}

/// Copies `src` next to `dest` and renames it into place.
fn replace_file(src: &Path, dest: &Path) -> std::result::Result<(), String> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staged = NamedTempFile::new_in(parent).map_err(|err| format!("Failed to stage file: {err}"))?;
    fs::copy(src, staged.path()).map_err(|err| format!("Failed to stage file: {err}"))?;
    staged
        .persist(dest)
        .map_err(|err| format!("Failed to move package into place: {}", err.error))?;
    Ok(())
}
