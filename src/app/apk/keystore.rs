use std::path::{Path, PathBuf};

use tracing::info;

use crate::app::adb::runner::{CommandRunner, DEFAULT_TOOL_TIMEOUT};
use crate::app::config::{expand_home, load_keystore_settings, KeystoreSettings};
use crate::app::error::{AppError, Result, SigningPhase};

const DEBUG_KEYSTORE_PASSWORD: &str = "android";
const DEBUG_KEYSTORE_ALIAS: &str = "androiddebugkey";
const SIGNATURE_ALGORITHM: &str = "SHA1withRSA";
const DIGEST_ALGORITHM: &str = "SHA1";

/// A signing identity: key store plus the alias of the key used to sign packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keystore {
    pub location: PathBuf,
    pub password: String,
    pub alias: String,
    pub alias_password: Option<String>,
}

impl Keystore {
    pub fn debug_keystore() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            location: home.join(".android").join("debug.keystore"),
            password: DEBUG_KEYSTORE_PASSWORD.to_string(),
            alias: DEBUG_KEYSTORE_ALIAS.to_string(),
            alias_password: None,
        }
    }

    fn from_settings(settings: KeystoreSettings) -> Option<Self> {
        let location = settings.keystore_location?;
        Some(Self {
            location: expand_home(&location),
            password: settings
                .keystore_password
                .unwrap_or_else(|| DEBUG_KEYSTORE_PASSWORD.to_string()),
            alias: settings
                .keystore_alias
                .unwrap_or_else(|| DEBUG_KEYSTORE_ALIAS.to_string()),
            alias_password: settings.keystore_alias_password,
        })
    }

    /// Candidates in preference order: the configured identity, then the SDK debug key.
    pub fn candidates(settings: Option<KeystoreSettings>) -> Vec<Self> {
        let mut candidates = Vec::new();
        if let Some(configured) = settings.and_then(Self::from_settings) {
            candidates.push(configured);
        }
        candidates.push(Self::debug_keystore());
        candidates
    }

    /// First candidate whose key store file exists.
    pub fn first_available(settings_path: &Path) -> Result<Self> {
        let settings = load_keystore_settings(settings_path)?;
        Self::candidates(settings)
            .into_iter()
            .find(|keystore| keystore.location.is_file())
            .ok_or_else(|| {
                AppError::signing(
                    SigningPhase::Sign,
                    "No keystore found. Create ~/.android/debug.keystore or configure keystore_location",
                )
            })
    }

    pub fn sign_args(&self, src: &Path, dest: &Path) -> Vec<String> {
        let mut args = vec![
            "-sigalg".to_string(),
            SIGNATURE_ALGORITHM.to_string(),
            "-digestalg".to_string(),
            DIGEST_ALGORITHM.to_string(),
            "-signedjar".to_string(),
            dest.to_string_lossy().to_string(),
            "-storepass".to_string(),
            self.password.clone(),
        ];
        if let Some(key_password) = &self.alias_password {
            args.push("-keypass".to_string());
            args.push(key_password.clone());
        }
        args.push("-keystore".to_string());
        args.push(self.location.to_string_lossy().to_string());
        args.push(src.to_string_lossy().to_string());
        args.push(self.alias.clone());
        args
    }

    pub fn sign(
        &self,
        jarsigner: &str,
        runner: &dyn CommandRunner,
        src: &Path,
        dest: &Path,
    ) -> Result<()> {
        info!(keystore = %self.location.display(), alias = %self.alias, "signing package");
        runner
            .run_checked(jarsigner, &self.sign_args(src, dest), DEFAULT_TOOL_TIMEOUT)
            .map_err(|err| AppError::signing(SigningPhase::Sign, err.to_string()))?;
        if !dest.is_file() {
            return Err(AppError::signing(
                SigningPhase::Sign,
                format!("{jarsigner} produced no output at {}", dest.display()),
            ));
        }
        Ok(())
    }
}
