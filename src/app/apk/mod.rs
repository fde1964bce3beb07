pub mod fingerprint;
pub mod keystore;
pub mod manifest;
pub mod signer;

/// Archive directory holding signature metadata.
pub const SIGNATURE_DIR: &str = "META-INF/";
