//! Signing catalog and trust store.
//!
//! Linux has no kernel code-signing subsystem. Instead, a catalog directory
//! holds one entry per trusted binary, named `<hex sha256>.json`, binding the
//! image digest to a signing identity. Each entry is signed with Ed25519 by a
//! catalog signer; the [`TrustStore`] says which signer keys are trusted and
//! which are revoked.
//!
//! # Signed Message
//!
//! The signature covers a domain-separated encoding of the digest and the
//! identity fields, each length-prefixed (u32 big-endian). Entitlements are
//! sorted and deduplicated first, so their order in the entry file does not
//! matter.
//!
//! # Security Considerations
//!
//! - Catalog files are looked up by a digest the daemon computed itself,
//!   never by a name supplied by the peer
//! - Signatures are checked with `verify_strict` (no malleable encodings)
//! - A signer is only trusted for the common name it is configured with

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use battd_core::config::CatalogConfig;
use battd_core::identity::VerifierError;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain separator of the signed message.
const SIGNING_DOMAIN: &[u8] = b"battd-catalog-v1\0";

/// Read size used when hashing images.
const DIGEST_CHUNK: usize = 64 * 1024;

/// SHA-256 image digest.
pub type ImageDigest = [u8; 32];

/// Catalog and trust-store errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Reading or writing the catalog failed.
    #[error("catalog I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catalog entry could not be parsed.
    #[error("invalid catalog entry {path}: {reason}")]
    Parse {
        /// Entry file.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A key or signature is not well formed.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// Which value.
        what: &'static str,
        /// Why.
        reason: String,
    },
}

impl CatalogError {
    fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

impl From<CatalogError> for VerifierError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Io(e) => Self::subsystem(format!("catalog: {e}")),
            other => Self::Malformed {
                reason: other.to_string(),
            },
        }
    }
}

/// One signed catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CatalogEntry {
    /// Bundle/service identifier.
    pub identifier: String,
    /// Team identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_identifier: Option<String>,
    /// Signer common name.
    pub common_name: String,
    /// Signed capability declarations.
    #[serde(default)]
    pub entitlements: Vec<String>,
    /// Hex Ed25519 public key of the catalog signer.
    pub public_key: String,
    /// Hex Ed25519 signature.
    pub signature: String,
}

impl CatalogEntry {
    /// Decoded signer key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, CatalogError> {
        parse_public_key(&self.public_key)
    }

    /// Returns `true` if the signature verifies for `digest`.
    ///
    /// Malformed keys or signatures do not verify.
    #[must_use]
    pub fn verify(&self, digest: &ImageDigest) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let mut raw = [0u8; 64];
        if hex::decode_to_slice(&self.signature, &mut raw).is_err() {
            return false;
        }
        let message = self.signing_message(digest);
        key.verify_strict(&message, &Signature::from_bytes(&raw))
            .is_ok()
    }

    /// Entitlements as a set.
    #[must_use]
    pub fn entitlement_set(&self) -> BTreeSet<String> {
        self.entitlements.iter().cloned().collect()
    }

    fn signing_message(&self, digest: &ImageDigest) -> Vec<u8> {
        let mut message = Vec::with_capacity(256);
        message.extend_from_slice(SIGNING_DOMAIN);
        message.extend_from_slice(digest);
        put_field(&mut message, self.identifier.as_bytes());
        match &self.team_identifier {
            Some(team) => {
                message.push(1);
                put_field(&mut message, team.as_bytes());
            },
            None => message.push(0),
        }
        put_field(&mut message, self.common_name.as_bytes());

        let entitlements = self.entitlement_set();
        put_len(&mut message, entitlements.len());
        for entitlement in &entitlements {
            put_field(&mut message, entitlement.as_bytes());
        }
        message
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) {
    // Fields longer than u32::MAX cannot come from a parsed JSON file.
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
}

fn put_field(buf: &mut Vec<u8>, field: &[u8]) {
    put_len(buf, field.len());
    buf.extend_from_slice(field);
}

/// Identity fields of an image to be signed into the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageIdentity {
    /// Bundle/service identifier.
    pub identifier: String,
    /// Team identifier.
    pub team_identifier: Option<String>,
    /// Signer common name.
    pub common_name: String,
    /// Entitlements.
    pub entitlements: Vec<String>,
}

/// Produces a signed catalog entry for an image.
#[must_use]
pub fn sign_image(key: &SigningKey, digest: &ImageDigest, identity: ImageIdentity) -> CatalogEntry {
    let mut entry = CatalogEntry {
        identifier: identity.identifier,
        team_identifier: identity.team_identifier,
        common_name: identity.common_name,
        entitlements: identity.entitlements,
        public_key: hex::encode(key.verifying_key().as_bytes()),
        signature: String::new(),
    };
    let signature = key.sign(&entry.signing_message(digest));
    entry.signature = hex::encode(signature.to_bytes());
    entry
}

/// Hashes an open image with positional reads, leaving the file offset
/// untouched.
pub fn digest_file(file: &File) -> io::Result<ImageDigest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = file.read_at(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok(hasher.finalize().into())
}

/// Hashes the file at `path`.
pub fn digest_path(path: &Path) -> io::Result<ImageDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, CatalogError> {
    let mut raw = [0u8; 32];
    hex::decode_to_slice(hex_key, &mut raw)
        .map_err(|e| CatalogError::malformed("public key", e.to_string()))?;
    VerifyingKey::from_bytes(&raw).map_err(|e| CatalogError::malformed("public key", e.to_string()))
}

/// Directory of catalog entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    dir: PathBuf,
}

impl Catalog {
    /// Open the catalog at `dir`. The directory need not exist yet.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Catalog directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, digest: &ImageDigest) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    /// Looks up the entry for `digest`; `None` if the image is not catalogued.
    pub fn lookup(&self, digest: &ImageDigest) -> Result<Option<CatalogEntry>, CatalogError> {
        let path = self.entry_path(digest);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CatalogError::Parse {
                path,
                reason: e.to_string(),
            })
    }

    /// Writes `entry` for `digest`, creating the directory if needed.
    pub fn install(&self, digest: &ImageDigest, entry: &CatalogEntry) -> Result<PathBuf, CatalogError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.entry_path(digest);
        let json = serde_json::to_vec_pretty(entry).map_err(|e| CatalogError::Parse {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Outcome of checking a catalog entry against the trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Assessment {
    /// The signature verifies for the digest.
    pub signature_valid: bool,
    /// The signer is trusted for the entry's common name.
    pub trusted: bool,
    /// The signer key is revoked.
    pub revoked: bool,
}

/// Trusted and revoked catalog signer keys.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    signers: HashMap<[u8; 32], String>,
    revoked: HashSet<[u8; 32]>,
}

impl TrustStore {
    /// Create an empty store; nothing is trusted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the store from `[catalog]`.
    pub fn from_config(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let mut store = Self::new();
        for signer in &config.trusted_signers {
            let key = parse_public_key(&signer.public_key)?;
            store = store.with_signer(key, signer.common_name.clone());
        }
        for revoked in &config.revoked_keys {
            store = store.with_revoked(parse_public_key(revoked)?);
        }
        Ok(store)
    }

    /// Trust `key` for entries naming `common_name`.
    #[must_use]
    pub fn with_signer(mut self, key: VerifyingKey, common_name: impl Into<String>) -> Self {
        self.signers.insert(key.to_bytes(), common_name.into());
        self
    }

    /// Revoke `key`.
    #[must_use]
    pub fn with_revoked(mut self, key: VerifyingKey) -> Self {
        self.revoked.insert(key.to_bytes());
        self
    }

    /// Number of trusted signers.
    #[must_use]
    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    /// Checks `entry` for `digest`.
    #[must_use]
    pub fn assess(&self, entry: &CatalogEntry, digest: &ImageDigest) -> Assessment {
        let key = entry.verifying_key().ok().map(|k| k.to_bytes());
        let trusted = key
            .as_ref()
            .and_then(|k| self.signers.get(k))
            .is_some_and(|name| *name == entry.common_name);
        Assessment {
            signature_valid: entry.verify(digest),
            trusted,
            revoked: key.as_ref().is_some_and(|k| self.revoked.contains(k)),
        }
    }
}

#[cfg(test)]
mod tests {
    use battd_core::config::TrustedSignerConfig;
    use tempfile::TempDir;

    use super::*;

    const DIGEST: ImageDigest = [7u8; 32];

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn identity() -> ImageIdentity {
        ImageIdentity {
            identifier: "me.mhaeuser.batterytoolkit".to_string(),
            team_identifier: Some("TEAM123".to_string()),
            common_name: "BatteryToolkit Signer".to_string(),
            entitlements: vec!["net.client".to_string(), "fs.read".to_string()],
        }
    }

    #[test]
    fn test_signed_entry_verifies() {
        let entry = sign_image(&key(1), &DIGEST, identity());
        assert!(entry.verify(&DIGEST));
        assert!(!entry.verify(&[8u8; 32]));
    }

    #[test]
    fn test_tampered_fields_fail_verification() {
        let entry = sign_image(&key(1), &DIGEST, identity());

        let mut renamed = entry.clone();
        renamed.common_name = "BatteryToolkit Signer ".to_string();
        assert!(!renamed.verify(&DIGEST));

        let mut extra = entry.clone();
        extra.entitlements.push("security.private.root".to_string());
        assert!(!extra.verify(&DIGEST));

        let mut no_team = entry;
        no_team.team_identifier = None;
        assert!(!no_team.verify(&DIGEST));
    }

    #[test]
    fn test_entitlement_order_is_irrelevant() {
        let mut entry = sign_image(&key(1), &DIGEST, identity());
        entry.entitlements.reverse();
        assert!(entry.verify(&DIGEST));
    }

    #[test]
    fn test_malformed_signature_does_not_verify() {
        let mut entry = sign_image(&key(1), &DIGEST, identity());
        entry.signature = "zz".to_string();
        assert!(!entry.verify(&DIGEST));
    }

    #[test]
    fn test_catalog_install_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::new(tmp.path().join("catalog"));
        assert!(catalog.lookup(&DIGEST).unwrap().is_none());

        let entry = sign_image(&key(2), &DIGEST, identity());
        catalog.install(&DIGEST, &entry).unwrap();
        assert_eq!(catalog.lookup(&DIGEST).unwrap(), Some(entry));
    }

    #[test]
    fn test_catalog_rejects_unknown_fields() {
        let tmp = TempDir::new().unwrap();
        let catalog = Catalog::new(tmp.path());
        fs::write(
            tmp.path().join(format!("{}.json", hex::encode(DIGEST))),
            r#"{"identifier":"x","commonName":"y","publicKey":"","signature":"","trusted":true}"#,
        )
        .unwrap();
        let err = catalog.lookup(&DIGEST).unwrap_err();
        assert!(matches!(err, CatalogError::Parse { .. }));
        assert!(matches!(VerifierError::from(err), VerifierError::Malformed { .. }));
    }

    #[test]
    fn test_trust_store_assessment() {
        let signer = key(3);
        let entry = sign_image(&signer, &DIGEST, identity());

        let empty = TrustStore::new().assess(&entry, &DIGEST);
        assert!(empty.signature_valid);
        assert!(!empty.trusted);

        let store = TrustStore::new().with_signer(signer.verifying_key(), "BatteryToolkit Signer");
        let trusted = store.assess(&entry, &DIGEST);
        assert!(trusted.trusted && !trusted.revoked);

        let wrong_name = TrustStore::new().with_signer(signer.verifying_key(), "Other Signer");
        assert!(!wrong_name.assess(&entry, &DIGEST).trusted);

        let revoked = store.with_revoked(signer.verifying_key());
        assert!(revoked.assess(&entry, &DIGEST).revoked);
    }

    #[test]
    fn test_trust_store_from_config() {
        let signer = key(4);
        let config = CatalogConfig {
            trusted_signers: vec![TrustedSignerConfig {
                common_name: "BatteryToolkit Signer".to_string(),
                public_key: hex::encode(signer.verifying_key().as_bytes()),
            }],
            revoked_keys: vec![hex::encode(key(5).verifying_key().as_bytes())],
            ..CatalogConfig::default()
        };
        let store = TrustStore::from_config(&config).unwrap();
        assert_eq!(store.signer_count(), 1);

        let bad = CatalogConfig {
            revoked_keys: vec!["abcd".to_string()],
            ..CatalogConfig::default()
        };
        assert!(matches!(
            TrustStore::from_config(&bad),
            Err(CatalogError::Malformed { .. })
        ));
    }

    #[test]
    fn test_digest_file_matches_path_and_keeps_offset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image");
        fs::write(&path, vec![0xAB; DIGEST_CHUNK * 2 + 17]).unwrap();

        let file = File::open(&path).unwrap();
        let first = digest_file(&file).unwrap();
        let second = digest_file(&file).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, digest_path(&path).unwrap());
    }
}
