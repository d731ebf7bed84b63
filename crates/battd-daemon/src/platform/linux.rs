//! Catalog-backed code-integrity verifier for Linux.
//!
//! [`ProcfsVerifier`] answers signing queries from `/proc` and the signing
//! catalog:
//!
//! | Flag                          | Source                                         |
//! |-------------------------------|------------------------------------------------|
//! | `valid`                       | catalog entry exists and its signature holds   |
//! | `adhoc`                       | no entry, or signer not trusted for the name   |
//! | `revoked`                     | signer key is revoked                          |
//! | `debugger_attached`           | `TracerPid` is non-zero                        |
//! | `hardened`                    | `NoNewPrivs` is set                            |
//! | `library_validation_disabled` | loader override variables in the environment  |
//!
//! # Invariants
//!
//! - [INV-PROC-001] Every query re-checks that the pid still carries the
//!   start time recorded in the audit token, before and after reading
//! - [INV-PROC-002] Dynamic queries hash the inode the process is executing,
//!   through the handle opened by `copy_guest`

use std::fs::File;
use std::os::unix::fs::MetadataExt;

use battd_core::credentials::ConnectionCredential;
use battd_core::identity::{
    CodeIdentity, CodeStatusFlags, IdentityVerifier, ImageGeneration, SigningQuery, VerifierError,
};
use tracing::debug;

use super::catalog::{Catalog, ImageDigest, TrustStore, digest_file, digest_path};
use super::procfs::{ProcFs, classify};

/// Code handle for one process instance.
///
/// Holds the executing image open so later queries hash the same inode.
#[derive(Debug)]
pub struct ProcessCode {
    pid: u32,
    start_time: u64,
    exe: File,
}

impl ProcessCode {
    /// Process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }
}

/// [`IdentityVerifier`] over `/proc` and a signing catalog.
#[derive(Debug, Clone)]
pub struct ProcfsVerifier {
    procfs: ProcFs,
    catalog: Catalog,
    trust: TrustStore,
}

impl ProcfsVerifier {
    /// Create a verifier.
    #[must_use]
    pub const fn new(procfs: ProcFs, catalog: Catalog, trust: TrustStore) -> Self {
        Self {
            procfs,
            catalog,
            trust,
        }
    }

    /// The proc tree queried.
    #[must_use]
    pub const fn procfs(&self) -> &ProcFs {
        &self.procfs
    }

    fn check_generation(&self, pid: u32, expected: u64) -> Result<(), VerifierError> {
        let stat = self.procfs.stat(pid)?;
        if stat.start_time == expected {
            Ok(())
        } else {
            debug!(pid, expected, actual = stat.start_time, "pid reused");
            Err(VerifierError::TokenMismatch { pid })
        }
    }

    fn image_digest(&self, code: &ProcessCode, query: SigningQuery) -> Result<ImageDigest, VerifierError> {
        if query.dynamic {
            return digest_file(&code.exe).map_err(|e| classify(code.pid, &e));
        }
        let path = self.procfs.exe_path(code.pid)?;
        digest_path(&path).map_err(|e| VerifierError::Malformed {
            reason: format!("on-disk image {}: {e}", path.display()),
        })
    }
}

impl IdentityVerifier for ProcfsVerifier {
    type Code = ProcessCode;

    fn copy_guest(&self, credential: &ConnectionCredential) -> Result<ProcessCode, VerifierError> {
        let pid = credential.pid();
        let start_time = credential.audit_token().pid_generation();

        self.check_generation(pid, start_time)?;
        let exe = self.procfs.open_exe(pid)?;
        // The pid may have been recycled between the check and the open.
        self.check_generation(pid, start_time)?;

        Ok(ProcessCode {
            pid,
            start_time,
            exe,
        })
    }

    fn copy_signing_information(
        &self,
        code: &ProcessCode,
        query: SigningQuery,
    ) -> Result<CodeIdentity, VerifierError> {
        let digest = self.image_digest(code, query)?;
        let status = self.procfs.status(code.pid)?;
        let loader_overrides = self.procfs.has_loader_overrides(code.pid)?;
        self.check_generation(code.pid, code.start_time)?;

        let mut flags = CodeStatusFlags {
            hardened: status.no_new_privs,
            debugger_attached: status.tracer_pid != 0,
            library_validation_disabled: loader_overrides,
            ..CodeStatusFlags::default()
        };

        let Some(entry) = self.catalog.lookup(&digest)? else {
            debug!(pid = code.pid, digest = %hex::encode(digest), "image not catalogued");
            flags.adhoc = true;
            return Ok(CodeIdentity::new("", "")
                .with_flags(flags)
                .with_image_digest(hex::encode(digest)));
        };

        let assessment = self.trust.assess(&entry, &digest);
        flags.valid = assessment.signature_valid;
        flags.adhoc = !assessment.trusted;
        flags.revoked = assessment.revoked;

        let mut identity = CodeIdentity::new(entry.identifier.clone(), entry.common_name.clone())
            .with_entitlements(entry.entitlement_set())
            .with_flags(flags)
            .with_image_digest(hex::encode(digest));
        if let Some(team) = entry.team_identifier {
            identity = identity.with_team_identifier(team);
        }
        Ok(identity)
    }

    fn image_generation(&self, code: &ProcessCode) -> Result<Option<ImageGeneration>, VerifierError> {
        let metadata = code.exe.metadata().map_err(|e| classify(code.pid, &e))?;
        Ok(Some(ImageGeneration::new(
            metadata.dev(),
            metadata.ino(),
            metadata.ctime(),
        )))
    }

    fn runtime_flags(&self, code: &ProcessCode) -> Result<Option<CodeStatusFlags>, VerifierError> {
        let status = self.procfs.status(code.pid)?;
        let loader_overrides = self.procfs.has_loader_overrides(code.pid)?;
        self.check_generation(code.pid, code.start_time)?;

        Ok(Some(CodeStatusFlags {
            hardened: status.no_new_privs,
            debugger_attached: status.tracer_pid != 0,
            library_validation_disabled: loader_overrides,
            ..CodeStatusFlags::default()
        }))
    }
}
