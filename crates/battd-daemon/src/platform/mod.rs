//! Linux backends for the trust pipeline.
//!
//! - [`procfs`]: per-process kernel state from `/proc`
//! - [`catalog`]: signing catalog and trust store
//! - [`linux`]: [`ProcfsVerifier`], the code-integrity backend

pub mod catalog;
pub mod linux;
pub mod procfs;

pub use catalog::{Catalog, CatalogEntry, CatalogError, ImageIdentity, TrustStore, sign_image};
pub use linux::{ProcessCode, ProcfsVerifier};
pub use procfs::ProcFs;
