//! battd-daemon - privileged battery-management daemon
//!
//! This library holds everything behind the `battd` binary: the control
//! socket, the Linux code-integrity backend that feeds the authorization
//! gate from `battd-core`, the privileged power operations and metrics.
//!
//! # Runtime Requirements
//!
//! Identity resolution hashes executables and reads `/proc`. Connection
//! tasks run it on tokio's blocking pool, so a multi-threaded runtime is
//! expected.
//!
//! # Modules
//!
//! - [`metrics`]: Prometheus metrics for the authorization boundary
//! - [`platform`]: `/proc` reader, signing catalog and [`platform::ProcfsVerifier`]
//! - [`power`]: the privileged operation surface ([`power::PowerOperations`])
//! - [`protocol`]: control-socket protocol, listener and connection handling
//! - [`state`]: state shared by connection tasks

pub mod metrics;
pub mod platform;
pub mod power;
pub mod protocol;
pub mod state;
