//! Request dispatch behind the authorization gate.
//!
//! Query commands are answered for any admitted connection. Privileged
//! commands are wrapped in
//! [`AuthorizationGate::authorize_cancellable`](battd_core::AuthorizationGate::authorize_cancellable) and
//! only reach [`PowerOperations`] on an Allow for the current evaluation.
//! Commands that change power state first need the manage right of the
//! peer's user ([`Command::needs_manage_right`]).
//!
//! # Security Considerations
//!
//! Every denial, whatever its kind, becomes [`Status::NotAuthorized`]. The
//! kind and detail are logged by the gate and never sent to the peer.
//!
//! Dispatch blocks on platform queries; callers run it off the async
//! runtime.

use battd_core::{Cancellation, ConnectionAuth, IdentityVerifier};
use serde::Serialize;
use tracing::warn;

use super::messages::{Command, Request, Response, Status};
use crate::power::{PowerError, PowerOperations};
use crate::state::DaemonState;

/// Runs one request for an admitted connection.
pub fn dispatch<V: IdentityVerifier>(
    state: &DaemonState<V>,
    auth: &ConnectionAuth,
    cancel: &Cancellation,
    request: Request,
) -> Response {
    let Request { id, command } = request;
    let power = state.power();

    if !command.is_privileged() {
        return match query(power, &command) {
            Ok(payload) => Response::success(id, payload),
            Err(status) => Response::status(id, status),
        };
    }

    // Denials are logged by the gate; the peer only learns the status.
    if command.needs_manage_right() && state.gate().check_manage_right(auth).is_err() {
        return Response::status(id, Status::NotAuthorized);
    }

    match state
        .gate()
        .authorize_cancellable(auth, cancel, || execute(power, command))
    {
        Ok(Ok(())) => Response::status(id, Status::Success),
        Ok(Err(e)) => {
            warn!(error = %e, "Privileged command failed");
            Response::status(id, status_for(&e))
        },
        Err(_) => Response::status(id, Status::NotAuthorized),
    }
}

fn query(power: &dyn PowerOperations, command: &Command) -> Result<serde_json::Value, Status> {
    match command {
        Command::IsSupported => to_payload(&power.is_supported()),
        Command::GetState => to_payload(&power.state()),
        Command::GetSettings => to_payload(&power.settings()),
        _ => Err(Status::Unknown),
    }
}

fn execute(power: &dyn PowerOperations, command: Command) -> Result<(), PowerError> {
    match command {
        Command::DisablePowerAdapter => power.disable_power_adapter(),
        Command::EnablePowerAdapter => power.enable_power_adapter(),
        Command::ChargeToFull => power.charge_to_full(),
        Command::ChargeToLimit => power.charge_to_limit(),
        Command::DisableCharging => power.disable_charging(),
        Command::PauseActivity => power.pause_activity(),
        Command::ResumeActivity => power.resume_activity(),
        Command::PrepareUpdate => power.prepare_update(),
        Command::FinishUpdate => power.finish_update(),
        Command::SetSettings { settings } => power.set_settings(settings),
        Command::IsSupported | Command::GetState | Command::GetSettings => Ok(()),
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<serde_json::Value, Status> {
    serde_json::to_value(value).map_err(|e| {
        warn!(error = %e, "Failed to encode reply payload");
        Status::Unknown
    })
}

const fn status_for(err: &PowerError) -> Status {
    match err {
        PowerError::Unsupported => Status::Unsupported,
        PowerError::InvalidSettings { .. } => Status::MalformedData,
        PowerError::Refused { .. } => Status::Unknown,
    }
}
