//! End-to-end tests of the control socket with the catalog-backed verifier.
//!
//! The daemon runs in-process. Peer credentials come from the real
//! `SO_PEERCRED` of the socket, so the peer pid is this test process; its
//! `/proc` entry is served from a fake tree under a temp dir so the test
//! controls the image, tracer and environment the verifier sees.

#![allow(clippy::float_cmp)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use battd_core::{AuthorizationGate, PolicyRule};
use battd_daemon::metrics::{SharedMetricsRegistry, new_shared_registry};
use battd_daemon::platform::catalog::digest_path;
use battd_daemon::platform::{Catalog, ImageIdentity, ProcFs, ProcfsVerifier, TrustStore, sign_image};
use battd_daemon::power::InMemoryPower;
use battd_daemon::protocol::{
    ClientHandshake, Command, HandshakeMessage, HelloNack, ProtocolError, ProtocolServer, Request,
    Response, ServerConfig, Status, connect, handle_connection, parse_handshake_message,
    parse_response, serialize_handshake_message, serialize_request,
};
use battd_daemon::state::DaemonState;
use bytes::Bytes;
use ed25519_dalek::SigningKey;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

type Client = Framed<UnixStream, battd_daemon::protocol::FrameCodec>;

const SIGNER: &str = "BatteryToolkit Signer";
const START_TIME: u64 = 777_000;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct Daemon {
    tmp: TempDir,
    key: SigningKey,
    registry: SharedMetricsRegistry,
    socket: PathBuf,
    task: JoinHandle<()>,
}

impl Daemon {
    /// Starts a daemon; `catalogued` installs a trusted entry for the image.
    ///
    /// The user running the tests holds the manage right.
    fn start(catalogued: bool) -> Self {
        let uid = nix::unistd::getuid().as_raw();
        Self::start_with_rule(catalogued, PolicyRule::new(SIGNER).with_manage_principals([uid], []))
    }

    fn start_with_rule(catalogued: bool, rule: PolicyRule) -> Self {
        let tmp = TempDir::new().unwrap();
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let pid = std::process::id();

        let proc_dir = tmp.path().join("proc").join(pid.to_string());
        fs::create_dir_all(&proc_dir).unwrap();
        let stat = format!(
            "{pid} (battery toolkit) S 1 {pid} {pid} 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 {START_TIME} 0 0"
        );
        fs::write(proc_dir.join("stat"), stat).unwrap();
        fs::write(proc_dir.join("status"), "TracerPid:\t0\nNoNewPrivs:\t1\n").unwrap();
        fs::write(proc_dir.join("environ"), b"HOME=/home/user\0").unwrap();

        let image = tmp.path().join("battery-toolkit");
        fs::write(&image, b"\x7fELF battery toolkit 1.4").unwrap();
        symlink(&image, proc_dir.join("exe")).unwrap();

        let catalog = Catalog::new(tmp.path().join("catalog"));
        if catalogued {
            let digest = digest_path(&image).unwrap();
            let identity = ImageIdentity {
                identifier: "me.mhaeuser.batterytoolkit".to_string(),
                common_name: SIGNER.to_string(),
                ..ImageIdentity::default()
            };
            catalog
                .install(&digest, &sign_image(&key, &digest, identity))
                .unwrap();
        }

        let procfs = ProcFs::new(tmp.path().join("proc"));
        let verifier = ProcfsVerifier::new(
            procfs.clone(),
            catalog,
            TrustStore::new().with_signer(key.verifying_key(), SIGNER),
        );
        let registry = new_shared_registry().unwrap();
        let gate = AuthorizationGate::new(verifier, Arc::new(rule))
            .with_observer(Arc::new(registry.daemon_metrics().clone()));
        let state = Arc::new(
            DaemonState::new(gate, Arc::new(InMemoryPower::new()))
                .with_metrics(Arc::clone(&registry))
                .with_daemon_id("feedface"),
        );

        let socket = tmp.path().join("run").join("battd.sock");
        let server = ProtocolServer::bind(ServerConfig::new(&socket).with_procfs(procfs)).unwrap();
        let task = tokio::spawn(async move {
            loop {
                let Ok((connection, permit)) = server.accept().await else {
                    return;
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let _permit = permit;
                    let _ = handle_connection(connection, state).await;
                });
            }
        });

        Self {
            tmp,
            key,
            registry,
            socket,
            task,
        }
    }

    fn proc_dir(&self) -> PathBuf {
        self.tmp
            .path()
            .join("proc")
            .join(std::process::id().to_string())
    }

    fn image(&self) -> PathBuf {
        self.tmp.path().join("battery-toolkit")
    }

    async fn client(&self) -> (Client, HandshakeMessage) {
        let mut client = connect(&self.socket).await.unwrap();
        let hello = ClientHandshake::new("battery-toolkit/1.4").create_hello();
        client
            .send(serialize_handshake_message(&hello.into()).unwrap())
            .await
            .unwrap();
        let reply = recv(&mut client).await;
        (client, parse_handshake_message(&reply).unwrap())
    }

    async fn admitted_client(&self) -> Client {
        let (client, reply) = self.client().await;
        let mut handshake = ClientHandshake::new("battery-toolkit/1.4");
        handshake.process_response(reply).expect("expected HelloAck");
        assert_eq!(handshake.daemon_id(), Some("feedface"));
        client
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn recv(client: &mut Client) -> Bytes {
    timeout(IO_TIMEOUT, client.next())
        .await
        .expect("daemon did not answer")
        .expect("connection closed")
        .expect("frame error")
}

async fn call(client: &mut Client, id: u64, command: Command) -> Response {
    client
        .send(serialize_request(&Request::new(id, command)).unwrap())
        .await
        .unwrap();
    let response = parse_response(&recv(client).await).unwrap();
    assert_eq!(response.id, id);
    response
}

fn rewrite(path: &Path, contents: &[u8]) {
    fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn test_catalogued_client_runs_privileged_command() {
    let daemon = Daemon::start(true);
    let (mut client, reply) = daemon.client().await;

    let HandshakeMessage::HelloAck(ack) = reply else {
        panic!("expected HelloAck, got {reply:?}");
    };
    assert_eq!(ack.daemon_id.as_deref(), Some("feedface"));
    assert!(ack.server_info.starts_with("battd/"));

    assert_eq!(call(&mut client, 1, Command::ChargeToFull).await.status, Status::Success);
    let state = call(&mut client, 2, Command::GetState).await;
    assert_eq!(state.payload.unwrap()["charging_mode"], "to_full");

    let metrics = daemon.registry.daemon_metrics();
    // Admission plus one privileged call.
    assert_eq!(metrics.decision_count("allow", "none"), 2.0);
    assert_eq!(metrics.ipc_request_count("charge_to_full", "success"), 1.0);
}

#[tokio::test]
async fn test_uncatalogued_client_is_refused_at_handshake() {
    let daemon = Daemon::start(false);
    let (mut client, reply) = daemon.client().await;

    assert_eq!(reply, HandshakeMessage::HelloNack(HelloNack::not_authorized()));
    let refused = ClientHandshake::new("battery-toolkit/1.4").process_response(reply);
    assert!(matches!(refused, Err(ProtocolError::NotAuthorized)));
    let closed = timeout(IO_TIMEOUT, client.next()).await.unwrap();
    assert!(closed.is_none(), "daemon must close after HelloNack");
    assert_eq!(
        daemon
            .registry
            .daemon_metrics()
            .decision_count("deny", "signature_invalid"),
        1.0
    );
}

#[tokio::test]
async fn test_image_replaced_after_admission_is_denied() {
    let daemon = Daemon::start(true);
    let mut client = daemon.admitted_client().await;

    rewrite(&daemon.image(), b"\x7fELF patched in place");

    let response = call(&mut client, 1, Command::DisablePowerAdapter).await;
    assert_eq!(response, Response::status(1, Status::NotAuthorized));

    // Queries stay available to the admitted connection.
    let state = call(&mut client, 2, Command::GetState).await;
    assert_eq!(state.payload.unwrap()["power_adapter_enabled"], true);
}

#[tokio::test]
async fn test_debugger_attached_after_admission_is_denied() {
    let daemon = Daemon::start(true);
    let mut client = daemon.admitted_client().await;

    rewrite(
        &daemon.proc_dir().join("status"),
        b"TracerPid:\t999\nNoNewPrivs:\t1\n",
    );
    let traced = call(&mut client, 1, Command::DisableCharging).await;

    rewrite(&daemon.proc_dir().join("status"), b"TracerPid:\t0\nNoNewPrivs:\t1\n");
    rewrite(
        &daemon.proc_dir().join("environ"),
        b"HOME=/home/user\0LD_PRELOAD=/tmp/hook.so\0",
    );
    let preloaded = call(&mut client, 2, Command::DisableCharging).await;

    // Both denials look identical to the peer.
    assert_eq!(traced.status, Status::NotAuthorized);
    assert_eq!(preloaded.status, Status::NotAuthorized);
    assert_eq!(traced.payload, preloaded.payload);
}

#[tokio::test]
async fn test_entry_from_unknown_signer_is_refused() {
    let daemon = Daemon::start(true);
    // Same common name, key the trust store does not know.
    let other = SigningKey::from_bytes(&[7u8; 32]);
    let digest = digest_path(&daemon.image()).unwrap();
    let entry = sign_image(
        &other,
        &digest,
        ImageIdentity {
            common_name: SIGNER.to_string(),
            ..ImageIdentity::default()
        },
    );
    Catalog::new(daemon.tmp.path().join("catalog"))
        .install(&digest, &entry)
        .unwrap();
    assert_ne!(other.verifying_key(), daemon.key.verifying_key());

    let (_client, reply) = daemon.client().await;
    assert_eq!(reply, HandshakeMessage::HelloNack(HelloNack::not_authorized()));
}

#[tokio::test]
async fn test_malformed_request_keeps_connection() {
    let daemon = Daemon::start(true);
    let mut client = daemon.admitted_client().await;

    client
        .send(Bytes::from_static(br#"{"id":1,"command":"become_root"}"#))
        .await
        .unwrap();
    let response = parse_response(&recv(&mut client).await).unwrap();
    assert_eq!(response, Response::malformed());

    let settings = call(&mut client, 2, Command::GetSettings).await;
    assert_eq!(settings.status, Status::Success);
}

#[tokio::test]
async fn test_user_without_manage_right_cannot_change_power_state() {
    let other = nix::unistd::getuid().as_raw().wrapping_add(1);
    let rule = PolicyRule::new(SIGNER).with_manage_principals([other], []);
    let daemon = Daemon::start_with_rule(true, rule);
    let mut client = daemon.admitted_client().await;

    let response = call(&mut client, 1, Command::DisablePowerAdapter).await;
    assert_eq!(response, Response::status(1, Status::NotAuthorized));
    let state = call(&mut client, 2, Command::GetState).await;
    assert_eq!(state.payload.unwrap()["power_adapter_enabled"], true);

    let metrics = daemon.registry.daemon_metrics();
    assert_eq!(metrics.decision_count("deny", "policy_denied"), 1.0);
}
