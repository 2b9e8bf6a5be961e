//! End-to-end session tests: two engines joined through the in-process
//! relay bus and the in-memory peer transport, exercising the full
//! negotiate → authenticate → transfer → accept pipeline.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use dropsync_core::engine::{EngineConfig, EngineEvent, EngineHandle, SessionEngine};
use dropsync_core::signaling::memory::MemoryRelay;
use dropsync_core::transport::mem::{MemConfig, MemNetwork, MemTransportFactory};
use dropsync_core::{CHUNK_SIZE, FileSource, MemorySink};
use dropsync_types::{AuthFailure, AuthState, TransferErrorKind, TransferStatus};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Endpoint {
    handle: EngineHandle,
    events: UnboundedReceiver<EngineEvent>,
    sink: MemorySink,
}

fn start_endpoint(
    relay: &MemoryRelay,
    net: &MemNetwork,
    config: &MemConfig,
    room: &str,
    password: Option<&str>,
) -> Endpoint {
    let sink = MemorySink::new();
    let factory = Arc::new(MemTransportFactory::with_config(net.clone(), config.clone()));
    let (handle, events) = SessionEngine::start(
        EngineConfig {
            room_id: room.to_owned(),
            password: password.map(str::to_owned),
            ice_servers: Vec::new(),
        },
        relay.connect(),
        factory,
        Box::new(sink.clone()),
    );
    Endpoint {
        handle,
        events,
        sink,
    }
}

/// Start two endpoints in one room; the first one in is the initiator.
async fn start_pair(
    config: &MemConfig,
    room: &str,
    a_password: Option<&str>,
    b_password: Option<&str>,
) -> (Endpoint, Endpoint) {
    let relay = MemoryRelay::new();
    let net = MemNetwork::new();
    let a = start_endpoint(&relay, &net, config, room, a_password);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let b = start_endpoint(&relay, &net, config, room, b_password);
    (a, b)
}

async fn next_event(ep: &mut Endpoint) -> EngineEvent {
    tokio::time::timeout(TIMEOUT, ep.events.recv())
        .await
        .expect("timed out waiting for an engine event")
        .expect("engine ended unexpectedly")
}

async fn wait_admitted(ep: &mut Endpoint) -> AuthState {
    loop {
        if let EngineEvent::AuthChanged { state } = next_event(ep).await {
            assert!(state.is_admitted(), "expected admission, got {state:?}");
            return state;
        }
    }
}

async fn wait_auth_failed(ep: &mut Endpoint) -> AuthFailure {
    loop {
        if let EngineEvent::AuthFailed { reason } = next_event(ep).await {
            return reason;
        }
    }
}

async fn wait_status(ep: &mut Endpoint, id: Uuid, status: TransferStatus) -> Option<TransferErrorKind> {
    loop {
        if let EngineEvent::TransferUpdated { transfer } = next_event(ep).await {
            if transfer.id == id {
                assert!(
                    !transfer.status.is_terminal() || transfer.status == status,
                    "transfer {id} reached {:?} while waiting for {status:?}",
                    transfer.status,
                );
                if transfer.status == status {
                    return transfer.error;
                }
            }
        }
    }
}

async fn wait_pending(ep: &mut Endpoint) -> (Uuid, String, u64) {
    loop {
        if let EngineEvent::FilePending { id, name, size } = next_event(ep).await {
            return (id, name, size);
        }
    }
}

fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ── Scenarios ──────────────────────────────────────────────────────────

#[tokio::test]
async fn no_password_transfer_and_chat() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomaaa", None, None).await;

    assert_eq!(wait_admitted(&mut a).await, AuthState::Skipped);
    assert_eq!(wait_admitted(&mut b).await, AuthState::Skipped);

    // Chat flows both ways once admitted.
    a.handle.send_chat("hi from a").unwrap();
    loop {
        if let EngineEvent::ChatReceived { message } = next_event(&mut b).await {
            assert_eq!(message.text, "hi from a");
            break;
        }
    }

    // A 3-byte file lands byte-for-byte after accept.
    let id = a
        .handle
        .send_file("a.txt", FileSource::Bytes(Bytes::from_static(b"hi!")))
        .unwrap();
    assert_eq!(wait_status(&mut a, id, TransferStatus::Completed).await, None);

    let (pending_id, name, size) = wait_pending(&mut b).await;
    assert_eq!(pending_id, id);
    assert_eq!(name, "a.txt");
    assert_eq!(size, 3);

    b.handle.accept_file(id).unwrap();
    assert_eq!(wait_status(&mut b, id, TransferStatus::Completed).await, None);

    let files = b.sink.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "a.txt");
    assert_eq!(&files[0].1[..], b"hi!");
}

#[tokio::test]
async fn matching_passwords_encrypted_transfer() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roombbb", Some("secret"), Some("secret")).await;

    assert_eq!(wait_admitted(&mut a).await, AuthState::Admitted);
    assert_eq!(wait_admitted(&mut b).await, AuthState::Admitted);

    let mut blob = vec![0u8; 100 * 1024];
    rand::thread_rng().fill_bytes(&mut blob);
    let digest = sha256(&blob);

    let id = a
        .handle
        .send_file("blob.bin", FileSource::Bytes(Bytes::from(blob)))
        .unwrap();
    assert_eq!(wait_status(&mut a, id, TransferStatus::Completed).await, None);

    let (pending_id, _, size) = wait_pending(&mut b).await;
    assert_eq!(pending_id, id);
    assert_eq!(size, 100 * 1024);

    b.handle.accept_file(id).unwrap();
    assert_eq!(wait_status(&mut b, id, TransferStatus::Completed).await, None);

    let files = b.sink.files();
    assert_eq!(sha256(&files[0].1), digest);
}

#[tokio::test]
async fn wrong_password_rejects_both_sides() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomccc", Some("alpha"), Some("beta")).await;

    assert_eq!(wait_auth_failed(&mut a).await, AuthFailure::WrongPassword);
    assert_eq!(wait_auth_failed(&mut b).await, AuthFailure::WrongPassword);

    // No transport survives; a send is an immediate visible error.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let id = a
        .handle
        .send_file("x.bin", FileSource::Bytes(Bytes::from_static(b"x")))
        .unwrap();
    assert_eq!(
        wait_status(&mut a, id, TransferStatus::Error).await,
        Some(TransferErrorKind::NotConnected)
    );
    assert!(b.sink.files().is_empty());
}

#[tokio::test]
async fn one_sided_password_is_a_mismatch() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomddd", Some("alpha"), None).await;

    assert_eq!(
        wait_auth_failed(&mut a).await,
        AuthFailure::PasswordMismatchPeerHasNone
    );
    assert_eq!(wait_auth_failed(&mut b).await, AuthFailure::PasswordRequired);
    assert!(b.sink.files().is_empty());
}

#[tokio::test]
async fn cancel_mid_transfer_converges_both_sides() {
    // A slow drain keeps the transfer in flight long enough to cancel, and
    // pushes the sender through its backpressure path on the way.
    let config = MemConfig {
        drain_bytes_per_ms: Some(2000),
        ..MemConfig::default()
    };
    let (mut a, mut b) = start_pair(&config, "roomeee", None, None).await;
    wait_admitted(&mut a).await;
    wait_admitted(&mut b).await;

    let id = a
        .handle
        .send_file("big.bin", FileSource::Bytes(Bytes::from(vec![7u8; 1024 * 1024])))
        .unwrap();

    // Cancel once the transfer is partway through.
    loop {
        if let EngineEvent::TransferUpdated { transfer } = next_event(&mut a).await {
            if transfer.id == id && transfer.progress >= 30 {
                break;
            }
        }
    }
    a.handle.cancel_transfer(id).unwrap();
    // Idempotent: a second cancel changes nothing.
    a.handle.cancel_transfer(id).unwrap();

    assert_eq!(
        wait_status(&mut a, id, TransferStatus::Cancelled).await,
        Some(TransferErrorKind::Cancelled)
    );
    assert_eq!(
        wait_status(&mut b, id, TransferStatus::Cancelled).await,
        Some(TransferErrorKind::Cancelled)
    );
    assert!(b.sink.files().is_empty());
}

#[tokio::test]
async fn decline_after_full_receive() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomfff", None, None).await;
    wait_admitted(&mut a).await;
    wait_admitted(&mut b).await;

    let id = a
        .handle
        .send_file("unwanted.bin", FileSource::Bytes(Bytes::from(vec![3u8; 256 * 1024])))
        .unwrap();

    // The send side fulfilled its contract.
    assert_eq!(wait_status(&mut a, id, TransferStatus::Completed).await, None);

    let (pending_id, _, _) = wait_pending(&mut b).await;
    assert_eq!(pending_id, id);
    b.handle.decline_file(id).unwrap();
    assert_eq!(
        wait_status(&mut b, id, TransferStatus::Cancelled).await,
        Some(TransferErrorKind::Declined)
    );
    assert!(b.sink.files().is_empty());
}

// ── Boundaries ─────────────────────────────────────────────────────────

#[tokio::test]
async fn zero_byte_file_completes_at_100() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomggg", None, None).await;
    wait_admitted(&mut a).await;
    wait_admitted(&mut b).await;

    let id = a
        .handle
        .send_file("empty.txt", FileSource::Bytes(Bytes::new()))
        .unwrap();
    assert_eq!(wait_status(&mut a, id, TransferStatus::Completed).await, None);

    let (pending_id, _, size) = wait_pending(&mut b).await;
    assert_eq!(pending_id, id);
    assert_eq!(size, 0);

    b.handle.accept_file(id).unwrap();
    loop {
        if let EngineEvent::TransferUpdated { transfer } = next_event(&mut b).await {
            if transfer.id == id && transfer.status == TransferStatus::Completed {
                assert_eq!(transfer.progress, 100);
                break;
            }
        }
    }
    let files = b.sink.files();
    assert_eq!(files.len(), 1);
    assert!(files[0].1.is_empty());
}

#[tokio::test]
async fn exact_chunk_multiple_roundtrips() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomhhh", Some("pw"), Some("pw")).await;
    wait_admitted(&mut a).await;
    wait_admitted(&mut b).await;

    let payload = vec![0xABu8; CHUNK_SIZE * 3];
    let id = a
        .handle
        .send_file("exact.bin", FileSource::Bytes(Bytes::from(payload.clone())))
        .unwrap();
    assert_eq!(wait_status(&mut a, id, TransferStatus::Completed).await, None);

    let (pending_id, _, _) = wait_pending(&mut b).await;
    assert_eq!(pending_id, id);
    b.handle.accept_file(id).unwrap();
    assert_eq!(wait_status(&mut b, id, TransferStatus::Completed).await, None);
    assert_eq!(&b.sink.files()[0].1[..], &payload[..]);
}

#[tokio::test]
async fn concurrent_transfers_are_independent() {
    let config = MemConfig {
        drain_bytes_per_ms: Some(2000),
        ..MemConfig::default()
    };
    let (mut a, mut b) = start_pair(&config, "roomiii", None, None).await;
    wait_admitted(&mut a).await;
    wait_admitted(&mut b).await;

    let doomed = a
        .handle
        .send_file("doomed.bin", FileSource::Bytes(Bytes::from(vec![1u8; 512 * 1024])))
        .unwrap();
    let kept = a
        .handle
        .send_file("kept.bin", FileSource::Bytes(Bytes::from(vec![2u8; 64 * 1024])))
        .unwrap();

    // Cancel the first transfer once it reports progress.
    loop {
        if let EngineEvent::TransferUpdated { transfer } = next_event(&mut a).await {
            if transfer.id == doomed && transfer.progress > 0 {
                break;
            }
        }
    }
    a.handle.cancel_transfer(doomed).unwrap();

    assert_eq!(
        wait_status(&mut a, doomed, TransferStatus::Cancelled).await,
        Some(TransferErrorKind::Cancelled)
    );
    assert_eq!(wait_status(&mut a, kept, TransferStatus::Completed).await, None);

    // The receiver converges the same way, and only the kept file arrives.
    // The two outcomes land in either order.
    let mut doomed_cancelled = false;
    let mut kept_pending = false;
    while !(doomed_cancelled && kept_pending) {
        match next_event(&mut b).await {
            EngineEvent::TransferUpdated { transfer }
                if transfer.id == doomed && transfer.status == TransferStatus::Cancelled =>
            {
                assert_eq!(transfer.error, Some(TransferErrorKind::Cancelled));
                doomed_cancelled = true;
            }
            EngineEvent::FilePending { id, name, .. } if id == kept => {
                assert_eq!(name, "kept.bin");
                kept_pending = true;
            }
            _ => {}
        }
    }
    b.handle.accept_file(kept).unwrap();
    assert_eq!(wait_status(&mut b, kept, TransferStatus::Completed).await, None);
    assert_eq!(b.sink.files().len(), 1);
}

#[tokio::test]
async fn send_without_peer_is_not_connected() {
    let relay = MemoryRelay::new();
    let net = MemNetwork::new();
    let mut alone = start_endpoint(&relay, &net, &MemConfig::default(), "roomjjj", None);

    let id = alone
        .handle
        .send_file("lonely.txt", FileSource::Bytes(Bytes::from_static(b"x")))
        .unwrap();
    assert_eq!(
        wait_status(&mut alone, id, TransferStatus::Error).await,
        Some(TransferErrorKind::NotConnected)
    );
}

#[tokio::test]
async fn inspect_reports_streams_and_states() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomkkk", None, None).await;
    wait_admitted(&mut a).await;
    wait_admitted(&mut b).await;

    let snapshot = a.handle.inspect().await.unwrap();
    assert_eq!(
        snapshot.connection,
        Some(dropsync_types::ConnectionState::Connected)
    );
    assert!(snapshot.auth.is_admitted());
    assert!(
        snapshot
            .streams
            .iter()
            .any(|s| s.label == "signaling"),
        "control stream missing from {:?}",
        snapshot.streams
    );
}

#[tokio::test]
async fn leaving_clears_the_peer() {
    let (mut a, mut b) =
        start_pair(&MemConfig::default(), "roomlll", None, None).await;
    wait_admitted(&mut a).await;
    wait_admitted(&mut b).await;

    b.handle.leave().unwrap();
    loop {
        if let EngineEvent::LeftRoom = next_event(&mut b).await {
            break;
        }
    }
    // A hears the departure and drops its transport.
    loop {
        if let EngineEvent::PeerLeft { .. } = next_event(&mut a).await {
            break;
        }
    }
    let snapshot = a.handle.inspect().await.unwrap();
    assert_eq!(snapshot.connection, None);
}
