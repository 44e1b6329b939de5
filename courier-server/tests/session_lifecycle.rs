//! Session lifecycle tests: create, pairing, reconnect, events, delete and
//! startup restoration, driven through fake device connections.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use async_trait::async_trait;
use common::{
    harness, harness_on, new_session, seed, status_of, test_pairing, wait_until, FakeConnection,
    OfflineBackend,
};
use courier_core::config::AgentBackendConfig;
use courier_core::models::{AgentSession, SessionStatus};
use courier_core::store::{MemorySessionStore, SessionStore, Stores};
use courier_core::transport::{Address, ConnectionEvent, DeviceIdentity, PairingEvent};
use courier_core::CourierError;

fn offline() -> Arc<OfflineBackend> {
    Arc::new(OfflineBackend)
}

fn device(phone: &str, index: u16) -> Address {
    Address::user(phone).with_device(index)
}

// ===========================================================================
// TEST 1: create waits for the first pairing code and returns it
// ===========================================================================
#[tokio::test]
async fn test_create_returns_first_pairing_code() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@first-code");
    h.factory.queue(conn.clone());

    let session = h
        .manager
        .create_session("admin", new_session("agent-1"))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::WaitingScan);
    assert_eq!(session.pairing_code.as_deref(), Some("2@first-code"));
    assert!(session.pairing_code_image.is_some());
    assert!(session.last_pairing_code_issued_at.is_some());
    assert_eq!(conn.connect_count(), 1);
    assert!(h.manager.registry().contains("agent-1"));
}

// ===========================================================================
// TEST 2: duplicate create fails and allocates no connection
// ===========================================================================
#[tokio::test]
async fn test_duplicate_create_allocates_nothing() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn);

    h.manager
        .create_session("admin", new_session("agent-dup"))
        .await
        .unwrap();
    assert_eq!(h.factory.new_count(), 1);

    let err = h
        .manager
        .create_session("admin", new_session("agent-dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::AlreadyExists(ref a) if a == "agent-dup"));
    assert_eq!(h.factory.new_count(), 1, "no second device allocated");
}

// ===========================================================================
// TEST 3: no code within the initial wait still returns the record
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_create_without_code_returns_initializing() {
    let h = harness(offline());

    let session = h
        .manager
        .create_session("admin", new_session("agent-quiet"))
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Initializing);
    assert!(session.pairing_code.is_none());
}

// ===========================================================================
// TEST 4: initial connect failure tears down the live entry
// ===========================================================================
#[tokio::test]
async fn test_create_connect_failure_unregisters() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.fail_next_connects(1);
    h.factory.queue(conn.clone());

    let err = h
        .manager
        .create_session("admin", new_session("agent-fail"))
        .await
        .unwrap_err();

    assert!(matches!(err, CourierError::Connection(_)));
    assert!(!h.manager.registry().contains("agent-fail"));
    assert_eq!(conn.disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// ===========================================================================
// TEST 5: later codes replace the first; the first-code signal fired once
// ===========================================================================
#[tokio::test]
async fn test_later_codes_replace_earlier_ones() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@one");
    h.factory.queue(conn.clone());

    let created = tokio::time::timeout(
        Duration::from_secs(5),
        h.manager.create_session("admin", new_session("agent-codes")),
    )
    .await
    .expect("create should return as soon as the first code arrives")
    .unwrap();
    assert_eq!(created.pairing_code.as_deref(), Some("2@one"));

    assert!(conn.push_pairing(PairingEvent::Code("2@two".into())));
    let stores = h.stores.clone();
    assert!(
        wait_until(|| {
            let stores = stores.clone();
            async move {
                stores
                    .sessions
                    .get_by_agent("agent-codes")
                    .await
                    .unwrap()
                    .and_then(|s| s.pairing_code)
                    .as_deref()
                    == Some("2@two")
            }
        })
        .await
    );
}

// ===========================================================================
// TEST 6: pairing timeout moves to qr_timeout and re-issues one handshake
// ===========================================================================
#[tokio::test]
async fn test_pairing_timeout_reissues_handshake_once() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-timeout"))
        .await
        .unwrap();
    assert_eq!(conn.connect_count(), 1);

    assert!(conn.push_pairing(PairingEvent::Timeout));

    let watched = conn.clone();
    assert!(wait_until(|| { let c = watched.clone(); async move { c.connect_count() >= 2 } }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.connect_count(), 2, "exactly one re-issued handshake");

    let session = h.stores.sessions.get_by_agent("agent-timeout").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::QrTimeout);
    assert!(session.pairing_code.is_none());
    assert!(session.pairing_code_image.is_none());
}

// ===========================================================================
// TEST 7: a stale pairing code triggers one refresh per window
// ===========================================================================
#[tokio::test]
async fn test_stale_code_refreshes_once_per_window() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-stale"))
        .await
        .unwrap();

    let mut session = h.stores.sessions.get_by_agent("agent-stale").await.unwrap().unwrap();
    session.last_pairing_code_issued_at = Some(Utc::now() - chrono::Duration::seconds(60));
    h.stores.sessions.update(&session).await.unwrap();

    h.manager.get_session("agent-stale").await.unwrap();
    h.manager.get_session("agent-stale").await.unwrap();
    h.manager.get_session("agent-stale").await.unwrap();

    let watched = conn.clone();
    assert!(wait_until(|| { let c = watched.clone(); async move { c.connect_count() >= 2 } }).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.connect_count(), 2, "one refresh for three reads");
}

// ===========================================================================
// TEST 8: a fresh code does not trigger a refresh
// ===========================================================================
#[tokio::test]
async fn test_fresh_code_is_not_refreshed() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-fresh"))
        .await
        .unwrap();

    h.manager.get_session("agent-fresh").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.connect_count(), 1);
}

// ===========================================================================
// TEST 9: reconnect retries with linear backoff and gives up after 5 attempts
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_gives_up() {
    let h = harness(offline());
    seed(&h.stores, "agent-retry", SessionStatus::Disconnected).await;
    let conn = FakeConnection::new();
    conn.fail_next_connects(100);
    h.factory.queue(conn.clone());

    let err = h.manager.reconnect_session("agent-retry").await.unwrap_err();
    match err {
        CourierError::Connection(msg) => {
            assert!(msg.contains("failed to connect after 5 attempts"), "got: {}", msg)
        }
        other => panic!("expected Connection, got {:?}", other),
    }

    assert_eq!(conn.connect_count(), 5);
    let times = conn.connect_times.lock().unwrap().clone();
    let gaps: Vec<u64> = times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(gaps, vec![2, 4, 6, 8]);
}

// ===========================================================================
// TEST 10: reconnect succeeds once an attempt goes through
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_after_failures() {
    let h = harness(offline());
    seed(&h.stores, "agent-flaky", SessionStatus::Disconnected).await;
    let conn = FakeConnection::new();
    conn.fail_next_connects(2);
    h.factory.queue(conn.clone());

    h.manager.reconnect_session("agent-flaky").await.unwrap();
    assert_eq!(conn.connect_count(), 3);
    assert!(h.manager.registry().contains("agent-flaky"));
}

// ===========================================================================
// TEST 11: reconnect prefers the stored device address
// ===========================================================================
#[tokio::test]
async fn test_reconnect_uses_stored_address() {
    let h = harness(offline());
    let address = device("15550001111", 3);
    let mut session = seed(&h.stores, "agent-stored", SessionStatus::Connected).await;
    session.set_paired_address(&address);
    h.stores.sessions.update(&session).await.unwrap();

    let stored = FakeConnection::paired(address.clone());
    h.factory.store_device(address, stored.clone());

    h.manager.reconnect_session("agent-stored").await.unwrap();
    assert_eq!(h.factory.new_count(), 0);
    assert_eq!(stored.connect_count(), 1);
}

// ===========================================================================
// TEST 12: without an address, reconnect picks the latest device for the phone
// ===========================================================================
#[tokio::test]
async fn test_reconnect_by_phone_picks_latest_device() {
    let h = harness(offline());
    let mut session = seed(&h.stores, "agent-phone", SessionStatus::Connected).await;
    session.phone_number = Some("15550001111".to_string());
    h.stores.sessions.update(&session).await.unwrap();

    let old = FakeConnection::paired(device("15550001111", 1));
    let latest = FakeConnection::paired(device("15550001111", 4));
    h.factory.store_device(device("15550001111", 1), old.clone());
    h.factory.store_device(device("15550001111", 4), latest.clone());

    h.manager.reconnect_session("agent-phone").await.unwrap();
    assert_eq!(latest.connect_count(), 1);
    assert_eq!(old.connect_count(), 0);
    assert_eq!(h.factory.new_count(), 0);
}

// ===========================================================================
// TEST 13: reconnect of a live, connected session does not reconnect
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_reconnect_live_connected_is_noop() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-live"))
        .await
        .unwrap();
    conn.set_connected(true);

    h.manager.reconnect_session("agent-live").await.unwrap();
    assert_eq!(conn.connect_count(), 1);
    assert_eq!(h.factory.new_count(), 1);
}

// ===========================================================================
// TEST 14: reconnect of an unknown agent is NotFound
// ===========================================================================
#[tokio::test]
async fn test_reconnect_unknown_agent() {
    let h = harness(offline());
    let err = h.manager.reconnect_session("ghost").await.unwrap_err();
    assert!(matches!(err, CourierError::NotFound(_)));
}

// ===========================================================================
// TEST 15: connected event records the device and clears pairing material
// ===========================================================================
#[tokio::test]
async fn test_connected_event_records_device() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-conn"))
        .await
        .unwrap();

    conn.set_identity(DeviceIdentity {
        address: Some(device("15550001111", 2)),
        ..Default::default()
    });
    assert!(conn.push_event(ConnectionEvent::Connected));

    let stores = h.stores.clone();
    assert!(
        wait_until(|| {
            let stores = stores.clone();
            async move { status_of(&stores, "agent-conn").await == Some(SessionStatus::Connected) }
        })
        .await
    );

    let session = h.stores.sessions.get_by_agent("agent-conn").await.unwrap().unwrap();
    assert_eq!(session.phone_number.as_deref(), Some("15550001111"));
    assert_eq!(session.paired_address(), Some(device("15550001111", 2)));
    assert!(session.connected_at.is_some());
    assert!(session.pairing_code.is_none());
}

// ===========================================================================
// TEST 16: pair success stores the phone and device address
// ===========================================================================
#[tokio::test]
async fn test_pair_success_records_identity() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-pair"))
        .await
        .unwrap();

    assert!(conn.push_event(ConnectionEvent::PairSuccess {
        identity: DeviceIdentity {
            address: Some(device("15557770000", 5)),
            ..Default::default()
        },
    }));

    let stores = h.stores.clone();
    assert!(
        wait_until(|| {
            let stores = stores.clone();
            async move {
                stores
                    .sessions
                    .get_by_agent("agent-pair")
                    .await
                    .unwrap()
                    .map(|s| s.paired_address().is_some())
                    .unwrap_or(false)
            }
        })
        .await
    );
    let session = h.stores.sessions.get_by_agent("agent-pair").await.unwrap().unwrap();
    assert_eq!(session.phone_number.as_deref(), Some("15557770000"));
    assert_eq!(session.paired_address(), Some(device("15557770000", 5)));
}

// ===========================================================================
// TEST 17: logged out marks the session disconnected and drops the entry
// ===========================================================================
#[tokio::test]
async fn test_logged_out_disconnects() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-out"))
        .await
        .unwrap();

    assert!(conn.push_event(ConnectionEvent::LoggedOut));

    let stores = h.stores.clone();
    assert!(
        wait_until(|| {
            let stores = stores.clone();
            async move { status_of(&stores, "agent-out").await == Some(SessionStatus::Disconnected) }
        })
        .await
    );
    let manager = h.manager.clone();
    assert!(wait_until(|| { let m = manager.clone(); async move { !m.registry().contains("agent-out") } }).await);

    let session = h.stores.sessions.get_by_agent("agent-out").await.unwrap().unwrap();
    assert!(session.disconnected_at.is_some());
}

// ===========================================================================
// TEST 18: delete removes a paired device, the entry and the record
// ===========================================================================
#[tokio::test]
async fn test_delete_paired_session() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-del"))
        .await
        .unwrap();
    conn.set_identity(DeviceIdentity {
        address: Some(device("15550001111", 2)),
        ..Default::default()
    });

    h.manager.delete_session("agent-del").await.unwrap();

    assert_eq!(h.factory.deleted.lock().unwrap().clone(), vec![device("15550001111", 2)]);
    assert_eq!(conn.disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!h.manager.registry().contains("agent-del"));
    assert!(status_of(&h.stores, "agent-del").await.is_none());
}

// ===========================================================================
// TEST 19: delete of an unpaired session leaves the device store alone
// ===========================================================================
#[tokio::test]
async fn test_delete_unpaired_session() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-unpaired"))
        .await
        .unwrap();

    h.manager.delete_session("agent-unpaired").await.unwrap();
    assert!(h.factory.deleted.lock().unwrap().is_empty());
    assert!(status_of(&h.stores, "agent-unpaired").await.is_none());

    h.manager
        .delete_session("agent-unpaired")
        .await
        .expect("deleting twice is fine");
}

// ===========================================================================
// TEST 20: startup restores connected, initializing and waiting_scan sessions
// ===========================================================================
#[tokio::test]
async fn test_initialize_sessions_counts_restorable() {
    let h = harness(offline());
    seed(&h.stores, "a-connected", SessionStatus::Connected).await;
    seed(&h.stores, "a-init", SessionStatus::Initializing).await;
    seed(&h.stores, "a-waiting", SessionStatus::WaitingScan).await;
    seed(&h.stores, "a-timeout", SessionStatus::QrTimeout).await;
    seed(&h.stores, "a-gone", SessionStatus::Disconnected).await;

    let scheduled = h.manager.initialize_sessions().await.unwrap();
    assert_eq!(scheduled, 3);

    let factory = h.factory.clone();
    assert!(wait_until(|| { let f = factory.clone(); async move { f.new_count() == 3 } }).await);
}

// ===========================================================================
// TEST 21: detail reports message counters
// ===========================================================================
#[tokio::test]
async fn test_session_detail_counts() {
    use courier_core::models::MessageRecord;

    let h = harness(offline());
    let session = seed(&h.stores, "agent-stats", SessionStatus::Connected).await;
    for i in 0..3 {
        let m = MessageRecord::incoming(session.id, "agent-stats", &format!("in-{}", i), "1555", None, "hi");
        h.stores.messages.create(&m).await.unwrap();
    }
    let out = MessageRecord::outgoing(session.id, "agent-stats", "out-1", None, "1555@s.whatsapp.net", "yo");
    h.stores.messages.create(&out).await.unwrap();

    let detail = h.manager.session_detail("agent-stats").await.unwrap();
    assert_eq!(detail.stats.incoming, 3);
    assert_eq!(detail.stats.responded, 1);
    assert_eq!(detail.session.agent_id, "agent-stats");
}

// ===========================================================================
// TEST 22: delete stops the pairing listener; a later timeout does nothing
// ===========================================================================
#[tokio::test]
async fn test_delete_stops_pairing_listener() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-gone"))
        .await
        .unwrap();
    assert_eq!(conn.connect_count(), 1);

    h.manager.delete_session("agent-gone").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        !conn.push_pairing(PairingEvent::Timeout),
        "pairing stream should be closed after delete"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(conn.connect_count(), 1, "no handshake for a deleted session");
    assert!(status_of(&h.stores, "agent-gone").await.is_none());
}

// ===========================================================================
// TEST 23: the listener ends when the record disappears under it
// ===========================================================================
#[tokio::test]
async fn test_pairing_listener_ends_when_record_is_gone() {
    let h = harness(offline());
    let conn = FakeConnection::new();
    conn.code_on_next_connect("2@code");
    h.factory.queue(conn.clone());
    h.manager
        .create_session("admin", new_session("agent-orphan"))
        .await
        .unwrap();

    h.stores.sessions.delete("agent-orphan").await.unwrap();
    assert!(conn.push_pairing(PairingEvent::Timeout));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(conn.connect_count(), 1, "timeout for a missing record is not re-issued");
    assert!(!conn.push_pairing(PairingEvent::Timeout), "listener has stopped");
}

/// Session store whose existence check always misses, as when a concurrent
/// create commits between the check and the insert.
#[derive(Default)]
struct LateCommitSessions {
    inner: MemorySessionStore,
}

#[async_trait]
impl SessionStore for LateCommitSessions {
    async fn create(&self, session: &AgentSession) -> courier_core::store::Result<()> {
        self.inner.create(session).await
    }

    async fn update(&self, session: &AgentSession) -> courier_core::store::Result<()> {
        self.inner.update(session).await
    }

    async fn delete(&self, agent_id: &str) -> courier_core::store::Result<()> {
        self.inner.delete(agent_id).await
    }

    async fn get_by_agent(&self, _agent_id: &str) -> courier_core::store::Result<Option<AgentSession>> {
        Ok(None)
    }

    async fn get_by_owner_and_agent(
        &self,
        owner_user_id: &str,
        agent_id: &str,
    ) -> courier_core::store::Result<Option<AgentSession>> {
        self.inner.get_by_owner_and_agent(owner_user_id, agent_id).await
    }

    async fn list(&self) -> courier_core::store::Result<Vec<AgentSession>> {
        self.inner.list().await
    }
}

// ===========================================================================
// TEST 24: losing a create race disconnects the connection it allocated
// ===========================================================================
#[tokio::test]
async fn test_create_race_loser_disconnects() {
    let sessions = Arc::new(LateCommitSessions::default());
    sessions
        .create(&AgentSession::new("admin", new_session("agent-race")))
        .await
        .unwrap();
    let stores = Stores {
        sessions: sessions.clone(),
        ..Stores::memory()
    };
    let h = harness_on(stores, offline(), test_pairing(), AgentBackendConfig::default());
    let conn = FakeConnection::new();
    h.factory.queue(conn.clone());

    let err = h
        .manager
        .create_session("admin", new_session("agent-race"))
        .await
        .unwrap_err();

    assert!(matches!(err, CourierError::AlreadyExists(_)), "got {:?}", err);
    assert_eq!(h.factory.new_count(), 1);
    assert_eq!(conn.disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(conn.connect_count(), 0);
    assert!(!h.manager.registry().contains("agent-race"));
}
