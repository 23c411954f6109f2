//! Shared (Postgres-backed) session store semantics.

mod support;

use std::time::Duration;

use chrono::Utc;
use gateway::session::{PgSessionStore, SessionStore, WeightedPolicy};
use uuid::Uuid;

fn policy() -> WeightedPolicy {
    WeightedPolicy {
        heartbeat_timeout: Duration::from_secs(300),
        event_window: Duration::from_secs(120),
        tcp_down_penalty: 0.3,
        ack_timeout_penalty: 0.2,
        threshold: 0.5,
    }
}

#[tokio::test]
async fn bind_heartbeat_and_weighted_judgement() {
    let app = support::spawn_app().await;
    let store = PgSessionStore::new(
        app.pool.clone(),
        "instance-a".to_owned(),
        Duration::from_secs(600),
    );

    assert!(store.get("82241218000382").await.unwrap().is_none());
    assert!(
        !store
            .is_online("82241218000382", Utc::now(), Duration::from_secs(300))
            .await
            .unwrap()
    );

    let conn = Uuid::new_v4();
    store.bind("82241218000382", conn).await.unwrap();
    store.on_heartbeat("82241218000382", Utc::now()).await.unwrap();

    let record = store.get("82241218000382").await.unwrap().unwrap();
    assert_eq!(record.conn_id, conn);
    assert_eq!(record.owning_instance, "instance-a");
    assert!(
        store
            .is_online("82241218000382", Utc::now(), Duration::from_secs(300))
            .await
            .unwrap()
    );
    assert!(
        store
            .is_online_weighted("82241218000382", Utc::now(), &policy())
            .await
            .unwrap()
    );

    // Transport trouble subtracts from the score but one incident alone
    // does not knock a fresh device offline.
    store.on_tcp_closed("82241218000382", Utc::now()).await.unwrap();
    assert!(
        store
            .is_online_weighted("82241218000382", Utc::now(), &policy())
            .await
            .unwrap()
    );

    // A second instance rebinding wins; the loser's unbind is a no-op.
    let store_b = PgSessionStore::new(
        app.pool.clone(),
        "instance-b".to_owned(),
        Duration::from_secs(600),
    );
    let conn_b = Uuid::new_v4();
    store_b.bind("82241218000382", conn_b).await.unwrap();
    assert!(!store.unbind("82241218000382", conn).await.unwrap());
    let record = store.get("82241218000382").await.unwrap().unwrap();
    assert_eq!(record.conn_id, conn_b);
    assert_eq!(record.owning_instance, "instance-b");
    // History survived both rebinds.
    assert!(record.last_seen.is_some());
    assert!(record.last_tcp_down.is_some());
}

#[tokio::test]
async fn write_handles_follow_shared_store_ownership() {
    let app = support::spawn_app().await;
    let emulator = bkv_emulator::connect(app.tcp_addr, bkv_emulator::EmulatorConfig::default())
        .await
        .unwrap();
    assert!(support::wait_for_online(&app, &emulator.phy_id).await);
    assert!(app.state.get_conn(&emulator.phy_id).await.is_some());

    // Another instance claims the session. The local handle still exists
    // (our reader has not noticed anything), but only the owning instance
    // may write raw bytes, so the lookup answers "not here".
    let other = PgSessionStore::new(
        app.pool.clone(),
        "instance-b".to_owned(),
        Duration::from_secs(600),
    );
    other.bind(&emulator.phy_id, Uuid::new_v4()).await.unwrap();
    assert!(app.state.get_conn(&emulator.phy_id).await.is_none());

    // Queued commands for the device stay pending instead of being sent
    // over the stale connection.
    let device = gateway::repo::devices::ensure(&app.pool, &emulator.phy_id)
        .await
        .unwrap();
    let id = gateway::repo::outbound::enqueue(
        &app.pool,
        &gateway::repo::outbound::NewOutbound::new(device, &emulator.phy_id, vec![0x00]),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    let row = gateway::repo::outbound::get(&app.pool, id).await.unwrap().unwrap();
    assert_eq!(row.status, gateway::repo::outbound::STATUS_PENDING);
}

#[tokio::test]
async fn records_expire_by_ttl() {
    let app = support::spawn_app().await;
    let store = PgSessionStore::new(
        app.pool.clone(),
        "instance-a".to_owned(),
        Duration::from_secs(1),
    );
    store.bind("86004459453005", Uuid::new_v4()).await.unwrap();
    store.on_heartbeat("86004459453005", Utc::now()).await.unwrap();
    assert!(store.get("86004459453005").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    // Absent from the store means "never seen".
    assert!(store.get("86004459453005").await.unwrap().is_none());
    assert!(store.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn online_counts_scan_all_sessions() {
    let app = support::spawn_app().await;
    let store = PgSessionStore::new(
        app.pool.clone(),
        "instance-a".to_owned(),
        Duration::from_secs(600),
    );
    let now = Utc::now();
    store.on_heartbeat("82241218000382", now).await.unwrap();
    store.on_heartbeat("86004459453005", now).await.unwrap();
    store
        .on_heartbeat("86004459453006", now - chrono::Duration::seconds(900))
        .await
        .unwrap();

    assert_eq!(
        store.online_count(now, Duration::from_secs(300)).await.unwrap(),
        2
    );
    assert_eq!(
        store.online_count_weighted(now, &policy()).await.unwrap(),
        2
    );
}
