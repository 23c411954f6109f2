//! End-to-end order lifecycle against an emulated device.

mod support;

use std::time::Duration;

use bkv_protocol::command;
use bkv_protocol::payload::SettleReason;
use bkv_emulator::EmulatorConfig;
use support::{spawn_app, wait_for_online, wait_for_status};

fn charge_body(port_no: u8) -> serde_json::Value {
    serde_json::json!({
        "port_no": port_no,
        "charge_mode": 1,
        "amount": 100,
        "duration_minutes": 60,
    })
}

#[tokio::test]
async fn fresh_device_full_charge_lifecycle() {
    let app = spawn_app().await;
    let emulator = bkv_emulator::connect(app.tcp_addr, EmulatorConfig::default())
        .await
        .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);

    let client = reqwest::Client::new();
    let response = client
        .post(app.url(&format!("/devices/{}/charge", emulator.phy_id)))
        .json(&charge_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], 0);
    let order_no = body["data"]["order_no"].as_str().unwrap().to_owned();
    assert!(order_no.starts_with("THD"));
    assert!(order_no.ends_with("001"));
    assert_eq!(body["data"]["online"], true);

    // The device receives the start command, acks it, and its status report
    // shows the port charging: pending → confirmed → charging.
    assert!(wait_for_status(&app.pool, &order_no, 2).await);
    let start = emulator
        .wait_for_command(command::CONTROL, Duration::from_secs(5))
        .await
        .expect("start command must reach the device");
    let block = bkv_protocol::payload::ControlBlock::decode(&start.payload).unwrap();
    assert_eq!(block.socket_no, 1);
    assert!(block.switch_on);
    assert_eq!(block.duration_min, 60);

    // Device-side end of charge settles the order.
    assert!(emulator.settle(1, SettleReason::Completed, 153, 60).await);
    assert!(wait_for_status(&app.pool, &order_no, 3).await);

    let order = gateway::repo::orders::get_by_order_no(&app.pool, &order_no)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.kwh_0p01, Some(153));
    assert_eq!(order.end_reason.as_deref(), Some("completed"));
    assert!(order.start_time.is_some());
    assert!(order.end_time.is_some());

    // Events are contiguous from 1 and tell the story in order.
    let events = gateway::repo::events::list_for_subject(&app.pool, &order_no)
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "order.created",
            "order.confirmed",
            "charging.started",
            "charging.ended",
            "order.completed",
        ]
    );
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence_no, i as i64 + 1);
    }
}

#[tokio::test]
async fn busy_port_is_rejected_with_the_conflicting_order() {
    let app = spawn_app().await;
    let emulator = bkv_emulator::connect(app.tcp_addr, EmulatorConfig::default())
        .await
        .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);

    let client = reqwest::Client::new();
    let first = client
        .post(app.url(&format!("/devices/{}/charge", emulator.phy_id)))
        .json(&charge_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let first_body: serde_json::Value = first.json().await.unwrap();
    let first_order = first_body["data"]["order_no"].as_str().unwrap().to_owned();

    let second = client
        .post(app.url(&format!("/devices/{}/charge", emulator.phy_id)))
        .json(&charge_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
    let second_body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(second_body["code"], 409);
    assert_eq!(second_body["data"]["current_order"], first_order.as_str());

    // A different port on the same device is still free.
    let other_port = client
        .post(app.url(&format!("/devices/{}/charge", emulator.phy_id)))
        .json(&charge_body(2))
        .send()
        .await
        .unwrap();
    assert_eq!(other_port.status(), 200);
}

#[tokio::test]
async fn offline_device_is_rejected_without_side_effects() {
    let app = spawn_app().await;

    // Known device, but no live session at all.
    let device_id = gateway::repo::devices::ensure(&app.pool, "82241218000382")
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(app.url("/devices/82241218000382/charge"))
        .json(&charge_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let orders = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM orders")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(orders, 0);
    let outbound = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM outbound_queue")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(outbound, 0);
    let _ = device_id;
}

#[tokio::test]
async fn stop_moves_through_stopping_and_respects_missing_orders() {
    // A long middle-state window keeps the stop_timeout sweep out of the
    // device-settles-first path under test.
    let app = support::spawn_app_with(|config| {
        config.middle_state_timeout = std::time::Duration::from_secs(60);
    })
    .await;
    let emulator = bkv_emulator::connect(app.tcp_addr, EmulatorConfig::default())
        .await
        .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);

    let client = reqwest::Client::new();

    // Stop with nothing active: 404, no order fabricated.
    let premature = client
        .post(app.url(&format!("/devices/{}/stop", emulator.phy_id)))
        .json(&serde_json::json!({ "port_no": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(premature.status(), 404);

    let charge = client
        .post(app.url(&format!("/devices/{}/charge", emulator.phy_id)))
        .json(&charge_body(1))
        .send()
        .await
        .unwrap();
    let charge_body: serde_json::Value = charge.json().await.unwrap();
    let order_no = charge_body["data"]["order_no"].as_str().unwrap().to_owned();
    assert!(wait_for_status(&app.pool, &order_no, 2).await);

    let stop = client
        .post(app.url(&format!("/devices/{}/stop", emulator.phy_id)))
        .json(&serde_json::json!({ "port_no": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(stop.status(), 200);
    let stop_body: serde_json::Value = stop.json().await.unwrap();
    assert_eq!(stop_body["data"]["order_no"], order_no.as_str());

    // The device settles the forced stop: stopping → stopped.
    assert!(wait_for_status(&app.pool, &order_no, 9).await);
    assert!(emulator.settle(1, SettleReason::Stopped, 42, 10).await);
    assert!(wait_for_status(&app.pool, &order_no, 7).await);

    let order = gateway::repo::orders::get_by_order_no(&app.pool, &order_no)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.end_reason.as_deref(), Some("stopped"));
    assert_eq!(order.kwh_0p01, Some(42));
}

#[tokio::test]
async fn rejecting_device_fails_the_order() {
    let app = spawn_app().await;
    let emulator = bkv_emulator::connect(
        app.tcp_addr,
        EmulatorConfig {
            ack_result: 2,
            ..EmulatorConfig::default()
        },
    )
    .await
    .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);

    let client = reqwest::Client::new();
    let response = client
        .post(app.url(&format!("/devices/{}/charge", emulator.phy_id)))
        .json(&charge_body(1))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let order_no = body["data"]["order_no"].as_str().unwrap().to_owned();

    assert!(wait_for_status(&app.pool, &order_no, 6).await);
    let order = gateway::repo::orders::get_by_order_no(&app.pool, &order_no)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.end_reason.as_deref(), Some("device_result_2"));

    // The refusal was still a delivery: the queue row completes as done and
    // the identical frame is never resent to the device.
    let correlation = format!("start:{order_no}");
    let pool = &app.pool;
    let corr = correlation.as_str();
    let done = support::wait_for(Duration::from_secs(5), || async move {
        let status = sqlx::query_scalar::<_, i16>(
            "SELECT status FROM outbound_queue WHERE correlation_id = $1",
        )
        .bind(corr)
        .fetch_one(pool)
        .await
        .unwrap();
        (status == 2).then_some(())
    })
    .await
    .is_some();
    assert!(done, "a rejected command must be marked done, not retried");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let retries = sqlx::query_scalar::<_, i32>(
        "SELECT retry_count FROM outbound_queue WHERE correlation_id = $1",
    )
    .bind(&correlation)
    .fetch_one(&app.pool)
    .await
    .unwrap();
    assert_eq!(retries, 0, "a rejected command must not re-queue");
}
