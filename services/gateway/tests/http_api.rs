//! API surface: envelope shape, auth, validation, device and order reads.

mod support;

use bkv_emulator::EmulatorConfig;
use support::{spawn_app, spawn_app_with, wait_for_online};

#[tokio::test]
async fn health_endpoints_answer() {
    let app = spawn_app().await;
    let response = reqwest::get(app.url("/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
    let response = reqwest::get(app.url("/readyz")).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn envelope_and_request_id_are_present_on_errors() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let response = client
        .get(app.url("/devices/ffffffffffffff"))
        .header("x-request-id", "req-from-caller")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-from-caller"
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], 404);
    assert_eq!(body["request_id"], "req-from-caller");
    assert!(body["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn api_keys_gate_every_route() {
    let app = spawn_app_with(|config| {
        config.api_keys = vec!["secret-key".to_owned()];
    })
    .await;
    let client = reqwest::Client::new();

    let denied = client.get(app.url("/orders")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let wrong = client
        .get(app.url("/orders"))
        .header("x-api-key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let allowed = client
        .get(app.url("/orders"))
        .header("x-api-key", "secret-key")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
}

#[tokio::test]
async fn charge_validates_its_body() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();
    let response = client
        .post(app.url("/devices/82241218000382/charge"))
        .json(&serde_json::json!({ "port_no": 1, "charge_mode": 9 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn ota_validates_md5_and_target() {
    let app = spawn_app().await;
    let emulator = bkv_emulator::connect(app.tcp_addr, EmulatorConfig::default())
        .await
        .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);
    let client = reqwest::Client::new();

    let bad_md5 = client
        .post(app.url(&format!("/devices/{}/ota", emulator.phy_id)))
        .json(&serde_json::json!({
            "firmware_url": "https://firmware.example/v2.bin",
            "version": "2.0.0",
            "md5": "notahash",
            "size": 1024,
            "target_type": 1,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_md5.status(), 400);

    let bad_target = client
        .post(app.url(&format!("/devices/{}/ota", emulator.phy_id)))
        .json(&serde_json::json!({
            "firmware_url": "https://firmware.example/v2.bin",
            "version": "2.0.0",
            "md5": "00112233445566778899aabbccddeeff",
            "size": 1024,
            "target_type": 7,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_target.status(), 400);

    let accepted = client
        .post(app.url(&format!("/devices/{}/ota", emulator.phy_id)))
        .json(&serde_json::json!({
            "firmware_url": "https://firmware.example/v2.bin",
            "version": "2.0.0",
            "md5": "00112233445566778899aabbccddeeff",
            "size": 1024,
            "target_type": 1,
            "target_socket": 0,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 200);
    let body: serde_json::Value = accepted.json().await.unwrap();
    assert!(body["data"]["message_id"].as_i64().unwrap() > 0);

    // The firmware push reaches the device and is acknowledged.
    let ota = emulator
        .wait_for_command(bkv_protocol::command::OTA_PUSH, std::time::Duration::from_secs(5))
        .await
        .expect("ota push should reach the device");
    let push = bkv_protocol::payload::OtaPush::decode(&ota.payload).unwrap();
    assert_eq!(push.version, "2.0.0");
    assert_eq!(push.size, 1024);
}

#[tokio::test]
async fn params_and_network_reach_the_device() {
    let app = spawn_app().await;
    let emulator = bkv_emulator::connect(app.tcp_addr, EmulatorConfig::default())
        .await
        .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);
    let client = reqwest::Client::new();

    let params = client
        .post(app.url(&format!("/devices/{}/params", emulator.phy_id)))
        .json(&serde_json::json!({
            "params": [ { "id": 16, "value": 3600 }, { "id": 17, "value": 1 } ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(params.status(), 200);

    let network = client
        .post(app.url(&format!("/devices/{}/network", emulator.phy_id)))
        .json(&serde_json::json!({
            "channel": 11,
            "nodes": [ { "socket_no": 0, "mac": "AA:BB:CC:00:01:02" } ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(network.status(), 200);

    let frame = emulator
        .wait_for_command(
            bkv_protocol::command::PARAM_SET,
            std::time::Duration::from_secs(5),
        )
        .await
        .expect("param set should reach the device");
    let decoded = bkv_protocol::payload::decode_param_set(&frame.payload).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].value, 3600);

    let frame = emulator
        .wait_for_command(
            bkv_protocol::command::NETWORK_CONFIG,
            std::time::Duration::from_secs(5),
        )
        .await
        .expect("network config should reach the device");
    let config = bkv_protocol::payload::NetworkConfig::decode(&frame.payload).unwrap();
    assert_eq!(config.channel, 11);
    assert_eq!(config.nodes[0].mac, [0xAA, 0xBB, 0xCC, 0x00, 0x01, 0x02]);
}

#[tokio::test]
async fn device_read_reports_ports_and_consistency() {
    let app = spawn_app().await;
    let emulator = bkv_emulator::connect(app.tcp_addr, EmulatorConfig::default())
        .await
        .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);

    // The initial status report lands moments after the first heartbeat;
    // poll until all four ports are on the books.
    let client = reqwest::Client::new();
    let data = support::wait_for(std::time::Duration::from_secs(5), || {
        let client = client.clone();
        let url = app.url(&format!("/devices/{}", emulator.phy_id));
        async move {
            let body: serde_json::Value = client.get(url).send().await.ok()?.json().await.ok()?;
            (body["data"]["ports"].as_array()?.len() == 4).then(|| body["data"].clone())
        }
    })
    .await
    .expect("all ports should be reported");
    assert_eq!(data["phy_id"], emulator.phy_id.as_str());
    assert_eq!(data["online"], true);
    assert_eq!(data["consistency_status"], "ok");
    assert_eq!(data["ports"][0]["state"], "idle");
}

#[tokio::test]
async fn orders_paginate_and_filter() {
    let app = spawn_app().await;
    let emulator = bkv_emulator::connect(app.tcp_addr, EmulatorConfig::default())
        .await
        .unwrap();
    assert!(wait_for_online(&app, &emulator.phy_id).await);
    let client = reqwest::Client::new();

    let mut order_nos = Vec::new();
    for port in 1..=3u8 {
        let response = client
            .post(app.url(&format!("/devices/{}/charge", emulator.phy_id)))
            .json(&serde_json::json!({
                "port_no": port,
                "charge_mode": 1,
                "duration_minutes": 30,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        order_nos.push(body["data"]["order_no"].as_str().unwrap().to_owned());
    }

    let page = client
        .get(app.url("/orders?limit=2&offset=0"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = page.json().await.unwrap();
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["orders"].as_array().unwrap().len(), 2);

    let single = client
        .get(app.url(&format!("/orders/{}", order_nos[0])))
        .send()
        .await
        .unwrap();
    assert_eq!(single.status(), 200);
    let body: serde_json::Value = single.json().await.unwrap();
    assert_eq!(body["data"]["order_no"], order_nos[0].as_str());
    assert_eq!(body["data"]["port_no"], 1);

    let missing = client
        .get(app.url("/orders/THD0000000000999"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let filtered = client
        .get(app.url("/orders?status=12"))
        .send()
        .await
        .unwrap();
    assert_eq!(filtered.status(), 400);
}
