//! Webhook push worker.
//!
//! Polls the event table for deliverable rows and POSTs them to the
//! configured webhook in strict per-subject sequence order. A failed push
//! blocks later events of the same subject until it succeeds or parks after
//! five attempts; other subjects keep flowing.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::repo;
use crate::state::AppState;

pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let Some(webhook_url) = state.config.webhook_url.clone() else {
        info!("no webhook configured, event push disabled");
        return;
    };
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "building the push client failed, event push disabled");
            return;
        }
    };

    let mut tick = tokio::time::interval(state.config.event_push_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("event push worker stopping");
                    return;
                }
            }
            _ = tick.tick() => {
                if let Err(e) = push_batch(&state, &client, &webhook_url).await {
                    warn!(error = %e, "event push batch failed");
                }
            }
        }
    }
}

async fn push_batch(
    state: &AppState,
    client: &reqwest::Client,
    webhook_url: &str,
) -> Result<(), sqlx::Error> {
    let batch = repo::events::fetch_pushable(&state.pool, 100).await?;
    if batch.is_empty() {
        return Ok(());
    }
    debug!(n = batch.len(), "pushing events");

    let mut blocked: HashSet<String> = HashSet::new();
    for event in batch {
        if blocked.contains(&event.order_no) {
            continue;
        }
        let body = serde_json::json!({
            "event_id": event.id,
            "order_no": event.order_no,
            "sequence_no": event.sequence_no,
            "event_type": event.event_type,
            "payload": event.payload_json,
            "test_session_id": event.test_session_id,
            "timestamp": Utc::now().timestamp(),
        });
        let outcome = client
            .post(webhook_url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match outcome {
            Ok(_) => {
                repo::events::mark_pushed(&state.pool, event.id).await?;
                state.metrics.event_push("pushed");
            }
            Err(e) => {
                warn!(
                    order_no = %event.order_no,
                    sequence_no = event.sequence_no,
                    error = %e,
                    "event push failed"
                );
                repo::events::mark_push_failed(&state.pool, event.id, &e.to_string()).await?;
                state.metrics.event_push("failed");
                // Order within a subject is the contract: stop here.
                blocked.insert(event.order_no.clone());
            }
        }
    }
    Ok(())
}
