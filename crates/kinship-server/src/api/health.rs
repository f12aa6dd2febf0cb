//! Health check endpoint

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use kinship_core::CoreError;

use crate::server::KinshipServer;

fn status(check: Result<bool, CoreError>) -> &'static str {
    match check {
        Ok(true) => "UP",
        Ok(false) | Err(_) => "DOWN",
    }
}

/// Report the durable store, the replication channel and the subscriber
///
/// Responds 503 when any of them is down.
pub async fn health_check(State(server): State<Arc<KinshipServer>>) -> impl IntoResponse {
    let service = server.service();
    let store = status(service.cache().repository().health_check().await);
    let channel = status(service.replicator().channel().health_check().await);
    let subscriber = status(Ok(service.replicator().is_live()));
    debug!(store, channel, subscriber, "Health check requested");

    let overall = if [store, channel, subscriber].iter().all(|check| *check == "UP") {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if overall == StatusCode::OK { "UP" } else { "DOWN" },
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "durableStore": { "status": store },
            "replicationChannel": { "status": channel },
            "replicationSubscriber": { "status": subscriber },
        },
        "cachedEntities": service.cache().len(),
    });

    (overall, Json(body))
}
