//! Server-Sent Events stream of pipeline events
//!
//! A client follows one upload (`?upload_id=`). The upload's importer
//! allowlist is checked before the stream opens.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{parse_id, request_origin};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub upload_id: Option<String>,
}

/// GET /events?upload_id=
pub async fn event_stream(
    State(state): State<AppState>,
    query: Result<Query<EventFilter>, QueryRejection>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Query(filter) =
        query.map_err(|e| ApiError::BadRequest(format!("Invalid query parameters: {}", e.body_text())))?;
    let upload_id = filter
        .upload_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Missing required parameter 'upload_id'".to_string()))?;
    let upload_id = parse_id(upload_id, "upload")?;

    state
        .pipeline
        .authorize_upload(upload_id, request_origin(&headers).as_deref())
        .await?;

    info!(upload_id = %upload_id, "SSE client connected");

    let mut rx = state.event_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                Ok(event) = rx.recv() => {
                    if event.upload_id() == upload_id {
                        let event_type = event.event_type();
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                yield Ok(Event::default().event(event_type).data(json));
                            }
                            Err(e) => {
                                warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                            }
                        }
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
