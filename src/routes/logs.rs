use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::log_capture::LogSource;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub source: Option<LogSource>,
}

fn default_limit() -> usize {
    100
}

/// GET /logs/history: recent entries, newest first.
pub async fn log_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let total = state.logs.history().await.len();
    let entries = state.logs.recent(query.limit, query.source.as_ref()).await;

    Json(serde_json::json!({
        "entries": entries,
        "total": total,
        "limit": query.limit,
    }))
}

/// GET /logs/stream: SSE stream of live entries.
pub async fn log_stream(
    State(state): State<SharedState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.logs.subscribe();
    let stream = BroadcastStream::new(rx);

    let event_stream = stream.filter_map(|result| {
        match result {
            Ok(entry) => {
                let data = serde_json::to_string(&entry).unwrap_or_default();
                Some(Ok(Event::default().event("log").data(data)))
            }
            Err(_) => None, // lagged
        }
    });

    Sse::new(event_stream).keep_alive(KeepAlive::default())
}
