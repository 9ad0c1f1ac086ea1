//! Server-sent activity stream
//!
//! A stream is a cursor read over the activity table, not a push
//! subscription: the client supplies `since_id`, the daemon replays
//! everything after it in order and then tails the log. Reconnecting with
//! the last delivered id yields no gaps and no duplicates.

use super::handlers::EventResponse;
use super::ControlContext;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const BATCH: u64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
	pub since_id: Option<i64>,
	pub kind: Option<String>,
}

pub async fn stream_activity(
	State(ctx): State<Arc<ControlContext>>,
	Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
	let store = ctx.store.clone();
	let kind = query.kind.as_deref().and_then(|k| k.parse().ok());
	let since = query.since_id.unwrap_or(0);

	let stream = async_stream::stream! {
		let guard = store.cursors().register(since);
		let mut cursor = since;
		loop {
			match store.read_activity(cursor, BATCH, kind).await {
				Ok(events) if events.is_empty() => {
					tokio::time::sleep(POLL_INTERVAL).await;
				}
				Ok(events) => {
					for event in events {
						cursor = event.id;
						guard.advance(cursor);
						let payload = EventResponse::from(event);
						if let Ok(event) = Event::default()
							.id(payload.id.to_string())
							.event(payload.kind.clone())
							.json_data(&payload)
						{
							yield Ok(event);
						}
					}
				}
				Err(_) => {
					tokio::time::sleep(Duration::from_secs(1)).await;
				}
			}
		}
	};

	Sse::new(stream).keep_alive(KeepAlive::default())
}
