//! Server-sent event responder.
//!
//! Every stream opens with exactly one `heartbeat` event, then relays each
//! envelope published on the subscribed channel as an event of the given
//! name. The stream ends when the client goes away (the response body is
//! dropped, which drops the receiver and unsubscribes) or when the channel
//! closes. There is no resume: envelopes published while a client is
//! disconnected are lost to it.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use tokio::sync::broadcast::Receiver;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// Name of the first event on every stream.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Data of the heartbeat event.
pub const HEARTBEAT_DATA: &str = r#"{"status":"connected"}"#;

/// Interval of SSE keep-alive comments on idle streams.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Builds an SSE response from a channel receiver.
///
/// `receiver` must be subscribed before this is called so nothing published
/// after the subscription is missed.
pub fn sse_response(
    receiver: Receiver<String>,
    event_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let heartbeat = tokio_stream::once(Ok(Event::default()
        .event(HEARTBEAT_EVENT)
        .data(HEARTBEAT_DATA)));

    let envelopes = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(data) => Some(Ok(Event::default().event(event_name).data(data))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(event = event_name, skipped, "Stream subscriber lagged, envelopes skipped");
            None
        }
    });

    Sse::new(heartbeat.chain(envelopes)).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::EventHub;
    use axum::body::Body;
    use axum::response::IntoResponse;

    async fn next_chunk(body: &mut axum::body::BodyDataStream) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
            .await
            .expect("stream produced nothing")
            .expect("stream ended")
            .unwrap();
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    fn body_of(hub: &EventHub, channel: &str, event: &'static str) -> Body {
        sse_response(hub.subscribe(channel), event)
            .into_response()
            .into_body()
    }

    #[tokio::test]
    async fn heartbeat_comes_first_even_without_data() {
        let hub = EventHub::new();
        let response = sse_response(hub.subscribe("messages"), "message").into_response();
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = response.into_body().into_data_stream();
        let first = next_chunk(&mut body).await;
        assert_eq!(
            first,
            format!("event: {HEARTBEAT_EVENT}\ndata: {HEARTBEAT_DATA}\n\n")
        );
    }

    #[tokio::test]
    async fn published_envelopes_follow_heartbeat() {
        let hub = EventHub::new();
        let mut body = body_of(&hub, "signals:bob", "signal").into_data_stream();
        next_chunk(&mut body).await;

        hub.publish("signals:bob", r#"{"type":"offer"}"#);
        hub.publish("signals:alice", r#"{"type":"ignored"}"#);
        hub.publish("signals:bob", r#"{"type":"answer"}"#);

        assert_eq!(
            next_chunk(&mut body).await,
            "event: signal\ndata: {\"type\":\"offer\"}\n\n"
        );
        assert_eq!(
            next_chunk(&mut body).await,
            "event: signal\ndata: {\"type\":\"answer\"}\n\n"
        );
    }

    #[tokio::test]
    async fn dropping_the_body_unsubscribes() {
        let hub = EventHub::new();
        let body = body_of(&hub, "messages", "message");
        assert_eq!(hub.channel_subscriber_count("messages"), 1);

        drop(body);
        assert_eq!(hub.channel_subscriber_count("messages"), 0);
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_ahead() {
        let hub = EventHub::with_capacity(2);
        let mut body = body_of(&hub, "messages", "message").into_data_stream();
        next_chunk(&mut body).await;

        for i in 0..5 {
            hub.publish("messages", format!("m{i}"));
        }

        assert_eq!(next_chunk(&mut body).await, "event: message\ndata: m3\n\n");
        assert_eq!(next_chunk(&mut body).await, "event: message\ndata: m4\n\n");
    }
}
