//! Streaming responses.
//!
//! A stream goes out as WebSocket text frames when the request is an
//! upgrade, otherwise as newline-delimited JSON over a chunked body. Either
//! way the stream is dropped as soon as the client goes away, which
//! releases any bus subscription it holds.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
    http::{header::CONTENT_TYPE, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tracing::debug;

/// Upgrade extractor that never rejects; a plain request yields `None`.
pub type MaybeUpgrade = Result<WebSocketUpgrade, WebSocketUpgradeRejection>;

pub fn respond<S, T>(upgrade: MaybeUpgrade, stream: S) -> Response
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| pump(socket, stream)),
        Err(_) => ndjson(stream),
    }
}

fn ndjson<S, T>(stream: S) -> Response
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let lines = stream.filter_map(|item| async move {
        match serde_json::to_vec(&item) {
            Ok(mut line) => {
                line.push(b'\n');
                Some(Ok::<_, Infallible>(Bytes::from(line)))
            }
            Err(e) => {
                debug!(error = %e, "Stream item not serializable");
                None
            }
        }
    });

    let mut response = Body::from_stream(lines).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    response
}

async fn pump<S, T>(mut socket: WebSocket, stream: S)
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
            item = stream.next() => {
                let Some(item) = item else { break };
                let text = match serde_json::to_string(&item) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(error = %e, "Stream item not serializable");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}
