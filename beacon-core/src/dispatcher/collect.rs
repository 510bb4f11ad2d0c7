//! HTTP collect dispatcher
//!
//! POSTs batches of dispatches as JSON to a collection endpoint:
//!
//! ```json
//! { "events": [ { "id": "...", "timestamp": 1700000000000, "event_name": "...", ... } ] }
//! ```
//!
//! A 2xx response delivers the whole batch; anything else delivers nothing
//! and the batch stays queued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::Dispatcher;
use crate::config::CollectConfig;
use crate::error::{Error, Result};
use crate::network::{NetworkClient, RequestInterceptor};
use crate::types::{Dispatch, Payload};

pub const COLLECT_DISPATCHER_ID: &str = "collect";

/// Request body for the collection endpoint
#[derive(Serialize)]
struct CollectBatch<'a> {
    events: Vec<CollectEvent<'a>>,
}

#[derive(Serialize)]
struct CollectEvent<'a> {
    id: &'a str,
    timestamp: i64,
    #[serde(flatten)]
    payload: &'a Payload,
}

impl<'a> From<&'a Dispatch> for CollectEvent<'a> {
    fn from(dispatch: &'a Dispatch) -> Self {
        Self {
            id: &dispatch.id,
            timestamp: dispatch.timestamp_ms(),
            payload: &dispatch.payload,
        }
    }
}

pub struct CollectDispatcher {
    client: NetworkClient,
    url: String,
    dispatch_limit: usize,
}

impl CollectDispatcher {
    /// Build from configuration. `interceptor` observes every request, usually
    /// the instance's connectivity manager.
    pub fn new(config: &CollectConfig, interceptor: Arc<dyn RequestInterceptor>) -> Result<Self> {
        config.validate()?;

        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("collect.url is required".to_string()))?;

        let client = NetworkClient::new(Duration::from_secs(config.timeout_secs), config.max_retries)?
            .with_interceptor(interceptor);

        Ok(Self {
            client,
            url,
            dispatch_limit: config.dispatch_limit,
        })
    }
}

#[async_trait]
impl Dispatcher for CollectDispatcher {
    fn id(&self) -> &str {
        COLLECT_DISPATCHER_ID
    }

    fn dispatch_limit(&self) -> usize {
        self.dispatch_limit
    }

    async fn dispatch(&self, dispatches: &[Dispatch]) -> Vec<String> {
        let body = CollectBatch {
            events: dispatches.iter().map(CollectEvent::from).collect(),
        };

        match self.client.post_json(&self.url, &body).await {
            Ok(status) => {
                tracing::debug!(count = dispatches.len(), status, "Delivered batch");
                dispatches.iter().map(|d| d.id.clone()).collect()
            }
            Err(e) => {
                tracing::warn!(count = dispatches.len(), error = %e, "Failed to deliver batch");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::RequestResult;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<RequestResult>>);

    impl RequestInterceptor for Outcomes {
        fn on_completion(&self, result: &RequestResult) {
            self.0.lock().unwrap().push(result.clone());
        }
    }

    fn config(url: String) -> CollectConfig {
        CollectConfig {
            enabled: true,
            url: Some(url),
            dispatch_limit: 5,
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    /// Accept one connection, capture the request and answer with `status_line`.
    async fn serve_once(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/events", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
            socket.write_all(response.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&request).to_string();
            text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
        });

        (url, server)
    }

    #[test]
    fn test_requires_url() {
        let config = CollectConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(CollectDispatcher::new(&config, Arc::new(Outcomes::default())).is_err());
    }

    #[test]
    fn test_event_body_flattens_payload() {
        let dispatch = Dispatch::new("page_view");
        let body = CollectBatch {
            events: vec![CollectEvent::from(&dispatch)],
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["events"][0]["id"], dispatch.id.as_str());
        assert_eq!(json["events"][0]["event_name"], "page_view");
        assert_eq!(json["events"][0]["timestamp"], dispatch.timestamp_ms());
    }

    #[tokio::test]
    async fn test_success_delivers_whole_batch() {
        let (url, server) = serve_once("HTTP/1.1 200 OK").await;
        let outcomes = Arc::new(Outcomes::default());
        let dispatcher = CollectDispatcher::new(&config(url), outcomes.clone()).unwrap();

        let batch = vec![Dispatch::new("a"), Dispatch::new("b")];
        let delivered = dispatcher.dispatch(&batch).await;

        assert_eq!(delivered, vec![batch[0].id.clone(), batch[1].id.clone()]);
        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["events"].as_array().unwrap().len(), 2);
        assert_eq!(outcomes.0.lock().unwrap().as_slice(), &[Ok(200)]);
    }

    #[tokio::test]
    async fn test_error_status_delivers_nothing() {
        let (url, _server) = serve_once("HTTP/1.1 400 Bad Request").await;
        let outcomes = Arc::new(Outcomes::default());
        let dispatcher = CollectDispatcher::new(&config(url), outcomes.clone()).unwrap();

        let delivered = dispatcher.dispatch(&[Dispatch::new("a")]).await;

        assert!(delivered.is_empty());
        assert!(matches!(
            outcomes.0.lock().unwrap().as_slice(),
            [Err(crate::network::NetworkError::Status { status: 400, .. })]
        ));
    }
}
