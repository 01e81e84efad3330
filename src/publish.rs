//! Submission events for metadata indexing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::info;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::token::TokenProvider;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("can't get a token to publish: {0}")]
    Token(String),
    #[error("publishing to {topic} failed: {message}")]
    Rejected { topic: String, message: String },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event and wait for the channel to acknowledge it
    async fn publish(&self, event: &Value) -> Result<(), PublishError>;
}

/// Google Pub/Sub REST publisher
pub struct PubSubPublisher {
    http: reqwest::Client,
    /// e.g. `https://pubsub.googleapis.com/v1`
    endpoint: String,
    /// `projects/{project}/topics/{topic}`
    topic: String,
    token: Arc<dyn TokenProvider>,
}

impl PubSubPublisher {
    pub fn new(endpoint: &str, topic: &str, token: Arc<dyn TokenProvider>) -> reqwest::Result<PubSubPublisher> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(PubSubPublisher {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            topic: topic.to_string(),
            token,
        })
    }
}

#[async_trait]
impl EventPublisher for PubSubPublisher {
    async fn publish(&self, event: &Value) -> Result<(), PublishError> {
        let token = self.token.token().await.map_err(|err| PublishError::Token(err.to_string()))?;
        let data = STANDARD.encode(event.to_string());
        let rejected = |message: String| PublishError::Rejected { topic: self.topic.clone(), message };

        self.http
            .post(format!("{}/{}:publish", self.endpoint, self.topic))
            .bearer_auth(token)
            .json(&json!({ "messages": [{ "data": data }] }))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| rejected(err.to_string()))?;
        info!("Published submission event to {}", self.topic);
        Ok(())
    }
}

/// Writes events to the log instead of a channel, for deployments without indexing
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &Value) -> Result<(), PublishError> {
        info!("Submission event: {event}");
        Ok(())
    }
}

/// Keeps published events in memory
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<Value>>,
    fail: bool,
}

impl MemoryPublisher {
    pub fn new() -> MemoryPublisher {
        MemoryPublisher::default()
    }

    /// A publisher whose channel rejects everything
    pub fn failing() -> MemoryPublisher {
        MemoryPublisher { fail: true, ..MemoryPublisher::default() }
    }

    pub async fn events(&self) -> Vec<Value> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: &Value) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Rejected { topic: "memory".to_string(), message: "channel unavailable".to_string() });
        }
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::Router;

    use super::*;
    use crate::token::{StaticToken, TokenError};

    /// Requests seen by the fake Pub/Sub endpoint
    type Seen = Arc<Mutex<Vec<(String, Option<String>, Value)>>>;

    async fn pubsub(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let log = seen.clone();
        let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap, body: Bytes| {
            let log = log.clone();
            async move {
                let bearer = headers.get("authorization").and_then(|value| value.to_str().ok()).map(str::to_string);
                let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
                log.lock().await.push((uri.path().to_string(), bearer, body));
                (status, "{\"messageIds\": [\"1\"]}")
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v1/"), seen)
    }

    fn publisher(endpoint: &str, token: Arc<dyn TokenProvider>) -> PubSubPublisher {
        PubSubPublisher::new(endpoint, "projects/analysis-runner/topics/submissions", token).unwrap()
    }

    #[tokio::test]
    async fn publishes_base64_event_with_bearer_token() {
        let (endpoint, seen) = pubsub(StatusCode::OK).await;
        let event = json!({"ar-guid": "run-1", "dataset": "fewgenomes"});
        publisher(&endpoint, Arc::new(StaticToken("ya29.access".to_string()))).publish(&event).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        let (path, bearer, body) = &seen[0];
        assert_eq!(path, "/v1/projects/analysis-runner/topics/submissions:publish");
        assert_eq!(bearer.as_deref(), Some("Bearer ya29.access"));
        let data = body["messages"][0]["data"].as_str().unwrap();
        let decoded: Value = serde_json::from_slice(&STANDARD.decode(data).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn rejected_publish_names_the_topic() {
        let (endpoint, _) = pubsub(StatusCode::FORBIDDEN).await;
        let err = publisher(&endpoint, Arc::new(StaticToken("t".to_string()))).publish(&json!({})).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected { ref topic, .. } if topic.ends_with("/submissions")));
    }

    struct NoToken;

    #[async_trait]
    impl TokenProvider for NoToken {
        async fn token(&self) -> Result<String, TokenError> {
            Err(TokenError("metadata server unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn missing_token_is_reported_without_calling_the_channel() {
        let (endpoint, seen) = pubsub(StatusCode::OK).await;
        let err = publisher(&endpoint, Arc::new(NoToken)).publish(&json!({})).await.unwrap_err();
        assert!(matches!(err, PublishError::Token(_)));
        assert!(seen.lock().await.is_empty());
    }
}
