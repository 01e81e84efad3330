//! Outbound credentials for the pub/sub channel and the workflow engine

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

const METADATA_SERVER: &str = "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default";

#[derive(Debug, thiserror::Error)]
#[error("failed to mint token: {0}")]
pub struct TokenError(pub String);

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, TokenError>;
}

/// Which kind of token to request from the instance metadata server
#[derive(Clone, Debug)]
pub enum TokenKind {
    /// OAuth access token, for Google APIs
    Access,
    /// OIDC identity token for a specific audience, for IAP-fronted services
    Identity { audience: String },
}

/// Mints tokens for the service account the process runs as
pub struct MetadataServerToken {
    kind: TokenKind,
    /// Service account base URL, `/token` and `/identity` live below it
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

impl MetadataServerToken {
    pub fn new(kind: TokenKind) -> MetadataServerToken {
        MetadataServerToken::with_endpoint(kind, METADATA_SERVER)
    }

    pub fn with_endpoint(kind: TokenKind, endpoint: &str) -> MetadataServerToken {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        MetadataServerToken { kind, endpoint: endpoint.trim_end_matches('/').to_string(), http }
    }
}

#[async_trait]
impl TokenProvider for MetadataServerToken {
    async fn token(&self) -> Result<String, TokenError> {
        let request = match &self.kind {
            TokenKind::Access => self.http.get(format!("{}/token", self.endpoint)),
            TokenKind::Identity { audience } => self.http
                .get(format!("{}/identity", self.endpoint))
                .query(&[("audience", audience.as_str()), ("format", "full")]),
        };
        let response = request
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| TokenError(err.to_string()))?;

        match self.kind {
            TokenKind::Access => response.json::<AccessTokenResponse>()
                .await
                .map(|body| body.access_token)
                .map_err(|err| TokenError(err.to_string())),
            TokenKind::Identity { .. } => response.text()
                .await
                .map(|body| body.trim().to_string())
                .map_err(|err| TokenError(err.to_string())),
        }
    }
}

/// Fixed token, e.g. handed to a job through its environment
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    fn from_metadata_server(headers: &HeaderMap) -> bool {
        headers.get("Metadata-Flavor").is_some_and(|value| value == "Google")
    }

    async fn metadata_server() -> String {
        let app = Router::new()
            .route("/token", get(|headers: HeaderMap| async move {
                if !from_metadata_server(&headers) {
                    return StatusCode::FORBIDDEN.into_response();
                }
                Json(json!({"access_token": "ya29.access", "expires_in": 3599, "token_type": "Bearer"})).into_response()
            }))
            .route("/identity", get(|headers: HeaderMap, Query(params): Query<HashMap<String, String>>| async move {
                if !from_metadata_server(&headers) || params.get("format").map(String::as_str) != Some("full") {
                    return StatusCode::BAD_REQUEST.into_response();
                }
                let audience = params.get("audience").cloned().unwrap_or_default();
                format!("id-token-for-{audience}\n").into_response()
            }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn access_token_comes_from_metadata_server() {
        let endpoint = metadata_server().await;
        let token = MetadataServerToken::with_endpoint(TokenKind::Access, &endpoint).token().await.unwrap();
        assert_eq!(token, "ya29.access");
    }

    #[tokio::test]
    async fn identity_token_is_minted_for_audience() {
        let endpoint = metadata_server().await;
        let kind = TokenKind::Identity { audience: "https://cromwell.example.org".to_string() };
        let token = MetadataServerToken::with_endpoint(kind, &endpoint).token().await.unwrap();
        assert_eq!(token, "id-token-for-https://cromwell.example.org");
    }

    #[tokio::test]
    async fn unreachable_metadata_server_is_token_error() {
        let app: Router = Router::new().fallback(|| async { StatusCode::SERVICE_UNAVAILABLE });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let token = MetadataServerToken::with_endpoint(TokenKind::Access, &format!("http://{addr}"));
        assert!(token.token().await.is_err());
    }
}
