use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use log::{info, warn};

/// Log every request on the way in and its status and duration on the way out
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    info!("{method} {path}");

    let response = next.run(request).await;

    let status = response.status();
    let elapsed = start.elapsed().as_millis();
    if status.is_server_error() {
        warn!("{method} {path} -> {} ({elapsed} ms)", status.as_u16());
    } else {
        info!("{method} {path} -> {} ({elapsed} ms)", status.as_u16());
    }
    response
}
