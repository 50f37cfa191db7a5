//! HTTP server: metrics, health endpoints and the backup/restore API

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::api::{self, ApiContext, ApiResult};
use crate::error::Result;
use crate::metrics::{encode_metrics, OPERATOR_HEALTH};

/// Start the HTTP server; the API routes are served only when `api` is set
pub async fn serve(port: u16, api: Option<Arc<ApiContext>>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(api = api.is_some(), "HTTP server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let api = api.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, api.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    api: Option<Arc<ApiContext>>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await?.to_bytes();
    Ok(route(&method, &path, &body, api.as_deref()).await)
}

/// Dispatch a request by method and path
pub async fn route(method: &Method, path: &str, body: &[u8], api: Option<&ApiContext>) -> Response<Full<Bytes>> {
    debug!(%method, path, "Handling request");
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" => text_response(StatusCode::OK, "ok"),
        "/backup" | "/restore" => match api {
            Some(ctx) => api_response(method, path, body, ctx).await,
            None => not_found_response(),
        },
        _ => not_found_response(),
    }
}

async fn api_response(method: &Method, path: &str, body: &[u8], ctx: &ApiContext) -> Response<Full<Bytes>> {
    let result: ApiResult = match (method, path) {
        (&Method::POST, "/backup") => api::create_backup(ctx, body).await,
        (&Method::GET, "/backup") => api::get_backup(ctx, body).await,
        (&Method::POST, "/restore") => api::create_restore(ctx, body).await,
        (&Method::GET, "/restore") => api::get_restore(ctx, body).await,
        _ => return text_response(StatusCode::METHOD_NOT_ALLOWED, "Invalid method"),
    };

    match result {
        Ok(json) => response(StatusCode::OK, "application/json", json),
        Err(e) => {
            debug!(status = %e.status, error = %e.message, "Request failed");
            text_response(e.status, e.message)
        }
    }
}

fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        resp.headers_mut().insert(CONTENT_TYPE, value);
    }
    resp
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    response(status, "text/plain; charset=utf-8", body)
}

fn metrics_response() -> Response<Full<Bytes>> {
    match encode_metrics() {
        Ok((content_type, buffer)) => response(StatusCode::OK, &content_type, buffer),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

fn not_found_response() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}
