//! HTTP endpoints the engine's integration tests run against.
//!
//! Every route is stateless, so one server can be shared by many tests.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// Longest delay `/slow/{ms}` will honor.
pub const MAX_DELAY_MS: u64 = 30_000;

/// Request metadata reported by `/inspect`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inspection {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body_len: usize,
}

/// The client's socket address as seen by `/peer`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub addr: String,
}

pub fn app() -> Router {
    Router::new()
        .route("/echo", post(echo))
        .route("/status/{code}", any(status))
        .route("/slow/{ms}", get(slow))
        .route("/inspect", any(inspect))
        .route("/close", get(close))
        .route("/peer", get(peer))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(
        listener,
        app().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn echo(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    ([(header::CONTENT_TYPE, content_type)], body)
}

async fn status(Path(code): Path<u16>) -> Result<(StatusCode, String), StatusCode> {
    let code = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    let reason = code.canonical_reason().unwrap_or("").to_string();
    Ok((code, reason))
}

async fn slow(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms.min(MAX_DELAY_MS))).await;
    "slow"
}

async fn inspect(method: axum::http::Method, headers: HeaderMap, body: Bytes) -> Json<Inspection> {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    Json(Inspection {
        method: method.as_str().to_string(),
        headers,
        body_len: body.len(),
    })
}

async fn close() -> impl IntoResponse {
    ([(header::CONNECTION, "close")], "bye")
}

async fn peer(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> Json<Peer> {
    Json(Peer {
        addr: addr.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspection_serializes_headers_in_order() {
        let mut headers = BTreeMap::new();
        headers.insert("x-b".to_string(), "2".to_string());
        headers.insert("x-a".to_string(), "1".to_string());
        let inspection = Inspection {
            method: "GET".to_string(),
            headers,
            body_len: 0,
        };
        let json = serde_json::to_string(&inspection).unwrap();
        assert_eq!(
            json,
            r#"{"method":"GET","headers":{"x-a":"1","x-b":"2"},"body_len":0}"#
        );
    }

    #[test]
    fn peer_roundtrips_through_json() {
        let peer = Peer {
            addr: "127.0.0.1:5000".to_string(),
        };
        let back: Peer = serde_json::from_str(&serde_json::to_string(&peer).unwrap()).unwrap();
        assert_eq!(back, peer);
    }
}
