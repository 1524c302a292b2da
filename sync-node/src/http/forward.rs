//! Verbatim forwarding of a non-leader's lock request to the current
//! leader: same method, path, query string, headers and body; the leader's
//! JSON response and status code are relayed back unchanged.

use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ApiError;
use crate::http::SharedNode;

pub async fn forward_to_leader(node: &SharedNode, req: Request<Body>) -> Result<Response, ApiError> {
    let target = node.forward_target().await?;
    let path_and_query = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = format!("{target}{path_and_query}");
    let method = req.method().clone();
    let headers = req.headers().clone();

    let body_bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ApiError::ForwardFailed(e.to_string()))?;

    let client = reqwest::Client::new();
    let mut builder = client.request(method_to_reqwest(&method), &url).body(body_bytes.to_vec());
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let resp = builder
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| ApiError::ForwardFailed(e.to_string()))?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::json!({}));
    Ok((status, Json(body)).into_response())
}

fn method_to_reqwest(method: &axum::http::Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET)
}
