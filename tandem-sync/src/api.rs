//! HTTP calls made around the channel: resolving a room's channel path
//! before connecting, and periodic liveness reports.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SocketPathRequest<'a> {
    room_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocketPathResponse {
    socket_path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    room_id: &'a str,
    username: &'a str,
}

#[derive(Clone)]
pub struct RoomApi {
    http: Client,
    base_url: String,
}

impl RoomApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Ask the backend which channel path serves `room_id`.
    pub async fn resolve_socket_path(&self, room_id: &str) -> Result<String, ApiError> {
        let response: SocketPathResponse = self
            .post("/api/get-socket-path", &SocketPathRequest { room_id })
            .await?;
        log::debug!("Room {room_id} served on {}", response.socket_path);
        Ok(response.socket_path)
    }

    /// Report that `username` is still present in `room_id`.
    pub async fn heartbeat(&self, room_id: &str, username: &str) -> Result<(), ApiError> {
        let url = format!("{}/api/heartbeat", self.base_url);
        let res = self
            .http
            .post(url)
            .json(&HeartbeatRequest { room_id, username })
            .send()
            .await?;
        check(res).await.map(|_| ())
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let res = self.http.post(url).json(body).send().await?;
        Ok(check(res).await?.json::<T>().await?)
    }
}

async fn check(res: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if res.status().is_success() {
        Ok(res)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(ApiError::UnexpectedStatus { status, body })
    }
}
