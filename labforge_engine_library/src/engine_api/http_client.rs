use super::LabEngineAPI;
use crate::services::instance::{LabDescriptor, OwnerKey};
use crate::services::lifecycle::EngineStatus;
use anyhow::Result;
use labforge_library::transaction::TransactionId;
use labforge_library::utils::{format_uri, port::Port};
use labforge_library::{bail_error, bail_typed};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Header carrying the caller's transaction id, so engine logs line up with the client's
pub const TID_HEADER: &str = "x-labforge-tid";

#[derive(Debug)]
/// A non-success response from a remote engine
pub struct EngineApiError {
    pub status: StatusCode,
    pub message: String,
}
impl std::fmt::Display for EngineApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Engine returned {}: {}", self.status, self.message)
    }
}
impl std::error::Error for EngineApiError {}

#[derive(serde::Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct ReloadResponse {
    pub loaded: usize,
}

/// Talks to an engine's HTTP server
pub struct HttpLabEngineAPI {
    client: Client,
    host: String,
    port: Port,
}

impl HttpLabEngineAPI {
    pub fn new(host: &str, port: Port, tid: &TransactionId) -> Result<Self> {
        let client = match Client::builder().build() {
            Ok(c) => c,
            Err(e) => bail_error!(tid=tid, error=%e, "Failed to build HTTP client"),
        };
        Ok(HttpLabEngineAPI {
            client,
            host: host.to_string(),
            port,
        })
    }

    fn uri(&self, path: &str) -> String {
        format_uri(&self.host, self.port, path)
    }

    async fn send(&self, req: RequestBuilder, call: &str, tid: &TransactionId) -> Result<Response> {
        let r = match req.header(TID_HEADER, tid.as_str()).send().await {
            Ok(r) => r,
            Err(e) => bail_error!(tid=tid, error=%e, call=call, host=%self.host, port=self.port, "HTTP error calling engine"),
        };
        let status = r.status();
        if status.is_success() {
            return Ok(r);
        }
        let text = r.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(b) => b.error,
            Err(_) => text,
        };
        bail_typed!(
            EngineApiError { status, message },
            tid = tid,
            call = call,
            status = %status,
            "Engine rejected request"
        )
    }

    async fn parse<T: DeserializeOwned>(r: Response, call: &str, tid: &TransactionId) -> Result<T> {
        match r.json::<T>().await {
            Ok(v) => Ok(v),
            Err(e) => bail_error!(tid=tid, error=%e, call=call, "Failed to parse engine response"),
        }
    }

    async fn owner_call(&self, path: &str, owner: OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        debug!(tid=tid, owner=%owner, path=path, "Sending owner request");
        let r = self.send(self.client.post(self.uri(path)).json(&owner), path, tid).await?;
        Self::parse(r, path, tid).await
    }
}

#[async_trait::async_trait]
impl LabEngineAPI for HttpLabEngineAPI {
    async fn ping(&mut self, tid: TransactionId) -> Result<String> {
        let r = self.send(self.client.get(self.uri("ping")), "ping", &tid).await?;
        match r.text().await {
            Ok(t) => Ok(t),
            Err(e) => bail_error!(tid=tid, error=%e, "Failed to read ping response"),
        }
    }

    async fn request_lab(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        self.owner_call("labs", owner, &tid).await
    }

    async fn report_activity(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        self.owner_call("labs/activity", owner, &tid).await
    }

    async fn stop_lab(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        self.owner_call("labs/stop", owner, &tid).await
    }

    async fn get_lab_status(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        let req = self.client.get(self.uri("labs/status")).query(&owner);
        let r = self.send(req, "labs/status", &tid).await?;
        Self::parse(r, "labs/status", &tid).await
    }

    async fn engine_status(&mut self, tid: TransactionId) -> Result<EngineStatus> {
        let r = self.send(self.client.get(self.uri("status")), "status", &tid).await?;
        Self::parse(r, "status", &tid).await
    }

    async fn reload_templates(&mut self, tid: TransactionId) -> Result<usize> {
        let r = self
            .send(self.client.post(self.uri("templates/reload")), "templates/reload", &tid)
            .await?;
        let body: ReloadResponse = Self::parse(r, "templates/reload", &tid).await?;
        Ok(body.loaded)
    }
}
