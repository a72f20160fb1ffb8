//! Control-plane client.
//!
//! Long-running operations report their outcome only through
//! [`ControlPlane::task_complete`] / [`ControlPlane::task_failed`], keyed by
//! the task id the request carried.

use crate::error::{GuestError, Result};
use crate::types::GuestStatus;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A guest as known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteGuest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub pending_deleted: bool,
}

/// Outcome of verifying a guest found on disk but unknown upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyGuestVerdict {
    Keep,
    Remove,
}

/// Runtime status pushed upstream after state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: GuestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub block_jobs: usize,
}

impl StatusReport {
    pub fn new(status: GuestStatus) -> Self {
        Self { status, reason: None, block_jobs: 0 }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn task_complete(&self, task_id: &str, data: Value) -> Result<()>;

    async fn task_failed(&self, task_id: &str, reason: &str) -> Result<()>;

    /// Guests assigned to `host_id`, either live ones or those pending deletion.
    async fn list_host_guests(&self, host_id: &str, pending_delete: bool) -> Result<Vec<RemoteGuest>>;

    async fn verify_dirty_guest(&self, host_id: &str, guest_id: &str) -> Result<DirtyGuestVerdict>;

    async fn sync_guest_status(&self, guest_id: &str, report: &StatusReport) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct GuestList {
    #[serde(default)]
    servers: Vec<RemoteGuest>,
}

#[derive(Debug, Deserialize)]
struct VerifyReply {
    action: DirtyGuestVerdict,
}

/// Control-plane client over its JSON HTTP API.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GuestError::InvalidConfig {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), token })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| GuestError::ControlPlane { reason: e.to_string() })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GuestError::ControlPlane { reason: format!("{}: {}", status, body) });
        }
        Ok(response)
    }

    async fn post(&self, path: &str, body: Value) -> Result<reqwest::Response> {
        self.send(self.client.post(self.url(path)).json(&body)).await
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    #[instrument(skip(self, data))]
    async fn task_complete(&self, task_id: &str, data: Value) -> Result<()> {
        self.post(&format!("tasks/{}/complete", task_id), data).await?;
        debug!("Task completion reported");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn task_failed(&self, task_id: &str, reason: &str) -> Result<()> {
        self.post(&format!("tasks/{}/fail", task_id), json!({ "reason": reason })).await?;
        warn!("Task failure reported");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_host_guests(&self, host_id: &str, pending_delete: bool) -> Result<Vec<RemoteGuest>> {
        let request = self.client.get(self.url("servers")).query(&[
            ("host_id", host_id),
            ("pending_delete", if pending_delete { "true" } else { "false" }),
        ]);
        let list: GuestList = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| GuestError::ControlPlane { reason: format!("bad guest list: {}", e) })?;
        Ok(list.servers)
    }

    #[instrument(skip(self))]
    async fn verify_dirty_guest(&self, host_id: &str, guest_id: &str) -> Result<DirtyGuestVerdict> {
        let reply: VerifyReply = self
            .post(&format!("servers/{}/dirty-server-verify", guest_id), json!({ "host_id": host_id }))
            .await?
            .json()
            .await
            .map_err(|e| GuestError::ControlPlane { reason: format!("bad verify reply: {}", e) })?;
        Ok(reply.action)
    }

    #[instrument(skip(self, report), fields(status = %report.status))]
    async fn sync_guest_status(&self, guest_id: &str, report: &StatusReport) -> Result<()> {
        let body = serde_json::to_value(report).map_err(GuestError::internal)?;
        self.post(&format!("servers/{}/status", guest_id), body).await.map(|_| ())
    }
}
