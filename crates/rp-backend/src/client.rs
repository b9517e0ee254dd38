// SPDX-License-Identifier: MIT OR Apache-2.0
//! One HTTP + WebSocket connection to one render backend.

use crate::wire::{
    HistoryEntry, PromptRequest, PromptResponse, PushMessage, QueueSnapshot, UploadAck,
};
use crate::BackendClientError;
use futures::stream::{Stream, StreamExt};
use rp_core::FolderKind;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Default per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one backend, tagged with the caller's client id.
#[derive(Clone)]
pub struct BackendClient {
    address: String,
    base_url: String,
    client_id: String,
    http: reqwest::Client,
}

impl BackendClient {
    /// Create a client for `address` (with or without an `http://` scheme)
    /// identified as `client_id`.
    pub fn new(address: impl Into<String>, client_id: impl Into<String>) -> Self {
        let address = address.into();
        let base_url = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Self {
            address,
            base_url,
            client_id: client_id.into(),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
        }
    }

    /// The address this client talks to, as registered.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The client id sent with submissions and the WebSocket handshake.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // -----------------------------------------------------------------------
    // Job lifecycle
    // -----------------------------------------------------------------------

    /// Submit a bound workflow; returns the backend's opaque prompt id.
    pub async fn submit(&self, workflow: Value) -> Result<String, BackendClientError> {
        let body = PromptRequest {
            prompt: workflow,
            client_id: self.client_id.clone(),
        };
        let resp: PromptResponse = self.post_json("/prompt", &body).await?;
        debug!(address = %self.address, prompt_id = %resp.prompt_id, "workflow submitted");
        Ok(resp.prompt_id)
    }

    /// Fetch one prompt's history record; `None` while the backend has not
    /// recorded the prompt yet.
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, BackendClientError> {
        let map: BTreeMap<String, HistoryEntry> =
            self.get_json(&format!("/history/{prompt_id}")).await?;
        Ok(map.into_iter().find(|(k, _)| k == prompt_id).map(|(_, v)| v))
    }

    /// Fetch the full history map.
    pub async fn get_all_history(
        &self,
    ) -> Result<BTreeMap<String, HistoryEntry>, BackendClientError> {
        self.get_json("/history").await
    }

    /// Current queue depth.
    pub async fn get_queue(&self) -> Result<QueueSnapshot, BackendClientError> {
        self.get_json("/queue").await
    }

    /// Ask the backend to interrupt its current execution.
    pub async fn interrupt(&self) -> Result<(), BackendClientError> {
        let url = format!("{}/interrupt", self.base_url);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))?;
        self.check_status(resp).await.map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Download a file from the backend's `output`/`input`/`temp` folder.
    pub async fn download(
        &self,
        filename: &str,
        subfolder: &str,
        kind: FolderKind,
    ) -> Result<Vec<u8>, BackendClientError> {
        let mut query = vec![
            ("filename", filename.to_string()),
            ("type", kind.as_str().to_string()),
        ];
        if !subfolder.is_empty() {
            query.push(("subfolder", subfolder.to_string()));
        }
        let url = format!("{}/view", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))?;
        let resp = self.check_status(resp).await?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))
    }

    /// Upload bytes into the backend's input folder.
    pub async fn upload(
        &self,
        data: Vec<u8>,
        filename: &str,
        subfolder: &str,
        overwrite: bool,
    ) -> Result<UploadAck, BackendClientError> {
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| BackendClientError::Protocol {
                address: self.address.clone(),
                detail: e.to_string(),
            })?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("subfolder", subfolder.to_string())
            .text("overwrite", overwrite.to_string());

        let url = format!("{}/upload/image", self.base_url);
        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))?;
        let resp = self.check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))
    }

    // -----------------------------------------------------------------------
    // Introspection read-throughs
    // -----------------------------------------------------------------------

    /// Node definitions; all classes, or one.
    pub async fn object_info(&self, class: Option<&str>) -> Result<Value, BackendClientError> {
        match class {
            Some(c) => self.get_json(&format!("/object_info/{c}")).await,
            None => self.get_json("/object_info").await,
        }
    }

    /// Model category names.
    pub async fn models(&self) -> Result<Vec<String>, BackendClientError> {
        self.get_json("/models").await
    }

    /// Models in one category.
    pub async fn models_in(&self, category: &str) -> Result<Vec<String>, BackendClientError> {
        self.get_json(&format!("/models/{category}")).await
    }

    /// Available embeddings.
    pub async fn embeddings(&self) -> Result<Vec<String>, BackendClientError> {
        self.get_json("/embeddings").await
    }

    /// Installed extensions.
    pub async fn extensions(&self) -> Result<Vec<String>, BackendClientError> {
        self.get_json("/extensions").await
    }

    /// System statistics, passed through uninterpreted.
    pub async fn system_stats(&self) -> Result<Value, BackendClientError> {
        self.get_json("/system_stats").await
    }

    // -----------------------------------------------------------------------
    // Push stream
    // -----------------------------------------------------------------------

    /// Connect the WebSocket and yield push messages, optionally scoped to
    /// one prompt id. The stream ends silently on disconnect; callers must
    /// tolerate the end (the tracker's polling task covers the gap).
    pub async fn listen(
        &self,
        prompt_id: Option<String>,
    ) -> Result<Pin<Box<dyn Stream<Item = PushMessage> + Send>>, BackendClientError> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.base_url)
        };
        let url = format!("{ws_base}/ws?clientId={}", self.client_id);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| BackendClientError::Network {
                address: self.address.clone(),
                detail: e.to_string(),
            })?;
        debug!(address = %self.address, "websocket connected");

        let address = self.address.clone();
        let stream = socket
            .take_while(|item| futures::future::ready(item.is_ok()))
            .filter_map(move |item| {
                let address = address.clone();
                let prompt_id = prompt_id.clone();
                futures::future::ready(match item {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PushMessage>(&text) {
                        Ok(msg) => {
                            // Scope to our prompt when both sides name one.
                            match (&prompt_id, msg.prompt_id()) {
                                (Some(want), Some(got)) if want != got => None,
                                _ => Some(msg),
                            }
                        }
                        Err(e) => {
                            warn!(address = %address, error = %e, "unparseable push message");
                            None
                        }
                    },
                    // Binary frames carry preview image data; not our concern.
                    _ => None,
                })
            });
        Ok(Box::pin(stream))
    }

    // -----------------------------------------------------------------------
    // HTTP plumbing
    // -----------------------------------------------------------------------

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))?;
        let resp = self.check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))?;
        let resp = self.check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| BackendClientError::from_reqwest(&self.address, e))
    }

    async fn check_status(
        &self,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, BackendClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendClientError::Backend {
            address: self.address.clone(),
            status: status.as_u16(),
            body,
        })
    }
}
