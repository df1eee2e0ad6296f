//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the calls a job needs (liveness probe, image upload, workflow
//! submission, history retrieval, output download) using [`reqwest`].
//! Every call carries its own timeout; none is retried here.

use std::time::Duration;

use serde::Deserialize;

use crate::history::{History, ImageRef};

/// Timeout for the liveness probe on `GET /`.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for `POST /upload/image`.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for `POST /prompt`.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for `GET /history/{prompt_id}`.
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for `GET /view`.
pub const VIEW_TIMEOUT: Duration = Duration::from_secs(60);

/// Folder namespace uploaded images are stored under.
pub const UPLOAD_TYPE_INPUT: &str = "input";

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Response returned by `/upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Stored filename (may differ from the submitted one).
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Probe `GET /`. Returns `Ok(true)` only on HTTP 200.
    pub async fn ping(&self) -> Result<bool, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/", self.api_url))
            .timeout(PING_TIMEOUT)
            .send()
            .await?;

        Ok(response.status() == reqwest::StatusCode::OK)
    }

    /// Upload an image into the `input` folder, overwriting any file of
    /// the same name. Returns the name ComfyUI stored it under.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true")
            .text("type", UPLOAD_TYPE_INPUT);

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// ComfyUI answers `{}` for prompts it does not know; that is not an
    /// HTTP error, see [`History::first_image`].
    pub async fn get_history(&self, prompt_id: &str) -> Result<History, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download the raw bytes of an output image.
    pub async fn view(&self, image: &ImageRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let mut query = vec![
            ("filename", image.filename.as_str()),
            ("subfolder", image.subfolder.as_str()),
        ];
        if let Some(kind) = image.kind.as_deref() {
            query.push(("type", kind));
        }

        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&query)
            .timeout(VIEW_TIMEOUT)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn ping_true_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        assert!(api.ping().await.unwrap());
    }

    #[tokio::test]
    async fn ping_false_on_other_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        assert!(!api.ping().await.unwrap());
    }

    #[tokio::test]
    async fn upload_sends_multipart_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/image"))
            .and(body_string_contains("name=\"overwrite\""))
            .and(body_string_contains("name=\"type\""))
            .and(body_string_contains("filename=\"input_image.png\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "input_image (2).png",
                "subfolder": "",
                "type": "input"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let uploaded = api
            .upload_image(vec![1, 2, 3], "input_image.png")
            .await
            .unwrap();
        assert_eq!(uploaded.name, "input_image (2).png");
        assert_eq!(uploaded.kind.as_deref(), Some("input"));
    }

    #[tokio::test]
    async fn submit_posts_prompt_envelope() {
        let server = MockServer::start().await;
        let workflow = json!({"1": {"class_type": "LoadImage", "inputs": {}}});
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .and(body_json(json!({"prompt": workflow, "client_id": "client-1"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"prompt_id": "p-1", "number": 4})),
            )
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(format!("{}/", server.uri()));
        let submitted = api.submit_workflow(&workflow, "client-1").await.unwrap();
        assert_eq!(submitted.prompt_id, "p-1");
        assert_eq!(submitted.number, 4);
    }

    #[tokio::test]
    async fn submit_non_2xx_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid prompt"))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let result = api.submit_workflow(&json!({}), "c").await;
        assert_matches!(
            result,
            Err(ComfyUIApiError::ApiError { status: 400, body }) if body == "invalid prompt"
        );
    }

    #[tokio::test]
    async fn view_passes_descriptor_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view"))
            .and(query_param("filename", "out_00001_.png"))
            .and(query_param("subfolder", "runs"))
            .and(query_param("type", "output"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8, 8, 7]))
            .mount(&server)
            .await;

        let api = ComfyUIApi::new(server.uri());
        let image = ImageRef {
            filename: "out_00001_.png".into(),
            subfolder: "runs".into(),
            kind: Some("output".into()),
        };
        assert_eq!(api.view(&image).await.unwrap(), vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn unreachable_backend_is_request_error() {
        // Port 9 (discard) is essentially never listening locally.
        let api = ComfyUIApi::new("http://127.0.0.1:9");
        assert_matches!(api.get_history("x").await, Err(ComfyUIApiError::Request(_)));
    }
}
