//! Job orchestration: turns one job input into one output image.
//!
//! Steps, each failing the job on error with nothing retried:
//!
//! 1. validate and decode the input image;
//! 2. resolve the workflow graph and locate its role nodes;
//! 3. resolve LoRA assets into the local cache;
//! 4. upload the image and patch a copy of the graph;
//! 5. open the push channel, submit, wait for completion;
//! 6. read history and download the output image.
//!
//! The push channel is opened before submission and closed on every path
//! once opened.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use comfyjob_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use comfyjob_comfyui::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use comfyjob_comfyui::history::HistoryError;
use comfyjob_comfyui::wait::{wait_for_completion, WaitError, WaitOptions};
use comfyjob_core::error::CoreError;
use comfyjob_core::job::{decode_image, encode_image, Job, JobInput, JobOutput};
use comfyjob_core::workflow::{NodeRoles, Patch, RoleLocator, Workflow};

use crate::config::{WorkerConfig, WorkflowSource};
use crate::lora::{AssetError, LoraCache};

/// Filename the input image is uploaded under.
pub const UPLOAD_FILENAME: &str = "input_image.png";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("No image provided in job input")]
    MissingImage,

    #[error("Invalid input image: {0}")]
    Image(String),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("ComfyUI request failed: {0}")]
    Backend(#[from] ComfyUIApiError),

    #[error("ComfyUI connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<WaitError> for JobError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut(d) => JobError::Timeout(d),
            WaitError::Cancelled => JobError::Cancelled,
            WaitError::ExecutionFailed { message, .. } => JobError::ExecutionFailed(message),
            e @ (WaitError::ConnectionClosed { .. } | WaitError::Receive(_)) => {
                JobError::Connection(e.to_string())
            }
        }
    }
}

impl From<ComfyUIClientError> for JobError {
    fn from(err: ComfyUIClientError) -> Self {
        match err {
            ComfyUIClientError::Connection(msg) => JobError::Connection(msg),
        }
    }
}

/// Read a job envelope from a JSON file (one-shot mode).
pub async fn read_job_file(path: &Path) -> Result<Job, JobError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| JobError::InvalidInput(format!("Cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| JobError::InvalidInput(format!("Malformed job file {}: {e}", path.display())))
}

fn workflow_err(err: CoreError) -> JobError {
    JobError::Workflow(err.to_string())
}

/// A graph ready to be patched, with its role nodes located.
#[derive(Debug)]
struct ResolvedWorkflow {
    graph: Workflow,
    roles: NodeRoles,
}

/// Runs jobs against one ComfyUI instance. Cheap to share behind an `Arc`;
/// jobs hold no state in common besides the LoRA directory.
#[derive(Debug)]
pub struct Orchestrator {
    config: Arc<WorkerConfig>,
    api: ComfyUIApi,
    ws: ComfyUIClient,
    loras: LoraCache,
    locator: RoleLocator,
}

impl Orchestrator {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        let http = reqwest::Client::new();
        let locator = match &config.workflow {
            WorkflowSource::Fixed { nodes, .. } => RoleLocator::Fixed(nodes.clone()),
            WorkflowSource::Inline { matcher } => RoleLocator::ByClass(matcher.clone()),
        };

        Self {
            api: ComfyUIApi::with_client(http.clone(), config.api_url()),
            ws: ComfyUIClient::new(config.ws_url()),
            loras: LoraCache::with_client(http, config.lora_dir.clone()),
            locator,
            config,
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run one job. Never fails: errors become [`JobOutput::Failure`].
    pub async fn handle(&self, job: &Job, cancel: &CancellationToken) -> JobOutput {
        let job_id = job.id.clone().unwrap_or_else(|| "-".to_string());
        let span = tracing::info_span!("job", job_id = %job_id);

        match self.run(&job.input, cancel).instrument(span).await {
            Ok(image_base64) => {
                tracing::info!(job_id = %job_id, "Job completed");
                JobOutput::Success { image_base64 }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job failed");
                JobOutput::Failure {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Run the pipeline, returning the base64 output image.
    pub async fn run(&self, raw: &Value, cancel: &CancellationToken) -> Result<String, JobError> {
        let input = JobInput::from_value(raw).map_err(|e| JobError::InvalidInput(e.to_string()))?;
        let image = input
            .image
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(JobError::MissingImage)?;
        let image_bytes = decode_image(image).map_err(|e| JobError::Image(e.to_string()))?;

        let resolved = self.resolve_workflow(&input).await?;
        tracing::debug!(roles = ?resolved.roles, nodes = resolved.graph.len(), "Workflow resolved");

        let (lora_background, lora_subject) = self.resolve_loras(&input).await?;
        let uploaded = self.upload_image(image_bytes).await?;

        let patched = resolved
            .graph
            .patched(
                &resolved.roles,
                &Patch {
                    image: uploaded,
                    lora_background,
                    lora_subject,
                },
            )
            .map_err(workflow_err)?;

        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let prompt_id = self.submit_and_wait(&patched, cancel).await?;
        self.fetch_result(&prompt_id, &resolved.roles.image_output).await
    }

    async fn resolve_workflow(&self, input: &JobInput) -> Result<ResolvedWorkflow, JobError> {
        let graph = match &self.config.workflow {
            WorkflowSource::Fixed { path, .. } => {
                if input.workflow.is_some() {
                    tracing::warn!("Ignoring inline workflow; worker runs a fixed workflow file");
                }
                let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                    JobError::Workflow(format!("Cannot read {}: {e}", path.display()))
                })?;
                Workflow::from_json_str(&text).map_err(workflow_err)?
            }
            WorkflowSource::Inline { .. } => {
                let value = input.workflow.clone().ok_or_else(|| {
                    JobError::Workflow("No workflow provided in job input".to_string())
                })?;
                Workflow::from_value(value).map_err(workflow_err)?
            }
        };

        let roles = self.locator.locate(&graph).map_err(workflow_err)?;
        Ok(ResolvedWorkflow { graph, roles })
    }

    /// Filenames to write into the LoRA loader nodes, if the workflow has
    /// any. Inline workflows carry their own LoRA names, so requested URLs
    /// are only fetched into the cache.
    async fn resolve_loras(
        &self,
        input: &JobInput,
    ) -> Result<(Option<String>, Option<String>), JobError> {
        match &self.config.workflow {
            WorkflowSource::Fixed {
                default_lora_background,
                default_lora_subject,
                ..
            } => {
                let background = self
                    .loras
                    .resolve(input.lora_bg_url.as_deref(), default_lora_background)
                    .await?;
                let subject = self
                    .loras
                    .resolve(input.lora_car_url.as_deref(), default_lora_subject)
                    .await?;
                tracing::info!(background = %background, subject = %subject, "LoRAs resolved");
                Ok((Some(background), Some(subject)))
            }
            WorkflowSource::Inline { .. } => {
                for url in [&input.lora_bg_url, &input.lora_car_url].into_iter().flatten() {
                    self.loras.resolve(Some(url.as_str()), "").await?;
                }
                Ok((None, None))
            }
        }
    }

    async fn upload_image(&self, bytes: Vec<u8>) -> Result<String, JobError> {
        let size = bytes.len();
        let uploaded = self.api.upload_image(bytes, UPLOAD_FILENAME).await?;
        tracing::info!(filename = %uploaded.name, bytes = size, "Input image uploaded");
        Ok(uploaded.name)
    }

    /// Submit under a fresh correlation id and wait for completion.
    /// Returns the backend-assigned prompt id.
    async fn submit_and_wait(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.ws.connect(&client_id).await?;

        let result = self.submit_on(&mut conn, workflow, cancel).await;
        conn.close().await;
        result
    }

    async fn submit_on(
        &self,
        conn: &mut ComfyUIConnection,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        let graph = workflow.to_value().map_err(workflow_err)?;
        let submitted = self.api.submit_workflow(&graph, &conn.client_id).await?;
        tracing::info!(
            client_id = %conn.client_id,
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            "Workflow queued",
        );

        let options = WaitOptions {
            timeout: self.config.execution_timeout,
        };
        wait_for_completion(&mut conn.ws_stream, &submitted.prompt_id, options, cancel).await?;
        Ok(submitted.prompt_id)
    }

    async fn fetch_result(&self, prompt_id: &str, output_node: &str) -> Result<String, JobError> {
        let history = self.api.get_history(prompt_id).await?;
        let image = history.first_image(prompt_id, output_node)?;
        tracing::debug!(prompt_id, filename = %image.filename, subfolder = %image.subfolder, "Fetching output image");

        let bytes = self.api.view(image).await?;
        tracing::info!(prompt_id, bytes = bytes.len(), "Output image retrieved");
        Ok(encode_image(&bytes))
    }
}
