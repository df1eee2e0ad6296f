use std::path::PathBuf;
use std::time::Duration;

use comfyjob_comfyui::readiness::ReadinessConfig;
use comfyjob_comfyui::wait::DEFAULT_EXECUTION_TIMEOUT;
use comfyjob_core::workflow::{
    ClassMatcher, FixedNodes, MatchPolicy, DEFAULT_INPUT_CLASSES, DEFAULT_OUTPUT_CLASS,
};

/// Where a job's workflow graph comes from and how its roles are found.
#[derive(Debug, Clone)]
pub enum WorkflowSource {
    /// Graph read from a local file; roles at pre-agreed node ids.
    Fixed {
        path: PathBuf,
        nodes: FixedNodes,
        default_lora_background: String,
        default_lora_subject: String,
    },
    /// Graph supplied in each job; roles found by node class type.
    Inline { matcher: ClassMatcher },
}

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults matching the stock deployment image. Values
/// are immutable once loaded and shared with every job.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// ComfyUI `host:port` used for both HTTP and WebSocket.
    pub comfy_host: String,
    /// Directory LoRA files are downloaded into.
    pub lora_dir: PathBuf,
    pub workflow: WorkflowSource,
    pub readiness: ReadinessConfig,
    /// Upper bound on the completion wait of a single job.
    pub execution_timeout: Duration,
    /// Bind address of the job endpoint.
    pub host: String,
    pub port: u16,
    /// Run this one job from a JSON file instead of serving.
    pub job_input_file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                  | Default                                   |
    /// |--------------------------|-------------------------------------------|
    /// | `COMFY_HOST`             | `127.0.0.1:8188`                          |
    /// | `LORA_DIR`               | `/ComfyUI/models/loras`                   |
    /// | `WORKFLOW_MODE`          | `fixed` (`fixed` or `inline`)             |
    /// | `WORKFLOW_FILE`          | `workflow.json`                           |
    /// | `LOAD_IMAGE_NODE_ID`     | `142`                                     |
    /// | `SAVE_IMAGE_NODE_ID`     | `136`                                     |
    /// | `LORA_BG_NODE_ID`        | `239`                                     |
    /// | `LORA_CAR_NODE_ID`       | `190`                                     |
    /// | `DEFAULT_LORA_BG_NAME`   | `MAG_14785.safetensors`                   |
    /// | `DEFAULT_LORA_CAR_NAME`  | `AUDI_E_TRON_GT2025.safetensors`          |
    /// | `INPUT_NODE_TYPES`       | `LoadImage,LoadImageMask,LoadImageOutput` |
    /// | `OUTPUT_NODE_TYPE`       | `SaveImage`                               |
    /// | `NODE_MATCH_POLICY`      | `unique` (`unique` or `last`)             |
    /// | `READINESS_MAX_ATTEMPTS` | `500`                                     |
    /// | `READINESS_INTERVAL_MS`  | `50`                                      |
    /// | `EXECUTION_TIMEOUT_SECS` | `600`                                     |
    /// | `HOST`                   | `0.0.0.0`                                 |
    /// | `PORT`                   | `8000`                                    |
    /// | `JOB_INPUT_FILE`         | unset                                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let mode = get("WORKFLOW_MODE", "fixed").to_ascii_lowercase();
        let workflow = match mode.as_str() {
            "fixed" => WorkflowSource::Fixed {
                path: PathBuf::from(get("WORKFLOW_FILE", "workflow.json")),
                nodes: FixedNodes {
                    image_input: get("LOAD_IMAGE_NODE_ID", "142"),
                    image_output: get("SAVE_IMAGE_NODE_ID", "136"),
                    lora_background: Some(get("LORA_BG_NODE_ID", "239")),
                    lora_subject: Some(get("LORA_CAR_NODE_ID", "190")),
                },
                default_lora_background: get("DEFAULT_LORA_BG_NAME", "MAG_14785.safetensors"),
                default_lora_subject: get(
                    "DEFAULT_LORA_CAR_NAME",
                    "AUDI_E_TRON_GT2025.safetensors",
                ),
            },
            "inline" => {
                let policy_raw = get("NODE_MATCH_POLICY", "unique");
                let policy: MatchPolicy =
                    policy_raw.parse().map_err(|e: comfyjob_core::error::CoreError| {
                        ConfigError::Invalid {
                            var: "NODE_MATCH_POLICY",
                            value: policy_raw.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                let input_classes: Vec<String> = get(
                    "INPUT_NODE_TYPES",
                    &DEFAULT_INPUT_CLASSES.join(","),
                )
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();

                WorkflowSource::Inline {
                    matcher: ClassMatcher {
                        input_classes,
                        output_class: get("OUTPUT_NODE_TYPE", DEFAULT_OUTPUT_CLASS),
                        policy,
                    },
                }
            }
            other => {
                return Err(ConfigError::Invalid {
                    var: "WORKFLOW_MODE",
                    value: other.to_string(),
                    reason: "expected 'fixed' or 'inline'".to_string(),
                })
            }
        };

        let readiness = ReadinessConfig {
            max_attempts: parse(&get, "READINESS_MAX_ATTEMPTS", "500")?,
            interval: Duration::from_millis(parse(&get, "READINESS_INTERVAL_MS", "50")?),
        };

        let default_timeout = DEFAULT_EXECUTION_TIMEOUT.as_secs().to_string();
        let execution_timeout =
            Duration::from_secs(parse(&get, "EXECUTION_TIMEOUT_SECS", &default_timeout)?);

        Ok(Self {
            comfy_host: get("COMFY_HOST", "127.0.0.1:8188"),
            lora_dir: PathBuf::from(get("LORA_DIR", "/ComfyUI/models/loras")),
            workflow,
            readiness,
            execution_timeout,
            host: get("HOST", "0.0.0.0"),
            port: parse(&get, "PORT", "8000")?,
            job_input_file: lookup("JOB_INPUT_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }

    /// HTTP base URL of the ComfyUI instance.
    pub fn api_url(&self) -> String {
        format!("http://{}", self.comfy_host)
    }

    /// WebSocket base URL of the ComfyUI instance.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.comfy_host)
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str, &str) -> String,
{
    let value = get(var, default);
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.clone(),
        reason: e.to_string(),
    })
}
