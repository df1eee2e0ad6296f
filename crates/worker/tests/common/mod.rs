//! In-process stand-in for a ComfyUI server.
//!
//! Serves the HTTP and WebSocket endpoints a job touches, records what it
//! receives, and pushes execution events to the submitting client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use comfyjob_comfyui::readiness::ReadinessConfig;
use comfyjob_core::workflow::{ClassMatcher, FixedNodes};
use comfyjob_worker::config::{WorkerConfig, WorkflowSource};

/// 1x1 transparent PNG.
pub const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Name the fake server stores every upload under.
pub const STORED_NAME: &str = "stored_input.png";

/// Bytes served from `/view` for the produced image.
pub const OUTPUT_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-output-image";

#[derive(Debug, Clone)]
pub struct Behaviour {
    /// Push the completion event after a submission.
    pub complete: bool,
    /// Push an `execution_error` for the prompt instead of completing.
    pub fail_execution: bool,
    /// Node whose images the history record lists; `None` for no outputs.
    pub output_node: Option<String>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            complete: true,
            fail_execution: false,
            output_node: Some("2".to_string()),
        }
    }
}

pub struct FakeState {
    behaviour: Behaviour,
    events: broadcast::Sender<(String, String)>,
    pub requests: AtomicUsize,
    /// Close frames received from WebSocket clients.
    pub closes: AtomicUsize,
    pub uploads: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<Value>>,
    pub views: Mutex<Vec<HashMap<String, String>>>,
}

impl FakeState {
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Wait until `expected` close frames have arrived, then return the
    /// final count. The close is observed after the client has moved on.
    pub async fn wait_for_closes(&self, expected: usize) -> usize {
        for _ in 0..100 {
            if self.close_count() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give a duplicate close the chance to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.close_count()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Graph of the most recent submission.
    pub fn last_prompt(&self) -> Option<Value> {
        self.prompts.lock().unwrap().last().map(|body| body["prompt"].clone())
    }
}

pub struct FakeComfy {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeComfy {
    pub async fn start(behaviour: Behaviour) -> Self {
        let (events, _) = broadcast::channel(16);
        let state = Arc::new(FakeState {
            behaviour,
            events,
            requests: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            views: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/", get(root))
            .route("/upload/image", post(upload))
            .route("/prompt", post(prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }
}

fn count(state: &FakeState) {
    state.requests.fetch_add(1, Ordering::SeqCst);
}

async fn root(State(state): State<Arc<FakeState>>) -> &'static str {
    count(&state);
    "ok"
}

async fn upload(State(state): State<Arc<FakeState>>, mut multipart: Multipart) -> Json<Value> {
    count(&state);
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.unwrap();
            assert!(!bytes.is_empty(), "uploaded image is empty");
            fields.insert(name, file_name);
        } else {
            fields.insert(name, field.text().await.unwrap());
        }
    }
    assert_eq!(fields.get("overwrite").map(String::as_str), Some("true"));
    assert_eq!(fields.get("type").map(String::as_str), Some("input"));

    state
        .uploads
        .lock()
        .unwrap()
        .push(fields.remove("image").unwrap_or_default());
    Json(json!({"name": STORED_NAME, "subfolder": "", "type": "input"}))
}

async fn prompt(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Json<Value> {
    count(&state);
    let client_id = body["client_id"].as_str().unwrap_or_default().to_string();
    let number = {
        let mut prompts = state.prompts.lock().unwrap();
        prompts.push(body);
        prompts.len()
    };
    let prompt_id = format!("prompt-{number}");

    let _ = state.events.send((client_id, prompt_id.clone()));
    Json(json!({"prompt_id": prompt_id, "number": number, "node_errors": {}}))
}

async fn history(
    State(state): State<Arc<FakeState>>,
    UrlPath(prompt_id): UrlPath<String>,
) -> Json<Value> {
    count(&state);
    let outputs = match &state.behaviour.output_node {
        Some(node) => json!({
            node.as_str(): {"images": [{"filename": "result_00001_.png", "subfolder": "", "type": "output"}]}
        }),
        None => json!({}),
    };
    Json(json!({ prompt_id: {"outputs": outputs, "status": {"completed": true}} }))
}

async fn view(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Vec<u8> {
    count(&state);
    state.views.lock().unwrap().push(query);
    OUTPUT_BYTES.to_vec()
}

async fn ws(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    count(&state);
    let client_id = query.get("clientId").cloned().unwrap_or_default();
    // Subscribe before the handshake completes so a submission made right
    // after connecting is never missed.
    let events = state.events.subscribe();
    upgrade.on_upgrade(move |socket| push_events(socket, client_id, events, state))
}

async fn push_events(
    mut socket: WebSocket,
    client_id: String,
    mut events: broadcast::Receiver<(String, String)>,
    state: Arc<FakeState>,
) {
    let behaviour = &state.behaviour;
    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}, "sid": client_id}});
    if send(&mut socket, status).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) => {
                    state.closes.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            },
            event = events.recv() => {
                let Ok((target, prompt_id)) = event else { return };
                if target != client_id {
                    continue;
                }
                if run_prompt(&mut socket, &prompt_id, behaviour).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run_prompt(
    socket: &mut WebSocket,
    prompt_id: &str,
    behaviour: &Behaviour,
) -> Result<(), axum::Error> {
    send(socket, json!({"type": "execution_start", "data": {"prompt_id": prompt_id}})).await?;
    send(socket, json!({"type": "executing", "data": {"node": "1", "prompt_id": prompt_id}})).await?;
    send(socket, json!({"type": "progress", "data": {"value": 1, "max": 2, "prompt_id": prompt_id}})).await?;
    socket.send(Message::Binary(vec![1u8, 2, 3].into())).await?;
    // Completion of an unrelated prompt must not end the job's wait.
    send(socket, json!({"type": "executing", "data": {"node": null, "prompt_id": "someone-else"}})).await?;

    if behaviour.fail_execution {
        send(
            socket,
            json!({"type": "execution_error", "data": {
                "prompt_id": prompt_id,
                "node_id": "2",
                "node_type": "SaveImage",
                "exception_type": "RuntimeError",
                "exception_message": "disk full"
            }}),
        )
        .await?;
    } else if behaviour.complete {
        send(socket, json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}})).await?;
    }
    Ok(())
}

async fn send(socket: &mut WebSocket, value: Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}

// ---------------------------------------------------------------------------
// Worker configuration helpers
// ---------------------------------------------------------------------------

fn base_config(comfy_host: String, lora_dir: &Path, workflow: WorkflowSource) -> WorkerConfig {
    WorkerConfig {
        comfy_host,
        lora_dir: lora_dir.to_path_buf(),
        workflow,
        readiness: ReadinessConfig {
            max_attempts: 5,
            interval: Duration::from_millis(10),
        },
        execution_timeout: Duration::from_millis(500),
        host: "127.0.0.1".to_string(),
        port: 0,
        job_input_file: None,
    }
}

/// Config for jobs that carry their own workflow.
pub fn inline_config(comfy_host: String, lora_dir: &Path) -> WorkerConfig {
    base_config(
        comfy_host,
        lora_dir,
        WorkflowSource::Inline {
            matcher: ClassMatcher::default(),
        },
    )
}

/// Config for a workflow file with the stock fixed node ids.
pub fn fixed_config(comfy_host: String, lora_dir: &Path, workflow_file: &Path) -> WorkerConfig {
    base_config(
        comfy_host,
        lora_dir,
        WorkflowSource::Fixed {
            path: workflow_file.to_path_buf(),
            nodes: FixedNodes {
                image_input: "142".to_string(),
                image_output: "136".to_string(),
                lora_background: Some("239".to_string()),
                lora_subject: Some("190".to_string()),
            },
            default_lora_background: "MAG_14785.safetensors".to_string(),
            default_lora_subject: "AUDI_E_TRON_GT2025.safetensors".to_string(),
        },
    )
}

/// Two-node graph: load an image, save it.
pub fn minimal_workflow() -> Value {
    json!({
        "1": {"class_type": "LoadImage", "inputs": {}},
        "2": {"class_type": "SaveImage", "inputs": {"images": ["1", 0]}}
    })
}
