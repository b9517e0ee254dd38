// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared harness for the end-to-end scenario suite: a fully-wired stack
//! (engine, stores, registry, balancer, approvals) against wiremock render
//! backends.
#![allow(dead_code)]

use rp_approval::ApprovalService;
use rp_backend::balancer::{BackendEntry, LoadBalancer};
use rp_backend::TrackerConfig;
use rp_db::MetadataStore;
use rp_engine::{Engine, HistoryStore};
use rp_orchestrator::Services;
use rp_registry::TemplateRegistry;
use rp_store::ArtifactStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// A fully-wired orchestrator stack.
pub struct Harness {
    pub db: MetadataStore,
    pub store: ArtifactStore,
    pub registry: Arc<TemplateRegistry>,
    pub engine: Engine,
    pub approvals: Arc<ApprovalService>,
    _tmp: tempfile::TempDir,
}

/// Template with a terminal SaveImage node; `3.text` and `5.seed` are the
/// interesting overrides.
pub fn tiny_image_template() -> Value {
    json!({
        "3": {
            "class_type": "CLIPTextEncode",
            "_meta": {"title": "Positive Prompt"},
            "inputs": {"text": "a lighthouse", "clip": ["4", 0]}
        },
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd.safetensors"}},
        "5": {
            "class_type": "KSampler",
            "inputs": {"seed": 1, "steps": 10, "model": ["4", 0], "positive": ["3", 0]}
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": {"filename_prefix": "render", "images": ["5", 0]}
        }
    })
}

/// Template with a terminal SaveVideo node.
pub fn video_template() -> Value {
    json!({
        "3": {
            "class_type": "CLIPTextEncode",
            "_meta": {"title": "Motion Prompt"},
            "inputs": {"text": "waves", "clip": ["4", 0]}
        },
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "vid.safetensors"}},
        "12": {
            "class_type": "LoadImage",
            "inputs": {"image": "input.png"}
        },
        "9": {
            "class_type": "SaveVideo",
            "inputs": {"filename_prefix": "clip", "format": "mp4", "video": ["3", 0]}
        }
    })
}

/// Build the stack over the given backends, templates, and history store.
pub async fn harness(
    backends: Vec<&MockServer>,
    templates: &[(&str, Value)],
    history: Arc<dyn HistoryStore>,
) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let templates_dir = tmp.path().join("templates");
    std::fs::create_dir_all(&templates_dir).expect("templates dir");
    for (name, template) in templates {
        std::fs::write(
            templates_dir.join(format!("{name}.json")),
            serde_json::to_string_pretty(template).expect("template json"),
        )
        .expect("write template");
    }

    let db = MetadataStore::open_in_memory().await.expect("db");
    let store = ArtifactStore::open(tmp.path().join("artifacts"))
        .await
        .expect("artifact store");
    let (registry, summary) = TemplateRegistry::discover(&templates_dir)
        .await
        .expect("discovery");
    assert!(summary.errors.is_empty(), "template errors: {:?}", summary.errors);
    let registry = Arc::new(registry);

    let entries: Vec<BackendEntry> = backends
        .iter()
        .enumerate()
        .map(|(i, server)| BackendEntry {
            name: format!("gpu-{i}"),
            address: server.uri(),
            description: String::new(),
        })
        .collect();
    let balancer = Arc::new(LoadBalancer::new(entries));

    let engine = Engine::new(history);
    let approvals = Arc::new(ApprovalService::new(
        db.clone(),
        registry.clone(),
        engine.clone(),
    ));
    rp_orchestrator::register_all(
        &engine,
        Arc::new(Services {
            db: db.clone(),
            store: store.clone(),
            registry: registry.clone(),
            balancer,
            approvals: approvals.clone(),
            view_url_base: "http://localhost:8080".to_string(),
            link_ttl_hours: 168,
            tracker: TrackerConfig {
                poll_interval: Duration::from_millis(25),
                timeout: Duration::from_secs(5),
            },
        }),
    );

    Harness {
        db,
        store,
        registry,
        engine,
        approvals,
        _tmp: tmp,
    }
}

struct CountingPrompts(AtomicUsize);

impl Respond for CountingPrompts {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200)
            .set_body_json(json!({ "prompt_id": format!("p-{n}"), "number": n }))
    }
}

/// A render backend double: sequential prompt ids (`p-1`, `p-2`, ...),
/// empty queue, byte downloads, upload acks. History responses are mounted
/// per prompt by the tests. No `/ws` endpoint exists, so the tracker's
/// websocket attach fails and polling carries every outcome.
pub async fn mock_backend() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(CountingPrompts(AtomicUsize::new(0)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queue_running": [], "queue_pending": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/view"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RENDERED-BYTES".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/image"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "uploaded", "subfolder": "", "type": "input"
        })))
        .mount(&server)
        .await;
    // Prompts without a mounted history entry are simply not finished yet.
    Mock::given(method("GET"))
        .and(path_regex(r"^/history/.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .with_priority(99)
        .mount(&server)
        .await;
    server
}

/// Mount a successful history record for one prompt producing one image.
pub async fn mount_image_success(server: &MockServer, prompt_id: &str, filename: &str) {
    mount_history(
        server,
        prompt_id,
        json!({
            "outputs": {"9": {"images": [{"filename": filename, "subfolder": "", "type": "output"}]}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }),
    )
    .await;
}

/// Mount a successful history record for one prompt producing one video.
pub async fn mount_video_success(server: &MockServer, prompt_id: &str, filename: &str) {
    mount_history(
        server,
        prompt_id,
        json!({
            "outputs": {"9": {"videos": [{"filename": filename, "subfolder": "", "type": "output"}]}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }),
    )
    .await;
}

/// Mount a failed history record.
pub async fn mount_error(server: &MockServer, prompt_id: &str, message: &str) {
    mount_history(
        server,
        prompt_id,
        json!({
            "outputs": {},
            "status": {"status_str": "error", "completed": false,
                       "messages": [["execution_error", message]]}
        }),
    )
    .await;
}

async fn mount_history(server: &MockServer, prompt_id: &str, entry: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/history/{prompt_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ prompt_id: entry })))
        .mount(server)
        .await;
}

/// Poll until `check` returns `Some`, or panic after `deadline`.
pub async fn wait_for<T, F, Fut>(deadline: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let start = tokio::time::Instant::now();
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if start.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
