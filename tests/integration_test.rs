/// Integration tests against a local stand-in inference service

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use serde_json::{json, Value};
use smartbin_detector::{
    CaptureBundle, DetectionEngine, EncodedImage, EngineConfig, EngineEvent, EngineState,
    FeedBackend, HttpInferenceClient, InferenceClient, InferenceError, ModalityOutcome,
    TriggerKind, encode_wav,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct ReceivedPart {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    head: Vec<u8>,
}

struct StubService {
    status: StatusCode,
    body: Value,
    /// Served from the second request on, when set
    followup: Option<Value>,
    requests: Mutex<Vec<Vec<ReceivedPart>>>,
}

async fn predict(
    State(service): State<Arc<StubService>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut parts = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.unwrap_or_default();
        parts.push(ReceivedPart {
            name,
            file_name,
            content_type,
            head: data.iter().take(4).copied().collect(),
        });
    }
    let mut requests = service.requests.lock();
    requests.push(parts);
    let body = match &service.followup {
        Some(followup) if requests.len() > 1 => followup.clone(),
        _ => service.body.clone(),
    };
    (service.status, Json(body))
}

async fn spawn_service(status: StatusCode, body: Value) -> (Arc<StubService>, SocketAddr) {
    spawn_service_with_followup(status, body, None).await
}

async fn spawn_service_with_followup(
    status: StatusCode,
    body: Value,
    followup: Option<Value>,
) -> (Arc<StubService>, SocketAddr) {
    let service = Arc::new(StubService {
        status,
        body,
        followup,
        requests: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/api/predict/multimodal", post(predict))
        .with_state(service.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (service, addr)
}

fn config_for(addr: SocketAddr) -> EngineConfig {
    EngineConfig {
        api_base_url: format!("http://{}", addr),
        request_timeout_secs: 5,
        ..Default::default()
    }
}

fn client_for(addr: SocketAddr) -> HttpInferenceClient {
    HttpInferenceClient::from_config(&config_for(addr)).unwrap()
}

fn sample_bundle(with_audio: bool) -> CaptureBundle {
    CaptureBundle {
        kind: if with_audio {
            TriggerKind::AudioVisual
        } else {
            TriggerKind::VisualOnly
        },
        image: Some(EncodedImage {
            data: vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00],
            width: 1,
            height: 1,
        }),
        audio: with_audio.then(|| encode_wav(&[0.1; 256], 16000).unwrap()),
    }
}

fn backend_with_frame() -> Arc<FeedBackend> {
    let backend = Arc::new(FeedBackend::new(16000));
    backend
        .video()
        .push_frame(RgbImage::from_pixel(1280, 720, Rgb([20, 160, 60])));
    backend
}

async fn wait_for_state(engine: &DetectionEngine, state: EngineState, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if engine.snapshot().await.state == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Drain events until `matches` accepts one, giving up after `within`
async fn wait_for_event(
    engine: &DetectionEngine,
    within: Duration,
    matches: impl Fn(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let event = tokio::time::timeout_at(deadline, engine.recv_event())
            .await
            .ok()??;
        if matches(&event) {
            return Some(event);
        }
    }
}

#[tokio::test]
async fn test_multipart_parts_and_parsing() {
    let (service, addr) = spawn_service(
        StatusCode::OK,
        json!({
            "visual": {"label": "plastic_bottle", "confidence": 0.82},
            "audio": {"label": "plastic_crunch", "confidence": 0.64},
            "confidence_score": 0.76,
            "annotated_image": "data:image/png;base64,AAAA"
        }),
    )
    .await;

    let prediction = client_for(addr).submit(&sample_bundle(true)).await.unwrap();
    assert_eq!(prediction.visual.label().unwrap().label, "plastic_bottle");
    assert_eq!(prediction.audio.label().unwrap().label, "plastic_crunch");
    assert!((prediction.confidence - 0.76).abs() < 1e-6);
    assert_eq!(
        prediction.annotated_image.as_deref(),
        Some("data:image/png;base64,AAAA")
    );

    let requests = service.requests.lock();
    let parts = &requests[0];
    assert_eq!(parts.len(), 2);

    let image = parts.iter().find(|p| p.name == "image").unwrap();
    assert_eq!(image.file_name.as_deref(), Some("frame.jpg"));
    assert_eq!(image.content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(&image.head[..2], &[0xFF, 0xD8]);

    let audio = parts.iter().find(|p| p.name == "audio").unwrap();
    assert_eq!(audio.file_name.as_deref(), Some("sample.wav"));
    assert_eq!(audio.content_type.as_deref(), Some("audio/wav"));
    assert_eq!(&audio.head[..], b"RIFF");
}

#[tokio::test]
async fn test_visual_only_request_has_no_audio_part() {
    let (service, addr) = spawn_service(StatusCode::OK, json!({"confidence_score": 0.0})).await;

    let prediction = client_for(addr).submit(&sample_bundle(false)).await.unwrap();
    assert_eq!(prediction.visual, ModalityOutcome::NotDetected);

    let requests = service.requests.lock();
    let names: Vec<_> = requests[0].iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["image"]);
}

#[tokio::test]
async fn test_server_error_status() {
    let (_service, addr) =
        spawn_service(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"})).await;

    let result = client_for(addr).submit(&sample_bundle(false)).await;
    assert_eq!(result, Err(InferenceError::ServerError(500)));
}

#[tokio::test]
async fn test_top_level_error_field() {
    let (_service, addr) = spawn_service(StatusCode::OK, json!({"error": "model not loaded"})).await;

    let result = client_for(addr).submit(&sample_bundle(false)).await;
    assert_eq!(
        result,
        Err(InferenceError::PayloadError("model not loaded".to_string()))
    );
}

#[tokio::test]
async fn test_modality_error_is_surfaced() {
    let (_service, addr) = spawn_service(
        StatusCode::OK,
        json!({
            "visual": {"label": "can", "confidence": 0.5},
            "confidence_score": 0.5,
            "errors": {"audio": "audio model unavailable"}
        }),
    )
    .await;

    let prediction = client_for(addr).submit(&sample_bundle(true)).await.unwrap();
    assert!(prediction.visual.label().is_some());
    assert_eq!(
        prediction.audio,
        ModalityOutcome::Failed("audio model unavailable".to_string())
    );
}

#[tokio::test]
async fn test_unreachable_service_is_network_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = client_for(addr).submit(&sample_bundle(false)).await;
    assert!(matches!(result, Err(InferenceError::Network(_))));
}

#[tokio::test]
async fn test_engine_visual_poll_then_confirm() {
    let (service, addr) = spawn_service(
        StatusCode::OK,
        json!({
            "visual": {"label": "cardboard", "confidence": 0.45},
            "confidence_score": 0.45
        }),
    )
    .await;

    let engine = DetectionEngine::with_http_client(config_for(addr), backend_with_frame()).unwrap();
    engine.start().await.unwrap();

    assert!(wait_for_state(&engine, EngineState::WaitingForFeedback, Duration::from_secs(5)).await);

    let snap = engine.snapshot().await;
    assert_eq!(snap.visual_feed, "cardboard (45%)");
    assert_eq!(snap.audio_feed, "Listening...");
    assert_eq!(snap.toast.as_deref(), Some("Low confidence. Please verify."));
    // No annotation from the server: the captured frame is shown instead
    assert!(snap
        .annotated_image
        .as_deref()
        .unwrap()
        .starts_with("data:image/jpeg;base64,"));

    {
        let requests = service.requests.lock();
        assert_eq!(requests.len(), 1);
        let names: Vec<_> = requests[0].iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["image"]);
    }

    let confirmed = engine.confirm().await.unwrap();
    assert_eq!(confirmed.trigger, TriggerKind::VisualOnly);
    assert_eq!(engine.snapshot().await.state, EngineState::Monitoring);

    let mut saw_confirmed = false;
    while let Some(event) = engine.try_recv_event().await {
        if matches!(event, EngineEvent::Confirmed { .. }) {
            saw_confirmed = true;
        }
    }
    assert!(saw_confirmed);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_engine_audio_trigger_auto_saves() {
    let (service, addr) = spawn_service_with_followup(
        StatusCode::OK,
        json!({
            "visual": {"label": "glass_bottle", "confidence": 0.91},
            "audio": {"label": "glass_clink", "confidence": 0.88},
            "confidence_score": 0.9
        }),
        Some(json!({"confidence_score": 0.0})),
    )
    .await;

    let backend = backend_with_frame();
    let engine = DetectionEngine::with_http_client(config_for(addr), backend.clone()).unwrap();
    engine.start().await.unwrap();
    backend.audio().push_buffer(&[0.6; 4096]);

    assert!(wait_for_state(&engine, EngineState::AutoSaving, Duration::from_secs(5)).await);
    let snap = engine.snapshot().await;
    assert_eq!(snap.audio_feed, "glass_clink (88%)");
    assert_eq!(snap.audio_summary, "glass_clink (88%)");

    {
        let requests = service.requests.lock();
        let mut names: Vec<_> = requests[0].iter().map(|p| p.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["audio", "image"]);
    }

    // A visual poll can fire on the first tick after the save, so MONITORING
    // may be too short to observe by polling snapshots
    let saved = wait_for_event(&engine, Duration::from_secs(4), |event| {
        matches!(event, EngineEvent::AutoSaved { .. })
    })
    .await;
    let Some(EngineEvent::AutoSaved { result }) = saved else {
        panic!("no auto-save event");
    };
    assert_eq!(result.trigger, TriggerKind::AudioVisual);
    assert_eq!(result.audio.unwrap().label, "glass_clink");

    let left = wait_for_event(&engine, Duration::from_secs(1), |event| {
        matches!(event, EngineEvent::StateChanged { .. })
    })
    .await;
    assert_eq!(
        left,
        Some(EngineEvent::StateChanged {
            from: EngineState::AutoSaving,
            to: EngineState::Monitoring,
        })
    );

    // Later cycles find nothing, which leaves the toast alone
    let snap = engine.snapshot().await;
    assert_ne!(snap.state, EngineState::AutoSaving);
    assert_eq!(snap.toast.as_deref(), Some("Data saved automatically!"));
    assert_eq!(engine.stats().await.auto_saves, 1);

    engine.stop().await.unwrap();
}
