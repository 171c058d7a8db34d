use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use pigment_core::{
    codec,
    image::{DynamicImage, Rgb, RgbImage},
    ModelContext, ModelError, ModelOutput, ModelVariant, Payload, Pipeline,
};
use pigment_server::{handlers::HealthResponse, response::ErrorResponse, router, MAX_REQUEST_BYTES};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Paints a solid image whose colour comes from the request seed.
struct Painter {
    calls: Arc<AtomicUsize>,
    fails: bool,
}

impl Pipeline for Painter {
    fn name(&self) -> &'static str {
        "painter"
    }

    fn run(&mut self, payload: Payload) -> Result<ModelOutput, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(anyhow::anyhow!("CUDA out of memory").into());
        }
        let (width, height, seed) = match payload {
            Payload::TextToImage(p) => (p.width, p.height, p.generator.map(|g| g.seed())),
            Payload::ImageToImage(p) => (
                p.image.width() as usize,
                p.image.height() as usize,
                p.generator.map(|g| g.seed()),
            ),
            Payload::Captioning(_) => return Ok(ModelOutput::Text("a red square".to_string())),
        };
        let shade = seed.unwrap_or(0).to_le_bytes()[0];
        let image = RgbImage::from_pixel(width as u32, height as u32, Rgb([shade, 0, 255 - shade]));
        Ok(ModelOutput::Images(vec![DynamicImage::ImageRgb8(image)]))
    }
}

async fn ready_app(variant: ModelVariant, fails: bool) -> (Router, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = Painter {
        calls: calls.clone(),
        fails,
    };
    let mut ctx = ModelContext::new("org/test-model", "cpu");
    ctx.load(variant, |_| async move {
        Ok::<Box<dyn Pipeline>, anyhow::Error>(Box::new(pipeline))
    })
    .await
    .unwrap();
    (router(Arc::new(ctx)), calls)
}

async fn failed_app() -> Router {
    let mut ctx = ModelContext::new("org/missing-model", "cpu");
    ctx.load(ModelVariant::TextToImage, |_| async {
        Err::<Box<dyn Pipeline>, _>(anyhow::anyhow!("repository not found"))
    })
    .await
    .unwrap();
    router(Arc::new(ctx))
}

async fn post_generate(app: Router, body: Value) -> (StatusCode, Value) {
    post_raw(app, body.to_string()).await
}

async fn post_raw(app: Router, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/generate")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn get_health(app: Router) -> HealthResponse {
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn detail(body: Value) -> String {
    serde_json::from_value::<ErrorResponse>(body).unwrap().detail
}

fn png_b64(width: u32, height: u32) -> String {
    let image = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
    codec::encode(&DynamicImage::ImageRgb8(image)).unwrap()
}

#[tokio::test]
async fn health_reports_ready_model() {
    let (app, _) = ready_app(ModelVariant::TextToImage, false).await;
    let health = get_health(app).await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.device, "cpu");
    assert_eq!(health.model_id, "org/test-model");
    assert_eq!(health.model_type, Some(ModelVariant::TextToImage));
    assert_eq!(health.state, "ready");
    assert_eq!(health.error, None);
}

#[tokio::test]
async fn health_reports_failed_load() {
    let health = get_health(failed_app().await).await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.state, "failed");
    assert!(health.error.unwrap().contains("repository not found"));
}

#[tokio::test]
async fn health_reports_uninitialized_context() {
    let app = router(Arc::new(ModelContext::new("org/test-model", "cpu")));
    let health = get_health(app).await;
    assert_eq!(health.state, "uninitialized");
    assert_eq!(health.model_type, None);
}

#[tokio::test]
async fn text_to_image_returns_png_at_requested_size() {
    let (app, calls) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, body) = post_generate(
        app,
        json!({"prompt": "a lighthouse", "height": 16, "width": 24, "seed": 3}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let image = codec::decode(body["image"].as_str().unwrap()).unwrap();
    assert_eq!((image.width(), image.height()), (24, 16));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn text_to_image_ignores_init_image() {
    let (app, _) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, _) = post_generate(
        app,
        json!({"prompt": "a lighthouse", "height": 16, "width": 16, "init_image_b64": "not base64!"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn image_to_image_without_init_image_is_rejected() {
    let (app, calls) = ready_app(ModelVariant::ImageToImage, false).await;
    let (status, body) = post_generate(app, json!({"prompt": "make it blue"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!detail(body).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn image_to_image_with_bad_base64_is_rejected() {
    let (app, calls) = ready_app(ModelVariant::ImageToImage, false).await;
    let (status, body) = post_generate(
        app,
        json!({"prompt": "make it blue", "init_image_b64": "%%%not-an-image%%%"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(detail(body), "Invalid base64 image format.");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn image_to_image_keeps_init_resolution() {
    let (app, _) = ready_app(ModelVariant::ImageToImage, false).await;
    let (status, body) = post_generate(
        app,
        json!({"prompt": "make it blue", "init_image": png_b64(40, 32), "height": 512, "width": 512}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let image = codec::decode(body["image"].as_str().unwrap()).unwrap();
    assert_eq!((image.width(), image.height()), (40, 32));
}

#[tokio::test]
async fn captioning_answers_not_implemented() {
    let (app, calls) = ready_app(ModelVariant::CaptioningVL, false).await;
    let (status, body) = post_generate(
        app,
        json!({"prompt": "Describe this image.", "init_image_b64": png_b64(8, 8)}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(!detail(body).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_model_answers_service_unavailable() {
    let (status, body) = post_generate(failed_app().await, json!({"prompt": "anything"})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(detail(body), "Model not loaded or invalid model type.");
}

#[tokio::test]
async fn model_errors_become_internal_errors() {
    let (app, calls) = ready_app(ModelVariant::TextToImage, true).await;
    let (status, body) = post_generate(app, json!({"prompt": "a lighthouse", "height": 16, "width": 16})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(detail(body).contains("CUDA out of memory"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_dimensions_are_rejected_before_the_model() {
    let (app, calls) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, _) = post_generate(app, json!({"prompt": "a lighthouse", "width": 13})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn same_seed_gives_identical_images() {
    let (app, _) = ready_app(ModelVariant::TextToImage, false).await;
    let request = json!({"prompt": "a lighthouse", "height": 16, "width": 16, "seed": 42});
    let (_, first) = post_generate(app.clone(), request.clone()).await;
    let (_, second) = post_generate(app.clone(), request).await;
    assert_eq!(first["image"], second["image"]);

    let (_, other) = post_generate(
        app,
        json!({"prompt": "a lighthouse", "height": 16, "width": 16, "seed": 7}),
    )
    .await;
    assert_ne!(first["image"], other["image"]);
}

#[tokio::test]
async fn oversized_dimensions_are_rejected() {
    let (app, calls) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, body) = post_generate(
        app,
        json!({"prompt": "a lighthouse", "height": 65536, "width": 512}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(detail(body).contains("height"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bodies_over_two_megabytes_are_accepted() {
    let (app, _) = ready_app(ModelVariant::TextToImage, false).await;
    let padding = "x".repeat(3 * 1024 * 1024);
    let (status, _) = post_generate(
        app,
        json!({"prompt": "a lighthouse", "negative_prompt": padding, "height": 16, "width": 16}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn bodies_over_the_cap_get_a_detail() {
    let (app, calls) = ready_app(ModelVariant::TextToImage, false).await;
    let padding = "x".repeat(MAX_REQUEST_BYTES + 1);
    let (status, body) = post_generate(
        app,
        json!({"prompt": "a lighthouse", "negative_prompt": padding}),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!detail(body).is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_json_gets_a_detail() {
    let (app, _) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, body) = post_raw(app, "{\"prompt\": ".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!detail(body).is_empty());
}

#[tokio::test]
async fn missing_prompt_gets_a_detail() {
    let (app, calls) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, body) = post_generate(app, json!({"height": 16})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(detail(body).contains("prompt"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wrongly_typed_field_gets_a_detail() {
    let (app, _) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, body) = post_generate(app, json!({"prompt": "a lighthouse", "width": "wide"})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(!detail(body).is_empty());
}

#[tokio::test]
async fn negative_seed_is_accepted() {
    let (app, _) = ready_app(ModelVariant::TextToImage, false).await;
    let (status, _) = post_generate(
        app,
        json!({"prompt": "a lighthouse", "height": 16, "width": 16, "seed": -1}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
