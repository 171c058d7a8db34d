use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use pigment_core::{
    device_label, load_pipeline, select_best_device, select_variant, ModelContext, VariantSource,
};
use pigment_server::config::{Args, LogFormat};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let (variant, source) = select_variant(args.model_type, &args.model, args.strict_model_type)?;
    match source {
        VariantSource::Configured => info!("Using configured model type: {variant}"),
        VariantSource::Detected => info!("Detected {variant} model type from {}", args.model),
        VariantSource::Fallback => warn!(
            "No model type marker in {}; assuming {variant} (sketch-to-image, etc.). Pass --model-type to be explicit.",
            args.model
        ),
    }

    let device_map = args.device_map();
    let device = select_best_device(device_map)?;
    info!(
        "Starting up. Device: {}. Loading model: {}...",
        device_label(&device),
        args.model
    );

    let mut context = ModelContext::new(args.model.clone(), device_label(&device));
    drop(device);
    let model_source = args.model_source();
    context
        .load(variant, move |variant| async move {
            load_pipeline(variant, &model_source, device_map).await
        })
        .await?;

    if let Some(reason) = context.failure() {
        if !args.serve_degraded {
            bail!("Failed to load model on startup: {reason}");
        }
        warn!("Serving in degraded mode; /generate will answer 503");
    }

    // --- Build axum router with shared state ---
    let app = pigment_server::router(Arc::new(context));

    // --- Start the server ---
    let listener = TcpListener::bind(&args.bind_address()).await?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
