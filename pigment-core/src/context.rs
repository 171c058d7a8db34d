use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Mutex, PoisonError},
};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{params::Payload, ModelError, ModelOutput, ModelVariant, Pipeline};

/// A loaded model together with the protocol it implements.
pub struct LoadedModel {
    variant: ModelVariant,
    pipeline: Mutex<Box<dyn Pipeline>>,
}

impl LoadedModel {
    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    /// Run one payload, holding the pipeline lock for the whole call.
    ///
    /// A panicking backend fails only its own request; the lock stays usable.
    pub fn invoke(&self, payload: Payload) -> Result<ModelOutput, ModelError> {
        let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        let kind = payload.kind();
        panic::catch_unwind(AssertUnwindSafe(|| pipeline.run(payload))).unwrap_or_else(|cause| {
            let message = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown cause".to_string());
            error!("{} pipeline panicked on a {kind} payload: {message}", pipeline.name());
            Err(ModelError::Panicked(message))
        })
    }
}

pub enum ModelState {
    Uninitialized,
    Loading { variant: ModelVariant },
    Ready(LoadedModel),
    Failed {
        variant: ModelVariant,
        reason: String,
    },
}

impl ModelState {
    pub fn name(&self) -> &'static str {
        match self {
            ModelState::Uninitialized => "uninitialized",
            ModelState::Loading { .. } => "loading",
            ModelState::Ready(_) => "ready",
            ModelState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal model state transition: {from} -> {to}")]
pub struct LifecycleError {
    pub from: &'static str,
    pub to: &'static str,
}

/// Process-wide record of the served model.
///
/// Transitions take `&mut self`, so once the context is shared behind an `Arc` it
/// can no longer change.
pub struct ModelContext {
    model_id: String,
    device: String,
    state: ModelState,
}

impl ModelContext {
    pub fn new(model_id: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            device: device.into(),
            state: ModelState::Uninitialized,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    /// The variant being (or last attempted to be) served.
    pub fn variant(&self) -> Option<ModelVariant> {
        match &self.state {
            ModelState::Uninitialized => None,
            ModelState::Loading { variant } | ModelState::Failed { variant, .. } => Some(*variant),
            ModelState::Ready(model) => Some(model.variant),
        }
    }

    pub fn loaded(&self) -> Option<&LoadedModel> {
        match &self.state {
            ModelState::Ready(model) => Some(model),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            ModelState::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn begin_loading(&mut self, variant: ModelVariant) -> Result<(), LifecycleError> {
        match self.state {
            ModelState::Uninitialized => {
                self.state = ModelState::Loading { variant };
                Ok(())
            }
            _ => Err(self.illegal("loading")),
        }
    }

    /// Finish loading. Memory-efficient attention is switched on when the pipeline
    /// advertises it; failing to do so only logs.
    pub fn mark_ready(&mut self, mut pipeline: Box<dyn Pipeline>) -> Result<(), LifecycleError> {
        let ModelState::Loading { variant } = self.state else {
            return Err(self.illegal("ready"));
        };

        if pipeline.supports_memory_efficient_attention() {
            match pipeline.enable_memory_efficient_attention() {
                Ok(()) => info!("Enabled memory efficient attention."),
                Err(e) => warn!("Could not enable memory efficient attention: {e}"),
            }
        }

        info!("{} pipeline loaded ({variant}).", pipeline.name());
        self.state = ModelState::Ready(LoadedModel {
            variant,
            pipeline: Mutex::new(pipeline),
        });
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), LifecycleError> {
        let ModelState::Loading { variant } = self.state else {
            return Err(self.illegal("failed"));
        };
        self.state = ModelState::Failed {
            variant,
            reason: reason.into(),
        };
        Ok(())
    }

    /// Drive `Uninitialized -> Loading -> Ready | Failed` with the given loader.
    pub async fn load<F, Fut>(&mut self, variant: ModelVariant, loader: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(ModelVariant) -> Fut,
        Fut: Future<Output = anyhow::Result<Box<dyn Pipeline>>>,
    {
        self.begin_loading(variant)?;
        info!("Loading model: {} ({variant})...", self.model_id);
        match loader(variant).await {
            Ok(pipeline) => self.mark_ready(pipeline),
            Err(e) => {
                error!("Fatal error during model loading: {e:#}");
                self.mark_failed(format!("{e:#}"))
            }
        }
    }

    fn illegal(&self, to: &'static str) -> LifecycleError {
        LifecycleError {
            from: self.state.name(),
            to,
        }
    }
}
