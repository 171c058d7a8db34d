use clap::{Parser, ValueEnum};
use pigment_core::{DeviceMap, ModelSource, ModelVariant};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Pigment single-model generation server")]
pub struct Args {
    /// Hugging Face model repository to serve
    #[arg(long, env = "MODEL_ID")]
    pub model: String,

    /// Access token for gated or private repositories
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Protocol the model implements (captioning, txt2img, img2img); guessed from the model id if unset
    #[arg(long, env = "MODEL_TYPE")]
    pub model_type: Option<ModelVariant>,

    /// Refuse to start when the model type cannot be determined from the model id
    #[arg(long)]
    pub strict_model_type: bool,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Keep serving /health (and answer /generate with 503) if the model fails to load
    #[arg(long)]
    pub serve_degraded: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    pub fn model_source(&self) -> ModelSource {
        ModelSource {
            model_id: self.model.clone(),
            token: self.hf_token.clone().filter(|t| !t.is_empty()),
        }
    }

    pub fn device_map(&self) -> DeviceMap {
        DeviceMap::from_cpu_flag(self.cpu)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
