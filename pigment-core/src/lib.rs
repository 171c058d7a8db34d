pub mod codec;
pub mod context;
pub mod device_map;
pub mod dispatch;
mod error;
pub mod loader;
mod loader_factory;
pub mod params;
mod pipeline;
pub mod request;
mod util;
pub mod variant;

mod blip;
mod flux;
mod stable_diffusion;

pub use blip::BlipLoader;
pub use context::{LoadedModel, ModelContext, ModelState};
pub use device_map::*;
pub use dispatch::generate;
pub use error::{GenerationError, InvalidImageEncoding, ModelError};
pub use flux::FluxLoader;
pub use loader::*;
pub use loader_factory::*;
pub use params::Payload;
pub use pipeline::{ModelOutput, Pipeline};
pub use request::GenerationRequest;
pub use stable_diffusion::StableDiffusionLoader;
pub(crate) use util::{image_to_tensor, preferred_dtype};
pub use util::{device_label, select_best_device, tensor_to_image};
pub use variant::{select_variant, ModelVariant, VariantSource};

pub use image;
