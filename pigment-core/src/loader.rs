use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, Pipeline};

pub trait Loader {
    type Model: Pipeline + 'static;

    fn load(
        model_id: String,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
