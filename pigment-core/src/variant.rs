use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The call protocol implemented by the loaded model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    /// Vision-language model: image + prompt in, text out.
    #[serde(rename = "captioning", alias = "qwen")]
    CaptioningVL,
    #[serde(rename = "txt2img")]
    TextToImage,
    #[serde(rename = "img2img")]
    ImageToImage,
}

serde_plain::derive_display_from_serialize!(ModelVariant);
serde_plain::derive_fromstr_from_deserialize!(ModelVariant);

const CAPTIONING_MARKERS: &[&str] = &["qwen", "blip"];
const TEXT_TO_IMAGE_MARKERS: &[&str] = &["chroma", "flux"];

impl ModelVariant {
    /// Detect the variant from a model identifier, or `None` if no marker matches.
    ///
    /// Captioning markers win over text-to-image markers.
    pub fn detect(model_name: &str) -> Option<Self> {
        let name_lower = model_name.to_lowercase();
        let contains_any = |markers: &[&str]| markers.iter().any(|m| name_lower.contains(m));

        if contains_any(CAPTIONING_MARKERS) {
            Some(ModelVariant::CaptioningVL)
        } else if contains_any(TEXT_TO_IMAGE_MARKERS) {
            Some(ModelVariant::TextToImage)
        } else {
            None
        }
    }

    /// Compatibility heuristic: unrecognized identifiers are treated as image-to-image
    /// checkpoints (sketch-to-image and generic img2img models).
    pub fn from_name(model_name: &str) -> Self {
        Self::detect(model_name).unwrap_or(ModelVariant::ImageToImage)
    }

    pub fn requires_init_image(self) -> bool {
        matches!(self, ModelVariant::CaptioningVL | ModelVariant::ImageToImage)
    }
}

/// Where the active variant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantSource {
    /// Declared by the deployment.
    Configured,
    /// Matched a marker in the model identifier.
    Detected,
    /// No marker matched; defaulted to image-to-image.
    Fallback,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot determine the model type of `{0}`; pass --model-type explicitly")]
pub struct UnrecognizedModel(pub String);

/// Pick the variant to serve.
///
/// An explicitly configured variant always wins. Otherwise the identifier heuristic
/// runs; with `strict` set, an identifier that matches no marker is an error instead
/// of silently becoming [`ModelVariant::ImageToImage`].
pub fn select_variant(
    configured: Option<ModelVariant>,
    model_id: &str,
    strict: bool,
) -> Result<(ModelVariant, VariantSource), UnrecognizedModel> {
    if let Some(variant) = configured {
        return Ok((variant, VariantSource::Configured));
    }
    match ModelVariant::detect(model_id) {
        Some(variant) => Ok((variant, VariantSource::Detected)),
        None if strict => Err(UnrecognizedModel(model_id.to_string())),
        None => Ok((ModelVariant::ImageToImage, VariantSource::Fallback)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("Qwen/Qwen-VL-Chat", ModelVariant::CaptioningVL)]
    #[case("Salesforce/blip-image-captioning-large", ModelVariant::CaptioningVL)]
    #[case("lodestones/Chroma", ModelVariant::TextToImage)]
    #[case("black-forest-labs/FLUX.1-schnell", ModelVariant::TextToImage)]
    #[case("runwayml/stable-diffusion-v1-5", ModelVariant::ImageToImage)]
    #[case("someone/sketch2img", ModelVariant::ImageToImage)]
    #[case("", ModelVariant::ImageToImage)]
    // Captioning has priority when both markers are present.
    #[case("org/chroma-qwen-merge", ModelVariant::CaptioningVL)]
    fn resolves_known_identifiers(#[case] id: &str, #[case] expected: ModelVariant) {
        assert_eq!(ModelVariant::from_name(id), expected);
    }

    #[test]
    fn configured_variant_overrides_heuristic() {
        let selected = select_variant(Some(ModelVariant::TextToImage), "Qwen/Qwen-VL", true);
        assert_eq!(
            selected,
            Ok((ModelVariant::TextToImage, VariantSource::Configured))
        );
    }

    #[test]
    fn strict_mode_rejects_unrecognized_identifier() {
        let err = select_variant(None, "org/mystery-model", true).unwrap_err();
        assert_eq!(err, UnrecognizedModel("org/mystery-model".to_string()));
        assert_eq!(
            select_variant(None, "org/mystery-model", false),
            Ok((ModelVariant::ImageToImage, VariantSource::Fallback))
        );
    }

    #[test]
    fn names_round_trip_through_display() {
        for variant in [
            ModelVariant::CaptioningVL,
            ModelVariant::TextToImage,
            ModelVariant::ImageToImage,
        ] {
            assert_eq!(variant.to_string().parse::<ModelVariant>().unwrap(), variant);
        }
        assert_eq!(
            "qwen".parse::<ModelVariant>().unwrap(),
            ModelVariant::CaptioningVL
        );
        assert_eq!(ModelVariant::TextToImage.to_string(), "txt2img");
    }

    fn no_marker() -> impl Strategy<Value = String> {
        // Excludes the leading letters of every marker.
        "[adeg-pr-zADEG-PR-Z0-9/_.-]{0,24}"
    }

    fn arbitrary() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9/_.-]{0,16}"
    }

    proptest! {
        #[test]
        fn captioning_marker_always_wins(
            prefix in arbitrary(),
            suffix in arbitrary(),
            marker in prop::sample::select(vec!["qwen", "QWEN", "Qwen", "qWeN", "BLIP", "Blip"]),
        ) {
            let id = format!("{prefix}{marker}{suffix}");
            prop_assert_eq!(ModelVariant::from_name(&id), ModelVariant::CaptioningVL);
        }

        #[test]
        fn text_to_image_marker_without_captioning_marker(
            prefix in arbitrary(),
            suffix in arbitrary(),
            marker in prop::sample::select(vec!["chroma", "CHROMA", "Chroma", "flux", "FLUX"]),
        ) {
            prop_assume!(ModelVariant::detect(&prefix).is_none());
            prop_assume!(ModelVariant::detect(&suffix).is_none());
            let id = format!("{prefix}{marker}{suffix}");
            prop_assert_eq!(ModelVariant::from_name(&id), ModelVariant::TextToImage);
        }

        #[test]
        fn everything_else_falls_back_to_image_to_image(id in no_marker()) {
            prop_assert_eq!(ModelVariant::from_name(&id), ModelVariant::ImageToImage);
        }
    }
}
