//! Checkpoint loading and legacy-format handling.
//!
//! Identity-encoder and U-Net checkpoints arrive either as safetensors or as
//! native-serialized tensor maps. Alternate main U-Nets may additionally use
//! the older latent-diffusion key naming; those are detected by key-prefix
//! sniffing, re-prefixed to the canonical form, and handed to a
//! [`LegacyUnetConverter`] collaborator. The format is an explicit value on
//! the loaded map — no global module state is ever touched to make old
//! checkpoints resolve.

use std::collections::HashMap;
use std::path::Path;

use candle::{Device, Tensor};

use crate::error::{Error, Result};

/// Key naming convention of a U-Net state dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnetCheckpointFormat {
    /// Diffusers-native keys; loadable as-is.
    Native,
    /// Legacy latent-diffusion keys, `model.diffusion_model.*`.
    Legacy,
    /// Legacy keys missing the leading `model.`; re-prefixed before
    /// conversion.
    LegacyUnprefixed,
}

impl UnetCheckpointFormat {
    /// Sniff the format from the map's key prefixes.
    pub fn detect(tensors: &HashMap<String, Tensor>) -> Self {
        if tensors.keys().any(|k| k.starts_with("model.diffusion_model")) {
            Self::Legacy
        } else if tensors.keys().any(|k| k.starts_with("diffusion_model")) {
            Self::LegacyUnprefixed
        } else {
            Self::Native
        }
    }

    pub fn is_legacy(&self) -> bool {
        !matches!(self, Self::Native)
    }
}

/// State-dict conversion collaborator for legacy U-Net checkpoints.
///
/// The key-by-key rewrite from latent-diffusion to diffusers naming is a
/// format-conversion utility outside this crate; implementations receive a
/// map whose keys are already normalized to `model.diffusion_model.*`.
pub trait LegacyUnetConverter {
    fn convert(&self, tensors: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>>;
}

/// Load a tensor map from a safetensors or native-serialized checkpoint.
pub fn load_tensor_map(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if !path.is_file() {
        return Err(Error::config(format!(
            "checkpoint path {} is not a readable file",
            path.display()
        )));
    }

    let tensors = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => candle::safetensors::load(path, device)?,
        _ => {
            let pairs = candle::pickle::read_all(path)?;
            let mut map = HashMap::with_capacity(pairs.len());
            for (name, tensor) in pairs {
                map.insert(name, tensor.to_device(device)?);
            }
            map
        }
    };
    tracing::debug!(
        path = %path.display(),
        tensors = tensors.len(),
        "loaded checkpoint tensor map"
    );
    Ok(tensors)
}

/// Prepend `model.` to legacy keys that are missing it.
fn normalize_legacy_keys(tensors: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    tensors
        .into_iter()
        .map(|(key, value)| (format!("model.{key}"), value))
        .collect()
}

/// Load a U-Net state dict, routing legacy formats through the converter.
///
/// A legacy checkpoint with no converter configured is a configuration
/// error; silently loading mismatched keys would only fail later and
/// further from the cause.
pub fn load_unet_state_dict(
    path: &Path,
    device: &Device,
    converter: Option<&dyn LegacyUnetConverter>,
) -> Result<HashMap<String, Tensor>> {
    let tensors = load_tensor_map(path, device)?;
    let format = UnetCheckpointFormat::detect(&tensors);
    match format {
        UnetCheckpointFormat::Native => Ok(tensors),
        UnetCheckpointFormat::Legacy | UnetCheckpointFormat::LegacyUnprefixed => {
            tracing::info!(
                path = %path.display(),
                ?format,
                "legacy U-Net checkpoint detected, converting"
            );
            let tensors = if format == UnetCheckpointFormat::LegacyUnprefixed {
                normalize_legacy_keys(tensors)
            } else {
                tensors
            };
            match converter {
                Some(converter) => converter.convert(tensors),
                None => Err(Error::config(format!(
                    "U-Net checkpoint {} uses the legacy key format but no converter \
                     is configured",
                    path.display()
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::DType;

    fn map_with_keys(keys: &[&str]) -> HashMap<String, Tensor> {
        keys.iter()
            .map(|k| {
                let t = Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap();
                (k.to_string(), t)
            })
            .collect()
    }

    #[test]
    fn detects_native_format() {
        let map = map_with_keys(&["down_blocks.0.resnets.0.conv1.weight"]);
        assert_eq!(UnetCheckpointFormat::detect(&map), UnetCheckpointFormat::Native);
    }

    #[test]
    fn detects_legacy_format() {
        let map = map_with_keys(&["model.diffusion_model.input_blocks.0.0.weight"]);
        assert_eq!(UnetCheckpointFormat::detect(&map), UnetCheckpointFormat::Legacy);
    }

    #[test]
    fn detects_unprefixed_legacy_format() {
        let map = map_with_keys(&["diffusion_model.input_blocks.0.0.weight"]);
        assert_eq!(
            UnetCheckpointFormat::detect(&map),
            UnetCheckpointFormat::LegacyUnprefixed
        );
    }

    #[test]
    fn normalize_prepends_model_prefix() {
        let map = map_with_keys(&["diffusion_model.out.0.weight"]);
        let normalized = normalize_legacy_keys(map);
        assert!(normalized.contains_key("model.diffusion_model.out.0.weight"));
    }

    #[test]
    fn missing_checkpoint_is_config_error() {
        let err = load_tensor_map(Path::new("/nonexistent/unet.safetensors"), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("/nonexistent/unet.safetensors"));
    }
}
