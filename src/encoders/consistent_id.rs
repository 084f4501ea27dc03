//! ConsistentID identity adapter.
//!
//! Projects a recognition embedding into four pseudo-token rows that
//! condition best at the end of the prompt. Unlike Arc2Face, this backend
//! carries a learned anti-identity block in its checkpoint which is returned
//! for negative-prompt blending.

use std::sync::Arc;

use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::checkpoint::load_tensor_map;
use crate::config::{EncoderKind, IdentityEncoderSpec};
use crate::error::Result;

use super::{
    resolve_id_embedding, FaceEmbedder, IdProjector, IdentityEmbeddings, IdentityEncoder,
    IdentityRequest,
};

/// Recognition embedding width consumed by the projector.
pub const CONSISTENT_ID_DIM: usize = 512;

const PROJECTOR_HIDDEN_DIM: usize = 768;
const EMBED_DIM: usize = 768;

pub struct ConsistentIdEncoder {
    projector: IdProjector,
    /// Learned anti-identity rows, `[num_id_vectors, D]`, stored as-is.
    negative_rows: Tensor,
    face_embedder: Arc<dyn FaceEmbedder>,
    num_id_vectors: usize,
    output_scale: f64,
    device: Device,
}

impl ConsistentIdEncoder {
    pub fn load(
        spec: &IdentityEncoderSpec,
        face_embedder: Arc<dyn FaceEmbedder>,
        device: &Device,
    ) -> Result<Self> {
        let tensors = load_tensor_map(&spec.checkpoint_path, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let projector = IdProjector::new(
            CONSISTENT_ID_DIM,
            PROJECTOR_HIDDEN_DIM,
            spec.num_id_vectors,
            EMBED_DIM,
            vb.pp("id_projector"),
        )?;
        let negative_rows = vb.get((spec.num_id_vectors, EMBED_DIM), "negative_id_embeddings")?;
        Ok(Self {
            projector,
            negative_rows,
            face_embedder,
            num_id_vectors: spec.num_id_vectors,
            output_scale: spec.effective_scale(),
            device: device.clone(),
        })
    }
}

impl IdentityEncoder for ConsistentIdEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::ConsistentId
    }

    fn num_id_vectors(&self) -> usize {
        self.num_id_vectors
    }

    fn output_scale(&self) -> f64 {
        self.output_scale
    }

    fn generate_embeddings(
        &self,
        request: &IdentityRequest,
        noise_level: f64,
    ) -> Result<IdentityEmbeddings> {
        let id = resolve_id_embedding(
            request,
            self.face_embedder.as_ref(),
            CONSISTENT_ID_DIM,
            noise_level,
            &self.device,
        )?;
        let subject = (self.projector.forward(&id)? * self.output_scale)?;
        Ok(IdentityEmbeddings {
            subject,
            negative: Some(self.negative_rows.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarBuilder;

    struct UnitEmbedder;

    impl FaceEmbedder for UnitEmbedder {
        fn embed(&self, _paths: &[std::path::PathBuf]) -> Result<Tensor> {
            Ok(Tensor::ones(CONSISTENT_ID_DIM, DType::F32, &Device::Cpu)?)
        }
    }

    fn zeros_encoder(num_id_vectors: usize) -> ConsistentIdEncoder {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let projector = IdProjector::new(
            CONSISTENT_ID_DIM,
            PROJECTOR_HIDDEN_DIM,
            num_id_vectors,
            EMBED_DIM,
            vb.pp("id_projector"),
        )
        .unwrap();
        let negative_rows = Tensor::ones((num_id_vectors, EMBED_DIM), DType::F32, &device).unwrap();
        ConsistentIdEncoder {
            projector,
            negative_rows,
            face_embedder: Arc::new(UnitEmbedder),
            num_id_vectors,
            output_scale: 1.0,
            device,
        }
    }

    #[test]
    fn produces_negative_rows() {
        let encoder = zeros_encoder(4);
        let embeddings = encoder
            .generate_embeddings(&IdentityRequest::random(), 0.0)
            .unwrap();
        assert_eq!(embeddings.subject.dims(), &[4, EMBED_DIM]);
        let negative = embeddings.negative.unwrap();
        assert_eq!(negative.dims(), &[4, EMBED_DIM]);
    }
}
