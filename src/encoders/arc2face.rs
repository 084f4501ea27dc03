//! Arc2Face identity adapter.
//!
//! Projects an ArcFace-style recognition embedding into sixteen pseudo-token
//! rows. Its identity signal conditions best when read first, so the prompt
//! composer places its tokens at the front. There is no natural
//! anti-identity signal; negative rows are zero-filled by the caller.

use std::sync::Arc;

use candle::{DType, Device};
use candle_nn::VarBuilder;

use crate::checkpoint::load_tensor_map;
use crate::config::{EncoderKind, IdentityEncoderSpec};
use crate::error::Result;

use super::{
    resolve_id_embedding, FaceEmbedder, IdProjector, IdentityEmbeddings, IdentityEncoder,
    IdentityRequest,
};

/// ArcFace recognition embedding width.
pub const ARC2FACE_ID_DIM: usize = 512;

const PROJECTOR_HIDDEN_DIM: usize = 1024;
const EMBED_DIM: usize = 768;

pub struct Arc2FaceEncoder {
    projector: IdProjector,
    face_embedder: Arc<dyn FaceEmbedder>,
    num_id_vectors: usize,
    output_scale: f64,
    device: Device,
}

impl Arc2FaceEncoder {
    pub fn load(
        spec: &IdentityEncoderSpec,
        face_embedder: Arc<dyn FaceEmbedder>,
        device: &Device,
    ) -> Result<Self> {
        let tensors = load_tensor_map(&spec.checkpoint_path, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let projector = IdProjector::new(
            ARC2FACE_ID_DIM,
            PROJECTOR_HIDDEN_DIM,
            spec.num_id_vectors,
            EMBED_DIM,
            vb.pp("id_projector"),
        )?;
        Ok(Self {
            projector,
            face_embedder,
            num_id_vectors: spec.num_id_vectors,
            output_scale: spec.effective_scale(),
            device: device.clone(),
        })
    }
}

impl IdentityEncoder for Arc2FaceEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::Arc2Face
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
            ARC2FACE_ID_DIM,
            noise_level,
            &self.device,
        )?;
        let subject = (self.projector.forward(&id)? * self.output_scale)?;
        Ok(IdentityEmbeddings {
            subject,
            negative: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Tensor;
    use candle_nn::VarBuilder;

    struct UnitEmbedder;

    impl FaceEmbedder for UnitEmbedder {
        fn embed(&self, _paths: &[std::path::PathBuf]) -> Result<Tensor> {
            Ok(Tensor::ones(ARC2FACE_ID_DIM, DType::F32, &Device::Cpu)?)
        }
    }

    fn zeros_encoder(num_id_vectors: usize, output_scale: f64) -> Arc2FaceEncoder {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let projector = IdProjector::new(
            ARC2FACE_ID_DIM,
            PROJECTOR_HIDDEN_DIM,
            num_id_vectors,
            EMBED_DIM,
            vb.pp("id_projector"),
        )
        .unwrap();
        Arc2FaceEncoder {
            projector,
            face_embedder: Arc::new(UnitEmbedder),
            num_id_vectors,
            output_scale,
            device,
        }
    }

    #[test]
    fn random_identity_output_is_shape_correct() {
        let encoder = zeros_encoder(16, 6.0);
        let embeddings = encoder
            .generate_embeddings(&IdentityRequest::random(), 0.0)
            .unwrap();
        assert_eq!(embeddings.subject.dims(), &[16, EMBED_DIM]);
        assert!(embeddings.negative.is_none());
    }

    #[test]
    fn image_request_goes_through_face_embedder() {
        let encoder = zeros_encoder(4, 6.0);
        let request = IdentityRequest::from_images(vec!["subject.png".into()]);
        let embeddings = encoder.generate_embeddings(&request, 0.0).unwrap();
        assert_eq!(embeddings.subject.dims(), &[4, EMBED_DIM]);
    }
}
