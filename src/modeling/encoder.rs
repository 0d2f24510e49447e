use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::Result;
use crate::modeling::object_count::ObjectCount;

/// Query-side embedding of one frame: the key used for memory addressing
/// plus the encoder features the decoder consumes alongside the readout.
#[derive(Debug, Clone)]
pub struct QueryEmbedding {
    pub key: Tensor,
    pub feats: Tensor,
}

/// External frame/mask encoder.
///
/// Produces fixed-dimension per-pixel embeddings at a reduced grid. The
/// network behind this trait is out of scope here; the engine only relies
/// on the declared dimensions and on determinism per input.
pub trait FrameEncoder {
    fn keydim(&self) -> usize;
    fn valdim(&self) -> usize;

    /// Embed a `(C, H, W)` frame together with its `(max_obj+1, H, W)` mask
    /// source into a memory `(key, value)` pair.
    fn encode_memory(
        &self,
        frame: &Tensor,
        mask: &Tensor,
        num_objects: &ObjectCount,
    ) -> Result<(Tensor, Tensor)>;

    /// Embed a `(C, H, W)` frame into its query representation.
    fn encode_query(&self, frame: &Tensor) -> Result<QueryEmbedding>;
}

/// External readout decoder: aggregated memory features plus the query's own
/// embedding in, `(No+1, H, W)` segmentation logits out.
pub trait MaskDecoder {
    fn decode(
        &self,
        readout: &Tensor,
        query: &QueryEmbedding,
        num_objects: &ObjectCount,
        max_obj: usize,
    ) -> Result<Tensor>;
}

/// Anything the propagation engine can drive: encoder and decoder together.
pub trait PropagationModel: FrameEncoder + MaskDecoder {}

impl<T: FrameEncoder + MaskDecoder> PropagationModel for T {}

/// A model that can also hand its parameters to an optimizer and to the
/// checkpoint writer.
pub trait TrainableModel: FrameEncoder + MaskDecoder {
    fn trainable_vars(&self) -> Vec<Var>;
    fn varmap(&self) -> &VarMap;
}
