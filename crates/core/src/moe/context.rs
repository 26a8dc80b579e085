//! Auxiliary per-pass context.
//!
//! Everything a caller threads through one forward pass besides the input
//! tensor lives here, with empty defaults. The MoE layer reads `fuse_token`
//! and `batch_padding_mask`; the historical buffers and EMA masks are carried
//! for gates and cost models that want them and are not interpreted by the core.

use candle_core::Tensor;

/// Named side-channel inputs of one forward pass.
#[derive(Debug, Clone, Default)]
pub struct PassContext {
    /// Index of the transformer layer this MoE block belongs to.
    pub layer_idx: usize,
    /// Global training step, 0 for inference.
    pub training_step: usize,
    /// Allow the fusion policy to merge per-expert transfers.
    pub fuse_token: bool,
    /// One entry per flattened token; zero marks a padding token that is not dispatched.
    pub batch_padding_mask: Option<Tensor>,
    /// Historical "last elements" buffers, one slot per expert FFN.
    pub last_elements: Vec<Option<Tensor>>,
    /// Masks comparing current routing against an exponential moving average.
    pub ema_comparison_masks: Option<Tensor>,
}

impl PassContext {
    pub fn new(layer_idx: usize, training_step: usize) -> Self {
        Self {
            layer_idx,
            training_step,
            ..Default::default()
        }
    }

    pub fn with_fuse_token(mut self, fuse_token: bool) -> Self {
        self.fuse_token = fuse_token;
        self
    }

    pub fn with_padding_mask(mut self, mask: Tensor) -> Self {
        self.batch_padding_mask = Some(mask);
        self
    }

    /// Store a historical buffer for FFN `slot`, growing the slot list as needed.
    pub fn with_last_elements(mut self, slot: usize, buffer: Tensor) -> Self {
        if self.last_elements.len() <= slot {
            self.last_elements.resize(slot + 1, None);
        }
        self.last_elements[slot] = Some(buffer);
        self
    }

    pub fn with_ema_comparison_masks(mut self, masks: Tensor) -> Self {
        self.ema_comparison_masks = Some(masks);
        self
    }

    /// Historical buffer for FFN `slot`, if any.
    pub fn last_elements(&self, slot: usize) -> Option<&Tensor> {
        self.last_elements.get(slot).and_then(Option::as_ref)
    }
}
