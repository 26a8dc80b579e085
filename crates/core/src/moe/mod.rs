//! Mixture of Experts (MoE) dispatch engine.
//!
//! Routes each token to `top_k` experts spread over the workers of a
//! process group, runs the experts on contiguous per-expert batches and
//! combines their outputs back into token order.
//!
//! ## Submodules
//!
//! - [`expert_map`]: Global expert id ⇄ `(rank, local index)`
//! - [`counter`]: Per-expert token counts and their exchange
//! - [`plan`]: Per-pass dispatch plan shared by scatter and gather
//! - [`fusion`]: Cost-modelled merging of per-expert transfers
//! - [`token_dispatch`]: Scatter and gather over all-to-all
//! - [`expert`]: Expert execution keyed by `fwd_expert_count`
//! - [`gate`]: Top-k gating
//! - [`layer`]: The MoE layer composing the above
//! - [`transformer`]: Transformer MLP adapter

mod context;
pub mod counter;
mod error;
pub mod expert;
pub mod expert_map;
pub mod fusion;
pub mod gate;
pub mod layer;
pub mod plan;
mod record;
pub mod token_dispatch;
pub mod transformer;

pub use context::PassContext;
pub use counter::{count_local, exchange_counts, CountMatrix, LocalCounts};
pub use error::{MoEError, Result};
pub use expert::{Activation, ExpertCompute, GroupedLinear, MlpExperts};
pub use expert_map::{ExpertMap, ExpertPlacement};
pub use fusion::{FusionConfig, FusionDecision, FusionPolicy, TrafficShape};
pub use gate::{Gate, NaiveGate, Routing};
pub use layer::{MoELayer, MoEOutput};
pub use plan::DispatchPlan;
pub use record::CommRecord;
pub use token_dispatch::{Dispatched, TokenDispatcher};
pub use transformer::{MlpOutput, TransformerMlp};
