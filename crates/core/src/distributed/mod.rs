//! Collective-communication contract used by the MoE core.
//!
//! - [`ProcessGroup`] - rank / world size of the participating workers
//! - [`DeviceCommunicator`] - blocking collectives (all_gather, all_to_all_v, all_reduce)
//!
//! # Implementations
//!
//! - [`LocalCommunicator`]: single worker, every collective is identity
//! - [`ThreadCommunicator`]: N workers on N threads of one process, used for
//!   SPMD simulation and tests
//!
//! Real deployments plug a transport-backed implementation behind the same
//! trait. The core never retries a collective.
//!
//! # Usage
//!
//! ```ignore
//! use fmoe_core::distributed::{DeviceCommunicator, ThreadCommunicator};
//!
//! let comms = ThreadCommunicator::group(4);
//! assert_eq!(comms[2].process_group().rank(), 2);
//! ```

mod communicator;
mod error;
mod process_group;
mod thread_group;

pub use communicator::{DeviceCommunicator, LocalCommunicator, ReduceOp};
pub use error::DistributedError;
pub use process_group::{LocalProcessGroup, ProcessGroup};
pub use thread_group::ThreadCommunicator;
