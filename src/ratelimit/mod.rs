//! Admission state and decisions.

mod identity;
mod limiter;
mod policy;
mod registry;
mod store;

pub use identity::{client_address, IdentityExtractor, RequestContext, LOOPBACK_IDENTITY};
pub use limiter::{Decision, Limiter, RejectHook};
pub use policy::{AdmissionPolicy, Outcome, PolicyRule, DEFAULT_REJECTION_MESSAGE, MAX_WINDOW};
pub use registry::{OperationClass, PolicyRegistry};
pub use store::{CountingRecord, StoreStats, SweeperHandle, WindowStore, DEFAULT_SWEEP_INTERVAL};
