//! # cronscale-resources
//!
//! Resource shapes exchanged with the cluster API for the cronscale
//! controller.
//!
//! ## Design Principles
//!
//! - The `ScalingPolicy` status subresource is the only state the controller
//!   persists; everything else is re-derived from the cluster on every pass
//! - Status history is observational; `nextTransitionTime` alone decides
//!   when a policy is due
//! - Workload objects model only the fields the controller reads or writes;
//!   every other field is carried through untouched so read-modify-write
//!   never drops data
//!
//! ## Resources
//!
//! - `ScalingPolicy` (`cronscale.io/v1`): target, bounds, schedule, job template
//! - `Deployment` (`apps/v1`): the scale target
//! - `Job` (`batch/v1`) and `Pod` (`v1`): the ephemeral evaluation workload

mod meta;
mod policy;
pub mod time;
mod workload;

pub use meta::*;
pub use policy::*;
pub use workload::*;
