//! Domain controller
//!
//! The pod watcher keeps a presence cache of every domain's server pods. Reconciles read
//! that cache, roll out-of-date servers cluster by cluster, and publish the domain status.

pub mod clock;
pub mod events;
pub mod pods;
pub mod presence;
pub mod reconcile;
pub mod rolling;
pub mod status;
pub mod watcher;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod testing;

pub use presence::{DomainPresenceInfo, DomainPresenceRegistry, DomainTopology};
pub use reconcile::{error_policy, reconcile, Context, ReconcileError};
