//! Domain operator
//!
//! Reconciles `Domain` resources into server pods through a step/fiber engine:
//! - [`work`]: packets, steps and the fiber engine
//! - [`calls`]: Kubernetes request/response steps with retry and conflict handling
//! - [`controller`]: presence cache, rolling restarts, status and the reconcile loop
//! - [`server`]: health, metrics and shutdown plumbing

pub mod calls;
pub mod config;
pub mod controller;
pub mod crd;
pub mod server;
pub mod work;
