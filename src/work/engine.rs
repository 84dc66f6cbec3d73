//! Fiber engine
//!
//! Interprets [`NextAction`]s produced by a step chain. Every fiber is an async task on the
//! tokio runtime, so delays, pending API calls and fork-join barriers park the fiber without
//! holding a worker thread.

use super::packet::{keys, Packet};
use super::step::{FiberError, NextAction, StepAndPacket, StepRef};
use crate::server::{SharedMetrics, ShutdownSignal};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Final state of a fiber together with the packet it ran on
#[derive(Debug)]
pub struct FiberOutcome {
    pub packet: Packet,
    pub result: Result<(), FiberError>,
}

pub struct Engine {
    stopping: ShutdownSignal,
    metrics: Option<SharedMetrics>,
    next_fiber_id: AtomicU64,
}

impl Engine {
    pub fn new(stopping: ShutdownSignal, metrics: Option<SharedMetrics>) -> Arc<Self> {
        Arc::new(Self {
            stopping,
            metrics,
            next_fiber_id: AtomicU64::new(1),
        })
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_stopping()
    }

    /// Run a step chain to completion
    ///
    /// Mutations made by the chain are visible in the returned packet. A terminal failure is
    /// also stored in the packet under [`keys::FAILURE`].
    pub async fn run(self: &Arc<Self>, head: StepRef, packet: Packet) -> FiberOutcome {
        let id = self.next_fiber_id.fetch_add(1, Ordering::Relaxed);
        self.clone().run_fiber(id, head, packet).await
    }

    fn run_fiber(
        self: Arc<Self>,
        id: u64,
        head: StepRef,
        mut packet: Packet,
    ) -> BoxFuture<'static, FiberOutcome> {
        async move {
            if let Some(ref metrics) = self.metrics {
                metrics.fiber_started();
            }
            let result = self.drive(id, head, &mut packet).await;
            if let Err(ref e) = result {
                debug!(fiber = id, error = %e, "Fiber terminated with failure");
                packet.put(keys::FAILURE, e.clone());
            }
            if let Some(ref metrics) = self.metrics {
                metrics.fiber_finished(result.is_ok());
            }
            FiberOutcome { packet, result }
        }
        .boxed()
    }

    async fn drive(
        self: &Arc<Self>,
        id: u64,
        head: StepRef,
        packet: &mut Packet,
    ) -> Result<(), FiberError> {
        let mut current = Some(head);

        while let Some(step) = current.take() {
            let action = match catch_unwind(AssertUnwindSafe(|| step.clone().apply(packet))) {
                Ok(action) => action,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(fiber = id, step = step.name(), message = %message, "Step panicked");
                    NextAction::Terminate(FiberError::Panicked {
                        step: step.name().to_string(),
                        message,
                    })
                }
            };

            debug!(
                fiber = id,
                step = step.name(),
                detail = step.detail().unwrap_or_default(),
                action = ?action,
                "Applied step"
            );

            current = match action {
                NextAction::Next(next) => Some(next),
                NextAction::End => return Ok(()),
                NextAction::Terminate(e) => return Err(e),
                NextAction::Delay { duration, then } => {
                    self.sleep(duration).await;
                    then
                }
                NextAction::Suspend { pending, then } => {
                    let resume = pending.await;
                    if self.is_stopping() {
                        debug!(fiber = id, "Discarding call response, operator is stopping");
                        return Err(FiberError::Cancelled);
                    }
                    resume(packet);
                    then
                }
                NextAction::ForkJoin { children, join } => {
                    self.fork_join(id, children).await?;
                    join
                }
            };
        }

        Ok(())
    }

    /// Sleep on the timer, waking early when the operator starts stopping
    async fn sleep(&self, duration: Duration) {
        let mut stopping = self.stopping.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = stopping.stopped() => {}
        }
    }

    /// Run every child as an independent fiber and wait for all of them
    async fn fork_join(
        self: &Arc<Self>,
        parent: u64,
        children: Vec<StepAndPacket>,
    ) -> Result<(), FiberError> {
        if children.is_empty() {
            return Ok(());
        }

        debug!(fiber = parent, children = children.len(), "Forking fibers");

        let handles: Vec<_> = children
            .into_iter()
            .map(|child| {
                let id = self.next_fiber_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(self.clone().run_fiber(id, child.step, child.packet))
            })
            .collect();

        let failures: Vec<FiberError> = join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(outcome) => outcome.result.err(),
                Err(e) => Some(FiberError::Panicked {
                    step: "fiber".to_string(),
                    message: e.to_string(),
                }),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FiberError::ChildrenFailed(failures))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
