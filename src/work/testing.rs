//! Step helpers shared by unit tests

use super::{NextAction, Packet, Step, StepRef};
use std::sync::Arc;

/// Step backed by a closure receiving the packet and the successor
pub struct FnStep<F> {
    f: F,
    next: Option<StepRef>,
}

impl<F> FnStep<F>
where
    F: Fn(&mut Packet, Option<&StepRef>) -> NextAction + Send + Sync + 'static,
{
    pub fn step(f: F, next: Option<StepRef>) -> StepRef {
        Arc::new(FnStep { f, next })
    }
}

impl<F> Step for FnStep<F>
where
    F: Fn(&mut Packet, Option<&StepRef>) -> NextAction + Send + Sync + 'static,
{
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        (self.f)(packet, self.next.as_ref())
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }

    fn name(&self) -> &'static str {
        "FnStep"
    }
}

/// Step that just continues with its successor
pub fn pass(next: Option<StepRef>) -> StepRef {
    FnStep::step(|_, next| NextAction::next(next), next)
}
