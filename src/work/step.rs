use super::packet::Packet;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type StepRef = Arc<dyn Step>;

/// Completion callback of a suspended call, applied to the packet when the fiber resumes
pub type Resume = Box<dyn FnOnce(&mut Packet) + Send>;

/// Terminal failure of a fiber
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FiberError {
    #[error("Kubernetes API failure ({reason}): {message}")]
    Api {
        status_code: Option<u16>,
        reason: String,
        message: String,
    },

    #[error("Not authorized ({status_code}): {message}")]
    NotAuthorized { status_code: u16, message: String },

    #[error("Step {step} panicked: {message}")]
    Panicked { step: String, message: String },

    #[error("{} forked fiber(s) failed, first: {}", .0.len(), first_error(.0))]
    ChildrenFailed(Vec<FiberError>),

    #[error("Missing packet component: {0}")]
    MissingComponent(&'static str),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Fiber cancelled: operator is stopping")]
    Cancelled,
}

fn first_error(errors: &[FiberError]) -> String {
    errors
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

/// One unit of reconciliation logic
///
/// A step only knows its successor. `apply` receives the step through its `Arc` so that
/// a step can name itself as the continuation of a delay or fork-join.
pub trait Step: Send + Sync {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction;

    fn next(&self) -> Option<&StepRef>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Extra log detail, such as the servers a step works on
    fn detail(&self) -> Option<String> {
        None
    }
}

/// A step chain paired with the packet it runs on
#[derive(Clone)]
pub struct StepAndPacket {
    pub step: StepRef,
    pub packet: Packet,
}

impl StepAndPacket {
    pub fn new(step: StepRef, packet: Packet) -> Self {
        Self { step, packet }
    }
}

impl fmt::Debug for StepAndPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepAndPacket")
            .field("step", &self.step.name())
            .field("packet", &self.packet)
            .finish()
    }
}

/// Outcome of applying a step
pub enum NextAction {
    /// Continue with the given step
    Next(StepRef),
    /// Run every child as its own fiber, then resume `join` once all of them terminated
    ForkJoin {
        children: Vec<StepAndPacket>,
        join: Option<StepRef>,
    },
    /// Resume with `then` after `duration`
    Delay {
        duration: Duration,
        then: Option<StepRef>,
    },
    /// Wait for an asynchronous call; its completion callback runs before `then`
    Suspend {
        pending: BoxFuture<'static, Resume>,
        then: Option<StepRef>,
    },
    /// Terminate the fiber successfully
    End,
    /// Terminate the fiber with a failure
    Terminate(FiberError),
}

impl NextAction {
    /// Continue with `step`, or end the fiber when there is none
    pub fn next(step: Option<&StepRef>) -> Self {
        match step {
            Some(step) => NextAction::Next(step.clone()),
            None => NextAction::End,
        }
    }

    pub fn fork_join(children: Vec<StepAndPacket>, join: Option<&StepRef>) -> Self {
        NextAction::ForkJoin {
            children,
            join: join.cloned(),
        }
    }

    pub fn delay(duration: Duration, then: Option<&StepRef>) -> Self {
        NextAction::Delay {
            duration,
            then: then.cloned(),
        }
    }

    /// The step this action continues with, if any
    pub fn target(&self) -> Option<&StepRef> {
        match self {
            NextAction::Next(step) => Some(step),
            NextAction::ForkJoin { join, .. } => join.as_ref(),
            NextAction::Delay { then, .. } | NextAction::Suspend { then, .. } => then.as_ref(),
            NextAction::End | NextAction::Terminate(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NextAction::Next(_) => "next",
            NextAction::ForkJoin { .. } => "fork-join",
            NextAction::Delay { .. } => "delay",
            NextAction::Suspend { .. } => "suspend",
            NextAction::End => "end",
            NextAction::Terminate(_) => "terminate",
        }
    }
}

impl fmt::Debug for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextAction::Terminate(e) => write!(f, "Terminate({e})"),
            other => {
                let target = other.target().map(|s| s.name()).unwrap_or("-");
                write!(f, "{}({})", other.kind(), target)
            }
        }
    }
}

/// True when both references point at the same step
pub fn same_step(a: &StepRef, b: &StepRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
