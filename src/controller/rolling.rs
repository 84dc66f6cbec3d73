//! Rolling restart coordinator
//!
//! Restarts a set of servers while keeping every cluster at or above its minimum number of
//! available servers:
//! - servers that are not Ready, or that belong to no cluster, restart right away
//! - clustered servers restart in waves sized by the cluster's current slack
//! - `DomainRollCompleted` is emitted once, after every wave of every cluster joined

use super::events::{DomainEvent, EventSink};
use super::presence::{ClusterTopology, DomainPresenceInfo, DomainTopology};
use crate::server::{SharedMetrics, ShutdownSignal};
use crate::work::{keys, FiberError, NextAction, Packet, Step, StepAndPacket, StepRef};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Shared collaborators of one roll
pub struct RollingContext {
    pub events: Arc<dyn EventSink>,
    pub stopping: ShutdownSignal,
    pub poll_delay: Duration,
    pub metrics: Option<SharedMetrics>,
}

type Member = (String, StepAndPacket);

/// Servers split into what can restart now and per-cluster queues
#[derive(Debug, Default)]
pub struct Partition {
    pub unconstrained: Vec<Member>,
    pub clustered: BTreeMap<String, Vec<Member>>,
}

impl Partition {
    /// Server names per bucket, for comparing partitions
    pub fn layout(&self) -> (Vec<String>, BTreeMap<String, Vec<String>>) {
        let names = |members: &[Member]| members.iter().map(|(n, _)| n.clone()).collect();
        (
            names(&self.unconstrained),
            self.clustered
                .iter()
                .map(|(cluster, members)| (cluster.clone(), names(members)))
                .collect(),
        )
    }
}

/// Place each server in exactly one bucket
///
/// A server that is not Ready is never held back by its cluster. Clustered queues keep the
/// name order of `work`.
pub fn partition(work: &BTreeMap<String, StepAndPacket>, ready: &BTreeSet<String>) -> Partition {
    let mut result = Partition::default();
    for (name, member) in work {
        let cluster = member.packet.get::<String>(keys::CLUSTER_NAME);
        match cluster {
            Some(cluster) if ready.contains(name) => result
                .clustered
                .entry(cluster.clone())
                .or_default()
                .push((name.clone(), member.clone())),
            _ => result.unconstrained.push((name.clone(), member.clone())),
        }
    }
    result
}

/// Take the next wave off a cluster queue
///
/// Queued servers that are no longer Ready cost no slack. Up to `ready - min_available`
/// Ready servers follow, first in first out.
pub fn next_wave<T>(
    queue: &mut VecDeque<(String, T)>,
    ready: &BTreeSet<String>,
    min_available: usize,
) -> Vec<(String, T)> {
    let mut slack = ready.len().saturating_sub(min_available);
    let mut wave = Vec::new();
    let mut held = VecDeque::with_capacity(queue.len());
    for (name, item) in queue.drain(..) {
        if !ready.contains(&name) {
            wave.push((name, item));
        } else if slack > 0 {
            slack -= 1;
            wave.push((name, item));
        } else {
            held.push_back((name, item));
        }
    }
    *queue = held;
    wave
}

/// Step that restarts `rolling` and then continues with `next`
pub fn roll_servers(
    rolling: BTreeMap<String, StepAndPacket>,
    next: Option<StepRef>,
    ctx: Arc<RollingContext>,
) -> StepRef {
    let after_roll: StepRef = Arc::new(AfterRollStep {
        ctx: ctx.clone(),
        next,
    });
    Arc::new(RollingStep {
        rolling,
        ctx,
        after_roll,
    })
}

fn presence_of(packet: &Packet) -> Result<Arc<DomainPresenceInfo>, FiberError> {
    packet
        .spi::<DomainPresenceInfo>()
        .ok_or(FiberError::MissingComponent("DomainPresenceInfo"))
}

struct RollingStep {
    rolling: BTreeMap<String, StepAndPacket>,
    ctx: Arc<RollingContext>,
    after_roll: StepRef,
}

impl Step for RollingStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        let presence = match presence_of(packet) {
            Ok(presence) => presence,
            Err(e) => return NextAction::Terminate(e),
        };

        if !packet.contains(keys::ROLL_START_EVENT_GENERATED) {
            packet.put(keys::ROLL_START_EVENT_GENERATED, true);
            let servers: Vec<&str> = self.rolling.keys().map(String::as_str).collect();
            info!(
                domain = %presence.domain_uid(),
                servers = %servers.join(","),
                "Starting rolling restart"
            );
            self.ctx.events.emit(DomainEvent::RollStarting {
                message: format!("Rolling restart of servers {}", servers.join(", ")),
            });
            presence.set_rolling(true);
        }

        let topology = packet.get_arc::<DomainTopology>(keys::DOMAIN_TOPOLOGY);
        let ready = presence.ready_servers();
        let Partition {
            unconstrained,
            clustered,
        } = partition(&self.rolling, &ready);

        let mut children = Vec::with_capacity(clustered.len() + 1);
        if !unconstrained.is_empty() {
            children.push(StepAndPacket::new(
                Arc::new(ServersThatCanRestartNowStep {
                    servers: unconstrained,
                }),
                packet.copy(),
            ));
        }
        for (cluster_name, members) in clustered {
            children.push(StepAndPacket::new(
                Arc::new(RollSpecificClusterStep {
                    cluster_name,
                    queue: Mutex::new(members.into()),
                    topology: topology.clone(),
                    ctx: self.ctx.clone(),
                }),
                packet.copy(),
            ));
        }

        NextAction::fork_join(children, Some(&self.after_roll))
    }

    fn next(&self) -> Option<&StepRef> {
        Some(&self.after_roll)
    }

    fn detail(&self) -> Option<String> {
        Some(format!("{} server(s)", self.rolling.len()))
    }
}

/// Restarts every server at once
struct ServersThatCanRestartNowStep {
    servers: Vec<Member>,
}

impl Step for ServersThatCanRestartNowStep {
    fn apply(self: Arc<Self>, _packet: &mut Packet) -> NextAction {
        let children = self
            .servers
            .iter()
            .map(|(_, member)| member.clone())
            .collect();
        NextAction::fork_join(children, None)
    }

    fn next(&self) -> Option<&StepRef> {
        None
    }

    fn detail(&self) -> Option<String> {
        let names: Vec<&str> = self.servers.iter().map(|(n, _)| n.as_str()).collect();
        Some(names.join(","))
    }
}

/// Wave loop of one cluster; re-applies itself until its queue is empty
struct RollSpecificClusterStep {
    cluster_name: String,
    queue: Mutex<VecDeque<Member>>,
    topology: Option<Arc<DomainTopology>>,
    ctx: Arc<RollingContext>,
}

impl Step for RollSpecificClusterStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        if self.ctx.stopping.is_stopping() {
            debug!(cluster = %self.cluster_name, "Operator stopping, no further restart wave");
            return NextAction::Terminate(FiberError::Cancelled);
        }
        let presence = match presence_of(packet) {
            Ok(presence) => presence,
            Err(e) => return NextAction::Terminate(e),
        };

        let topology = self.topology.as_deref().map(|t| t as &dyn ClusterTopology);
        let ready = presence.ready_servers_in_cluster(&self.cluster_name, topology);
        let min_available = presence.min_available(&self.cluster_name);

        let (wave, remaining) = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let wave = next_wave(&mut queue, &ready, min_available);
            (wave, queue.len())
        };

        let this: StepRef = self.clone();
        if !wave.is_empty() {
            let names: Vec<&str> = wave.iter().map(|(n, _)| n.as_str()).collect();
            info!(
                domain = %presence.domain_uid(),
                cluster = %self.cluster_name,
                servers = %names.join(","),
                ready = ready.len(),
                min_available,
                "Restarting wave"
            );
            let children = wave.into_iter().map(|(_, member)| member).collect();
            NextAction::fork_join(children, Some(&this))
        } else if remaining == 0 {
            debug!(cluster = %self.cluster_name, "Cluster roll finished");
            NextAction::End
        } else {
            debug!(
                cluster = %self.cluster_name,
                ready = ready.len(),
                min_available,
                remaining,
                "No availability slack, waiting"
            );
            NextAction::delay(self.ctx.poll_delay, Some(&this))
        }
    }

    fn next(&self) -> Option<&StepRef> {
        None
    }

    fn detail(&self) -> Option<String> {
        Some(self.cluster_name.clone())
    }
}

struct AfterRollStep {
    ctx: Arc<RollingContext>,
    next: Option<StepRef>,
}

impl Step for AfterRollStep {
    fn apply(self: Arc<Self>, packet: &mut Packet) -> NextAction {
        if packet
            .remove::<bool>(keys::ROLL_START_EVENT_GENERATED)
            .is_some()
        {
            if let Some(presence) = packet.spi::<DomainPresenceInfo>() {
                info!(domain = %presence.domain_uid(), "Rolling restart completed");
                presence.set_rolling(false);
            }
            self.ctx.events.emit(DomainEvent::RollCompleted);
            if let Some(ref metrics) = self.ctx.metrics {
                metrics.record_roll_completed();
            }
        }
        NextAction::next(self.next.as_ref())
    }

    fn next(&self) -> Option<&StepRef> {
        self.next.as_ref()
    }
}

#[cfg(test)]
#[path = "rolling_test.rs"]
mod tests;
