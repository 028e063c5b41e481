//! Network agent that records what the arbiter tells it.

use std::sync::Mutex;

use meridian_common::NetId;
use meridian_core::NetworkAgent;

use crate::test_util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Created(NetId),
    Unwanted(NetId),
    Destroyed(NetId),
    RevalidationRequested(NetId),
}

#[derive(Default)]
pub struct ScriptedAgent {
    events: Mutex<Vec<AgentEvent>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        lock(&self.events).clone()
    }

    pub fn was_unwanted(&self) -> bool {
        lock(&self.events)
            .iter()
            .any(|e| matches!(e, AgentEvent::Unwanted(_)))
    }

    pub fn was_destroyed(&self) -> bool {
        lock(&self.events)
            .iter()
            .any(|e| matches!(e, AgentEvent::Destroyed(_)))
    }

    fn push(&self, event: AgentEvent) {
        lock(&self.events).push(event);
    }
}

impl NetworkAgent for ScriptedAgent {
    fn on_network_created(&self, net: NetId) {
        self.push(AgentEvent::Created(net));
    }

    fn on_network_unwanted(&self, net: NetId) {
        self.push(AgentEvent::Unwanted(net));
    }

    fn on_network_destroyed(&self, net: NetId) {
        self.push(AgentEvent::Destroyed(net));
    }

    fn on_revalidation_requested(&self, net: NetId) {
        self.push(AgentEvent::RevalidationRequested(net));
    }
}
