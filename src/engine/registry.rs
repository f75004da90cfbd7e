//! Workflow registry.
//!
//! A process-wide (per engine) mapping of workflow names to
//! implementations, plus two inverted indexes maintained on register and
//! unregister: event flag to subscribed workflows (from
//! [`Config::events`]) and request type to workflows wanting every command
//! response of that type
//! ([`Config::all_command_response_request_types`]).
//!
//! Guarded by a readers-writer lock; lookups clone the `Arc`s out and
//! never hold the lock across workflow calls.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::workflow::{Config, EventFlag, Workflow};

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, Arc<dyn Workflow>>,
    // request type -> workflow names
    all_resps: HashMap<String, Vec<String>>,
    // single event flag bits -> workflow names
    events: HashMap<u32, Vec<String>>,
}

impl Inner {
    fn index(&mut self, name: &str, config: Option<&Config>) {
        let Some(config) = config else {
            return;
        };
        for req_type in &config.all_command_response_request_types {
            let names = self.all_resps.entry(req_type.clone()).or_default();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        for flag in config.events.iter() {
            let names = self.events.entry(flag.bits()).or_default();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    fn unindex(&mut self, name: &str) {
        for names in self.all_resps.values_mut() {
            names.retain(|n| n != name);
        }
        for names in self.events.values_mut() {
            names.retain(|n| n != name);
        }
    }
}

/// Registry of workflows by name with event and response-type indexes.
#[derive(Default)]
pub struct WorkflowRegistry {
    inner: RwLock<Inner>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates the workflow with the registry by name. Re-registering
    /// a name atomically replaces the previous workflow.
    pub fn register(&self, workflow: Arc<dyn Workflow>) {
        let name = workflow.name().to_string();
        let config = workflow.config();
        let mut inner = self.inner.write().expect("workflow registry poisoned");
        if inner.workflows.contains_key(&name) {
            inner.unindex(&name);
        }
        inner.index(&name, config.as_ref());
        inner.workflows.insert(name.clone(), workflow);
        debug!(name, "registered workflow");
    }

    /// Dissociates the named workflow. Unregistering a name not present
    /// is logged and otherwise ignored.
    pub fn unregister(&self, name: &str) {
        let mut inner = self.inner.write().expect("workflow registry poisoned");
        if inner.workflows.remove(name).is_some() {
            inner.unindex(name);
            debug!(name, "unregistered workflow");
        } else {
            info!(name, "unregistered workflow: name not found");
        }
    }

    /// The registered workflow by name.
    pub fn workflow(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        let inner = self.inner.read().expect("workflow registry poisoned");
        inner.workflows.get(name).cloned()
    }

    /// Whether the workflow name is registered.
    pub fn registered(&self, name: &str) -> bool {
        let inner = self.inner.read().expect("workflow registry poisoned");
        inner.workflows.contains_key(name)
    }

    /// Workflows subscribed to every command response of a request type.
    pub fn all_response_workflows(&self, request_type: &str) -> Vec<Arc<dyn Workflow>> {
        let inner = self.inner.read().expect("workflow registry poisoned");
        inner
            .all_resps
            .get(request_type)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| inner.workflows.get(n).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Workflows whose config subscribes to the event flag.
    pub fn event_workflows(&self, flag: EventFlag) -> Vec<Arc<dyn Workflow>> {
        let inner = self.inner.read().expect("workflow registry poisoned");
        inner
            .events
            .get(&flag.bits())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| inner.workflows.get(n).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}
