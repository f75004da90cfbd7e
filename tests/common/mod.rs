//! Shared fixtures for the integration suites: a recording mock
//! transport and a scripted workflow.

// each test binary uses a different subset of these fixtures
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use praxis::chrono::{Duration, Utc};
use praxis::mdm::{
    response_to_plist, Enqueuer, GenericCommand, GenericResponse, PushEnqueuer, RawEnqueuer,
};
use praxis::workflow::{
    Config, ContextMarshaler, Event, EventFlag, MdmContext, StepEnqueuer, StepResult, StepStart,
    StringContext, Workflow,
};
use praxis::BoxError;

/// Transport double recording every enqueue and push.
pub struct MockEnqueuer {
    multi: bool,
    pub enqueues: Mutex<Vec<(Vec<String>, Vec<u8>)>>,
    pub pushes: Mutex<Vec<Vec<String>>>,
}

impl MockEnqueuer {
    pub fn new(multi: bool) -> Self {
        Self {
            multi,
            enqueues: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue_count(&self) -> usize {
        self.enqueues.lock().unwrap().len()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }
}

#[async_trait]
impl RawEnqueuer for MockEnqueuer {
    async fn enqueue(&self, ids: &[String], raw_command: &[u8]) -> Result<(), BoxError> {
        self.enqueues
            .lock()
            .unwrap()
            .push((ids.to_vec(), raw_command.to_vec()));
        Ok(())
    }
}

impl Enqueuer for MockEnqueuer {
    fn supports_multi_commands(&self) -> bool {
        self.multi
    }
}

#[async_trait]
impl PushEnqueuer for MockEnqueuer {
    async fn push(&self, ids: &[String]) -> Result<(), BoxError> {
        self.pushes.lock().unwrap().push(ids.to_vec());
        Ok(())
    }
}

/// A recorded workflow start.
pub struct RecordedStart {
    pub ids: Vec<String>,
    pub event: Option<EventFlag>,
    pub context: Option<String>,
}

/// A recorded step completion or timeout.
pub struct RecordedResult {
    pub id: String,
    pub step_name: String,
    /// (command uuid, status) per result.
    pub results: Vec<(String, String)>,
}

/// Scripted workflow: enqueues a configured set of commands on start and
/// records every callback.
pub struct TestWorkflow {
    name: String,
    config: Option<Config>,
    // (uuid, request type) enqueued per start
    commands: Vec<(String, String)>,
    delay: Option<Duration>,
    timeout: Option<Duration>,
    enqueuer: Mutex<Option<Arc<dyn StepEnqueuer>>>,
    pub starts: Mutex<Vec<RecordedStart>>,
    pub completions: Mutex<Vec<RecordedResult>>,
    pub timeouts: Mutex<Vec<RecordedResult>>,
    pub events: Mutex<Vec<(EventFlag, String)>>,
}

impl TestWorkflow {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: None,
            commands: Vec::new(),
            delay: None,
            timeout: None,
            enqueuer: Mutex::new(None),
            starts: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_command(mut self, uuid: &str, request_type: &str) -> Self {
        self.commands.push((uuid.to_string(), request_type.to_string()));
        self
    }

    /// Enqueue the start step delayed by `delay` relative to start time
    /// (negative means already due).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Enqueue the start step with a timeout offset relative to start
    /// time (negative means already timed out).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wires the engine in as this workflow's step enqueuer.
    pub fn set_enqueuer(&self, enqueuer: Arc<dyn StepEnqueuer>) {
        *self.enqueuer.lock().unwrap() = Some(enqueuer);
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn completion_count(&self) -> usize {
        self.completions.lock().unwrap().len()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn record_result(step: &StepResult) -> RecordedResult {
        RecordedResult {
            id: step.id.clone(),
            step_name: step.step_name.clone(),
            results: step
                .command_results
                .iter()
                .map(|r| (r.command_uuid().to_string(), r.status().to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl Workflow for TestWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> Option<Config> {
        self.config.clone()
    }

    fn new_context_value(&self, _step_name: &str) -> Option<Box<dyn ContextMarshaler>> {
        Some(Box::new(StringContext::default()))
    }

    async fn start(&self, step: StepStart) -> Result<(), BoxError> {
        self.starts.lock().unwrap().push(RecordedStart {
            ids: step.ids.clone(),
            event: step.event.as_ref().map(|e| e.flag),
            context: step
                .context
                .as_ref()
                .and_then(|c| c.as_any().downcast_ref::<StringContext>())
                .map(|c| c.0.clone()),
        });

        if self.commands.is_empty() {
            return Ok(());
        }

        let enqueuer = self
            .enqueuer
            .lock()
            .unwrap()
            .clone()
            .expect("enqueuer not wired");

        let mut enqueueing = step.new_step_enqueueing();
        enqueueing.step_name = "main".to_string();
        for (uuid, request_type) in &self.commands {
            enqueueing
                .commands
                .push(Box::new(GenericCommand::new(uuid.clone(), request_type.clone())));
        }
        let now = Utc::now();
        enqueueing.not_until = self.delay.map(|d| now + d);
        enqueueing.timeout = self.timeout.map(|t| now + t);

        enqueuer.enqueue_step(&self.name, enqueueing).await?;
        Ok(())
    }

    async fn step_completed(&self, step: StepResult) -> Result<(), BoxError> {
        self.completions.lock().unwrap().push(Self::record_result(&step));
        Ok(())
    }

    async fn step_timeout(&self, step: StepResult) -> Result<(), BoxError> {
        self.timeouts.lock().unwrap().push(Self::record_result(&step));
        Ok(())
    }

    async fn event(&self, event: &Event, id: &str, _mdm: &MdmContext) -> Result<(), BoxError> {
        self.events.lock().unwrap().push((event.flag, id.to_string()));
        Ok(())
    }
}

/// A raw acknowledgement plist for a command uuid.
pub fn ack(uuid: &str, status: &str) -> Vec<u8> {
    response_to_plist(&GenericResponse {
        command_uuid: uuid.to_string(),
        status: status.to_string(),
        ..Default::default()
    })
    .unwrap()
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
