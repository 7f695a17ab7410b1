//! In-memory runtime for tests
//!
//! Processes never exit on their own; tests crash them explicitly with
//! [`MockRuntime::crash`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::manager::{ContainerRuntime, SpawnError, UnitProcess};
use crate::units::ServiceSpec;

type ExitSlot = Arc<Mutex<Option<i32>>>;
type CommandLog = Arc<RwLock<Vec<String>>>;

pub struct MockRuntime {
    next_pid: AtomicU32,
    /// Exit slot of the latest process launched for each unit
    exits: RwLock<HashMap<String, ExitSlot>>,
    commands: CommandLog,
    fail_on: RwLock<Option<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            exits: RwLock::new(HashMap::new()),
            commands: Arc::new(RwLock::new(Vec::new())),
            fail_on: RwLock::new(None),
        }
    }

    /// Make the current process of `name` exit with `code`
    pub fn crash(&self, name: &str, code: i32) {
        if let Some(slot) = self.exits.read().unwrap().get(name) {
            *slot.lock().unwrap() = Some(code);
        }
    }

    /// Fail every launch of `name` until cleared with `None`
    pub fn set_fail_on(&self, name: Option<&str>) {
        *self.fail_on.write().unwrap() = name.map(str::to_string);
    }

    /// Operations seen so far, e.g. `launch auto-rsa`, `stop auto-rsa`
    pub fn commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn launches(&self, name: &str) -> usize {
        let needle = format!("launch {}", name);
        self.commands().iter().filter(|c| **c == needle).count()
    }

    fn record(&self, command: String) {
        self.commands.write().unwrap().push(command);
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn launch(&self, spec: &ServiceSpec) -> Result<Box<dyn UnitProcess>, SpawnError> {
        if self.fail_on.read().unwrap().as_deref() == Some(spec.name.as_str()) {
            self.record(format!("fail {}", spec.name));
            return Err(SpawnError::Runtime(format!("launch of {} refused", spec.name)));
        }

        let slot: ExitSlot = Arc::new(Mutex::new(None));
        self.exits
            .write()
            .unwrap()
            .insert(spec.name.clone(), Arc::clone(&slot));
        self.record(format!("launch {}", spec.name));

        Ok(Box::new(MockProcess {
            name: spec.name.clone(),
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit: slot,
            commands: Arc::clone(&self.commands),
        }))
    }

    async fn prune(&self, old: &ServiceSpec) -> Result<(), SpawnError> {
        self.record(format!(
            "prune {} {}",
            old.name,
            old.image.as_deref().unwrap_or("-")
        ));
        Ok(())
    }
}

struct MockProcess {
    name: String,
    pid: u32,
    exit: ExitSlot,
    commands: CommandLog,
}

#[async_trait]
impl UnitProcess for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(*self.exit.lock().unwrap())
    }

    async fn terminate(&mut self, _timeout: Duration) -> std::io::Result<i32> {
        self.commands
            .write()
            .unwrap()
            .push(format!("stop {}", self.name));
        let mut exit = self.exit.lock().unwrap();
        Ok(*exit.get_or_insert(143))
    }
}
