//! Administrative start/stop control of named components.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ControlError;

/// A component that can be paused and resumed at runtime.
pub trait Lifecycle: Send + Sync {
    /// Name the component is addressed by.
    fn name(&self) -> &str;

    /// Resume accepting work. Idempotent.
    fn start(&self);

    /// Stop accepting new work. Idempotent; work already accepted completes.
    fn stop(&self);

    /// Whether the component currently accepts work.
    fn is_running(&self) -> bool;
}

/// Registry routing control commands to named components.
///
/// Besides the typed [`start`](ControlBus::start) and
/// [`stop`](ControlBus::stop) calls, it accepts textual commands of the
/// form `@<name>.start()`, `@<name>.stop()` and `@<name>.isRunning()`.
///
/// # Examples
///
/// ```
/// use message_aggregator::{ChannelSink, ControlBus, MessageAggregator};
///
/// let (sink, _rx) = ChannelSink::new();
/// let aggregator = MessageAggregator::builder()
///     .name("orders")
///     .sink(sink)
///     .build()
///     .unwrap();
///
/// let mut bus = ControlBus::new();
/// bus.register(aggregator.clone());
///
/// assert!(!bus.execute("@orders.stop()").unwrap());
/// assert!(!aggregator.is_running());
/// assert!(bus.execute("@orders.start()").unwrap());
/// ```
#[derive(Default)]
pub struct ControlBus {
    components: BTreeMap<String, Arc<dyn Lifecycle>>,
}

impl ControlBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `component` under its [`Lifecycle::name`], replacing any
    /// component previously registered under the same name.
    pub fn register(&mut self, component: impl Lifecycle + 'static) {
        let component: Arc<dyn Lifecycle> = Arc::new(component);
        self.components
            .insert(component.name().to_owned(), component);
    }

    /// Names of every registered component, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    fn component(&self, name: &str) -> Result<&Arc<dyn Lifecycle>, ControlError> {
        self.components
            .get(name)
            .ok_or_else(|| ControlError::UnknownComponent(name.to_owned()))
    }

    /// Start the named component.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownComponent`] if nothing is registered
    /// under `name`.
    pub fn start(&self, name: &str) -> Result<(), ControlError> {
        self.component(name)?.start();
        tracing::info!(component = name, "component started");
        Ok(())
    }

    /// Stop the named component.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownComponent`] if nothing is registered
    /// under `name`.
    pub fn stop(&self, name: &str) -> Result<(), ControlError> {
        self.component(name)?.stop();
        tracing::info!(component = name, "component stopped");
        Ok(())
    }

    /// Whether the named component is running.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::UnknownComponent`] if nothing is registered
    /// under `name`.
    pub fn is_running(&self, name: &str) -> Result<bool, ControlError> {
        Ok(self.component(name)?.is_running())
    }

    /// Run a textual command and return the component's running state
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidCommand`] if `command` is not of the
    /// form `@<name>.<start|stop|isRunning>()`, and
    /// [`ControlError::UnknownComponent`] if the name is not registered.
    pub fn execute(&self, command: &str) -> Result<bool, ControlError> {
        let invalid = || ControlError::InvalidCommand(command.to_owned());
        let (name, operation) = command
            .trim()
            .strip_prefix('@')
            .and_then(|rest| rest.strip_suffix("()"))
            .and_then(|call| call.rsplit_once('.'))
            .ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        match operation {
            "start" => self.start(name)?,
            "stop" => self.stop(name)?,
            "isRunning" => {}
            _ => return Err(invalid()),
        }
        self.is_running(name)
    }
}

impl std::fmt::Debug for ControlBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBus")
            .field("components", &self.components.keys().collect::<Vec<_>>())
            .finish()
    }
}
