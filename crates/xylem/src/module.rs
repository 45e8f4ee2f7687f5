//! Module declarations and the module trait.

use crate::callback::{CallbackProcess, CallbackReceiver, TaskState};
use crate::pipe::{PipeError, PipeReader};
use crate::port::{InputPort, OutputPort, PortDirection, PortError, PortInfo};
use crate::properties::{ConfigError, Properties, PropertyInfo, PropertySet, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Property key holding a module's display name.
pub const PROPERTY_NAME: &str = "name";

/// Errors a module can raise while processing.
///
/// The engine treats these as opaque: they are delivered to callback
/// receivers and reported as the cause of a failed run.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("processing failed: {0}")]
    Failed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Pipe(#[from] PipeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("module panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Serializable summary of a module, for catalogues and tree views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub category: String,
    pub description: String,
    pub properties: Vec<PropertyInfo>,
    pub inputs: Vec<PortInfo>,
    pub outputs: Vec<PortInfo>,
}

/// State every module carries: identity, configuration, ports and the
/// receivers its task reports to.
///
/// Built once in the module's constructor:
///
/// ```
/// use xylem::{InputPort, ModuleCore, OutputPort, PipeKind};
///
/// let core = ModuleCore::new("Upper Case")
///     .with_category("Text")
///     .with_description("Converts text to upper case.")
///     .property("locale", "en", "Locale used for case mapping.")
///     .input(InputPort::new("input", "Text to convert.").accept(PipeKind::Char))
///     .output(OutputPort::new("output", "Converted text.").accept(PipeKind::Char));
///
/// assert_eq!(core.name(), "Upper Case");
/// assert!(core.input_port("input").is_some());
/// ```
pub struct ModuleCore {
    name: String,
    category: String,
    description: String,
    properties: PropertySet,
    inputs: IndexMap<String, InputPort>,
    outputs: IndexMap<String, OutputPort>,
    receivers: Vec<Arc<dyn CallbackReceiver>>,
    task: Option<Arc<CallbackProcess>>,
}

impl std::fmt::Debug for ModuleCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCore")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("properties", &self.properties.values())
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("receivers", &self.receivers.len())
            .finish()
    }
}

impl ModuleCore {
    /// Create a core; `name` becomes the default of the `name` property.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut properties = PropertySet::new();
        properties.declare_default(PROPERTY_NAME, name.clone(), "Display name of the module.");
        Self {
            name,
            category: String::new(),
            description: String::new(),
            properties,
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            receivers: Vec::new(),
            task: None,
        }
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Declare a property with a default value.
    pub fn property(
        mut self,
        key: impl Into<String>,
        default: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.properties.declare_default(key, default, description);
        self
    }

    /// Declare a property that has no default.
    pub fn required_property(
        mut self,
        key: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.properties.declare(key, description);
        self
    }

    /// Add an input port.
    pub fn input(mut self, port: InputPort) -> Self {
        self.inputs.insert(port.id().to_string(), port);
        self
    }

    /// Add an output port.
    pub fn output(mut self, port: OutputPort) -> Self {
        self.outputs.insert(port.id().to_string(), port);
        self
    }

    /// Take a configuration snapshot. Call after declaring properties.
    pub fn configure(mut self, config: Properties) -> Self {
        self.properties.merge(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertySet {
        &mut self.properties
    }

    /// Set a declared property. Setting `name` renames the module.
    pub fn set_property(&mut self, key: &str, value: impl Into<String>) -> Result<(), ConfigError> {
        let value = value.into();
        self.properties.set(key, value.clone())?;
        if key == PROPERTY_NAME {
            self.name = value;
        }
        Ok(())
    }

    /// Rename the module (updates the `name` property).
    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        // `name` is declared in `new`, so this cannot fail.
        let _ = self.properties.set(PROPERTY_NAME, name.clone());
        self.name = name;
    }

    /// Fill defaults, reject unknown keys and pick up the `name` property.
    pub fn apply(&mut self) -> Result<(), ConfigError> {
        self.properties.apply_defaults();
        self.properties.validate()?;
        if let Some(name) = self.properties.get(PROPERTY_NAME) {
            self.name = name.to_string();
        }
        Ok(())
    }

    pub fn inputs(&self) -> impl Iterator<Item = &InputPort> {
        self.inputs.values()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OutputPort> {
        self.outputs.values()
    }

    pub fn input_port(&self, id: &str) -> Option<&InputPort> {
        self.inputs.get(id)
    }

    pub fn output_port(&self, id: &str) -> Option<&OutputPort> {
        self.outputs.get(id)
    }

    pub fn input_port_mut(&mut self, id: &str) -> Result<&mut InputPort, PortError> {
        self.inputs.get_mut(id).ok_or_else(|| PortError::UnknownPort {
            direction: PortDirection::Input,
            port: id.to_string(),
        })
    }

    pub fn output_port_mut(&mut self, id: &str) -> Result<&mut OutputPort, PortError> {
        self.outputs.get_mut(id).ok_or_else(|| PortError::UnknownPort {
            direction: PortDirection::Output,
            port: id.to_string(),
        })
    }

    /// The consumer end bound to input `id`.
    pub fn reader(&mut self, id: &str) -> Result<&mut PipeReader, PortError> {
        self.input_port_mut(id)?.reader()
    }

    /// Borrow an input's reader and an output port at the same time.
    pub fn split_io(
        &mut self,
        input: &str,
        output: &str,
    ) -> Result<(&mut PipeReader, &mut OutputPort), PortError> {
        let reader = self
            .inputs
            .get_mut(input)
            .ok_or_else(|| PortError::UnknownPort {
                direction: PortDirection::Input,
                port: input.to_string(),
            })?
            .reader()?;
        let port = self
            .outputs
            .get_mut(output)
            .ok_or_else(|| PortError::UnknownPort {
                direction: PortDirection::Output,
                port: output.to_string(),
            })?;
        Ok((reader, port))
    }

    /// Close every output port for writing.
    pub fn close_outputs(&mut self) {
        for port in self.outputs.values_mut() {
            port.close_all();
        }
    }

    /// Release every input pipe; upstream writes to them are dropped.
    pub fn close_inputs(&mut self) {
        for port in self.inputs.values_mut() {
            port.close();
        }
    }

    /// Register a receiver for this module's task.
    pub fn add_callback_receiver(&mut self, receiver: Arc<dyn CallbackReceiver>) {
        self.receivers.push(receiver);
    }

    pub fn callback_receivers(&self) -> &[Arc<dyn CallbackReceiver>] {
        &self.receivers
    }

    pub(crate) fn attach_task(&mut self, task: Arc<CallbackProcess>) {
        self.task = Some(task);
    }

    /// State of this module's task, once a run created one.
    pub fn task_state(&self) -> Option<TaskState> {
        self.task.as_ref().map(|t| t.state())
    }

    /// Send a partial result (`repeat = true`) to every receiver.
    ///
    /// Does nothing unless the module is running inside a task.
    pub fn report_progress(&self, result: impl Into<Value>) -> bool {
        match &self.task {
            Some(task) => task.report(&result.into()),
            None => false,
        }
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: self.name.clone(),
            category: self.category.clone(),
            description: self.description.clone(),
            properties: self.properties.declared(),
            inputs: self.inputs.values().map(InputPort::info).collect(),
            outputs: self.outputs.values().map(OutputPort::info).collect(),
        }
    }
}

/// A unit of computation.
///
/// Implementations keep a [`ModuleCore`] and expose it through `core`.
/// The engine calls [`apply_properties`](Module::apply_properties) before
/// the run and [`process`](Module::process) at most once, on the module's
/// own thread. Output ports are closed by the engine after `process`
/// returns, whatever the outcome.
pub trait Module: Send {
    fn core(&self) -> &ModuleCore;

    fn core_mut(&mut self) -> &mut ModuleCore;

    /// Validate the configuration and cache typed values.
    ///
    /// Overrides should call `self.core_mut().apply()` first.
    fn apply_properties(&mut self) -> Result<(), ConfigError> {
        self.core_mut().apply()
    }

    /// Consume inputs to completion and produce outputs.
    ///
    /// Returns the module's success indicator.
    fn process(&mut self) -> Result<bool, ModuleError>;

    fn name(&self) -> &str {
        self.core().name()
    }
}
