//! Workflow definitions: serializable module trees.
//!
//! A workflow names a root module and, recursively, its children:
//!
//! ```yaml
//! name: distances
//! root:
//!   module: source.file
//!   options: { path: table.csv }
//!   children:
//!     - module: analysis.minkowski-distance-matrix
//!       options: { order: 1 }
//!       children:
//!         - module: sink.stdout
//! ```
//!
//! Each child is wired to its parent through the first compatible port
//! pair unless `output`/`input` name the ports explicitly.

use crate::module::{Module, PROPERTY_NAME};
use crate::properties::{Properties, Value};
use crate::registry::{ModuleRegistry, RegistryError};
use crate::tree::{ModuleTree, NodeId, TreeError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A workflow definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Bounded pipe capacity in chunks; unbounded if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_capacity: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Step>,
}

/// One module in the workflow tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Registry id of the module type.
    pub module: String,

    /// Display name (sets the `name` property).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Parent output port to read from (defaults to the first compatible).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Own input port to bind (defaults to the first compatible).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    /// Property values for this module.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub options: IndexMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Step>,
}

impl Step {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: None,
            output: None,
            input: None,
            options: IndexMap::new(),
            children: Vec::new(),
        }
    }

    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set a property value.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Wire through explicit ports.
    pub fn via(mut self, output: impl Into<String>, input: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self.input = Some(input.into());
        self
    }

    /// Add a child step.
    pub fn child(mut self, step: Step) -> Self {
        self.children.push(step);
        self
    }

    /// Options rendered as a configuration snapshot.
    pub fn properties(&self) -> Properties {
        let mut props: Properties = self
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.to_property_string()))
            .collect();
        if let Some(name) = &self.name {
            props.insert(PROPERTY_NAME.to_string(), name.clone());
        }
        props
    }

    /// Number of steps in this subtree.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Step::count).sum::<usize>()
    }
}

impl Workflow {
    /// Create a new empty workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root step.
    pub fn root(mut self, step: Step) -> Self {
        self.root = Some(step);
        self
    }

    /// Use bounded pipes.
    pub fn pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = Some(capacity);
        self
    }

    /// Check if this workflow has anything to run.
    pub fn is_complete(&self) -> bool {
        self.root.is_some()
    }

    /// Every step, depth first.
    pub fn steps(&self) -> Vec<&Step> {
        fn walk<'a>(step: &'a Step, out: &mut Vec<&'a Step>) {
            out.push(step);
            for child in &step.children {
                walk(child, out);
            }
        }
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            walk(root, &mut out);
        }
        out
    }

    /// Instantiate every step through `registry` and wire the tree.
    ///
    /// Option keys are checked against each module's declared properties;
    /// values are validated when the tree runs.
    pub fn build(&self, registry: &ModuleRegistry) -> Result<ModuleTree, WorkflowError> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| WorkflowError::Incomplete("workflow has no root module".into()))?;

        let mut tree = ModuleTree::new();
        tree.set_pipe_capacity(self.pipe_capacity);
        let module = instantiate(root, registry)?;
        let id = tree.start_new_module_tree(module);
        for child in &root.children {
            add_step(&mut tree, registry, child, id)?;
        }
        Ok(tree)
    }

    /// Parse workflow from bytes, auto-detecting format.
    pub fn from_bytes(data: &[u8], path: Option<&str>) -> Result<Self, WorkflowError> {
        let format = path.and_then(detect_format).unwrap_or("yaml");
        Self::from_bytes_format(data, format)
    }

    /// Parse workflow from bytes with explicit format.
    pub fn from_bytes_format(data: &[u8], format: &str) -> Result<Self, WorkflowError> {
        match format {
            "json" => serde_json::from_slice(data).map_err(|e| WorkflowError::Parse(e.to_string())),
            "yaml" | "yml" => {
                serde_yaml::from_slice(data).map_err(|e| WorkflowError::Parse(e.to_string()))
            }
            "toml" => {
                let s = std::str::from_utf8(data)
                    .map_err(|e| WorkflowError::Parse(format!("Invalid UTF-8: {}", e)))?;
                toml::from_str(s).map_err(|e| WorkflowError::Parse(e.to_string()))
            }
            _ => Err(WorkflowError::UnsupportedFormat(format.to_string())),
        }
    }

    /// Serialize workflow to bytes.
    pub fn to_bytes(&self, format: &str) -> Result<Vec<u8>, WorkflowError> {
        match format {
            "json" => {
                serde_json::to_vec_pretty(self).map_err(|e| WorkflowError::Serialize(e.to_string()))
            }
            "yaml" | "yml" => serde_yaml::to_string(self)
                .map(|s| s.into_bytes())
                .map_err(|e| WorkflowError::Serialize(e.to_string())),
            "toml" => toml::to_string_pretty(self)
                .map(|s| s.into_bytes())
                .map_err(|e| WorkflowError::Serialize(e.to_string())),
            _ => Err(WorkflowError::UnsupportedFormat(format.to_string())),
        }
    }
}

fn instantiate(step: &Step, registry: &ModuleRegistry) -> Result<Box<dyn Module>, WorkflowError> {
    let mut module = registry.create(&step.module, step.properties())?;
    if let Some(name) = &step.name {
        module.core_mut().set_name(name.clone());
    }
    if let Some(key) = step
        .options
        .keys()
        .find(|k| !module.core().properties().is_declared(k))
    {
        return Err(WorkflowError::UnknownOption {
            module: step.module.clone(),
            key: key.clone(),
        });
    }
    Ok(module)
}

fn add_step(
    tree: &mut ModuleTree,
    registry: &ModuleRegistry,
    step: &Step,
    parent: NodeId,
) -> Result<(), WorkflowError> {
    let module = instantiate(step, registry)?;
    let id = if step.output.is_none() && step.input.is_none() {
        tree.add_module(module, parent)?
    } else {
        let output = match &step.output {
            Some(port) => port.clone(),
            None => first_port(tree, parent)
                .ok_or_else(|| WorkflowError::Incomplete(format!("parent of '{}' has no output port", step.module)))?,
        };
        let input = match &step.input {
            Some(port) => port.clone(),
            None => module
                .core()
                .inputs()
                .next()
                .map(|p| p.id().to_string())
                .ok_or_else(|| WorkflowError::Incomplete(format!("'{}' has no input port", step.module)))?,
        };
        tree.add_module_via(module, parent, &output, &input)?
    };
    for child in &step.children {
        add_step(tree, registry, child, id)?;
    }
    Ok(())
}

fn first_port(tree: &ModuleTree, node: NodeId) -> Option<String> {
    let module = tree.module(node)?;
    module.core().outputs().next().map(|p| p.id().to_string())
}

/// Errors related to workflow parsing and building.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to parse workflow: {0}")]
    Parse(String),

    #[error("failed to serialize workflow: {0}")]
    Serialize(String),

    #[error("unsupported workflow format: {0}")]
    UnsupportedFormat(String),

    #[error("incomplete workflow: {0}")]
    Incomplete(String),

    #[error("module '{module}' has no property '{key}'")]
    UnknownOption { module: String, key: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Detect workflow format from file path extension.
pub fn detect_format(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    match ext.to_lowercase().as_str() {
        "json" => Some("json"),
        "yaml" | "yml" => Some("yaml"),
        "toml" => Some("toml"),
        _ => None,
    }
}
