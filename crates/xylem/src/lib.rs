//! Xylem: concurrent module pipelines.
//!
//! Modules are units of computation with named, typed ports. A
//! [`ModuleTree`] wires each child's input to its parent's output through a
//! [`Pipe`] and runs every module on its own thread, streaming data down
//! the tree and reporting completion or failure through
//! [`CallbackReceiver`]s.

mod callback;
mod module;
mod pipe;
mod port;
mod properties;
mod registry;
mod tree;
mod workflow;

pub use callback::{
    CallbackEvent, CallbackProcess, CallbackReceiver, CallbackRecorder, TaskInfo, TaskState,
};
pub use module::{Module, ModuleCore, ModuleError, ModuleInfo, PROPERTY_NAME};
pub use pipe::{Chunk, Pipe, PipeError, PipeId, PipeKind, PipeReader, PipeState, PipeWriter};
pub use port::{InputPort, OutputPort, PortDirection, PortError, PortInfo};
pub use properties::{
    ConfigError, Properties, PropertiesExt, PropertyInfo, PropertySet, Value,
};
pub use registry::{ModuleDecl, ModuleFactory, ModuleRegistry, RegistryError};
pub use tree::{
    Connection, ModuleOutcome, ModuleTree, NodeId, NodeSnapshot, RunReport, TreeError, TreeEvent,
    TreeSnapshot,
};
pub use workflow::{Step, Workflow, WorkflowError, detect_format};
