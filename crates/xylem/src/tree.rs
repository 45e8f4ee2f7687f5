//! Module trees: composition, structural mutation and execution.
//!
//! A [`ModuleTree`] is a rooted tree of modules. Every non-root module has
//! exactly one parent and is connected to it by one [`Pipe`] running from
//! one of the parent's output ports to one of the child's input ports.
//!
//! [`ModuleTree::run_modules`] applies every module's properties, then
//! starts one thread per module. Nothing orders the starts: children simply
//! block on their input pipes until the parent writes or closes. When a
//! module fails, its outputs are closed and its inputs released, so the
//! rest of the tree drains to a terminal state and the first failure is
//! reported.

use crate::callback::{CallbackProcess, CallbackReceiver, TaskInfo, TaskState};
use crate::module::{Module, ModuleError, ModuleInfo};
use crate::pipe::{Pipe, PipeId, PipeKind, PipeReader};
use crate::port::{PortDirection, PortError};
use crate::properties::{ConfigError, Value};
use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Identifier of a node in a [`ModuleTree`]. Never reused within a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The pipe linking a node to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub parent: NodeId,
    /// Output port on the parent.
    pub output: String,
    /// Input port on the child.
    pub input: String,
    pub kind: PipeKind,
    pub pipe: PipeId,
}

/// Structural and execution changes, delivered to [`ModuleTree::subscribe`]rs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    NodeInserted {
        node: NodeId,
        parent: Option<NodeId>,
    },
    NodeRemoved {
        node: NodeId,
    },
    /// A property (including the name) of a node changed.
    NodeChanged {
        node: NodeId,
    },
    /// The whole tree was replaced by [`ModuleTree::start_new_module_tree`].
    TreeReplaced {
        root: NodeId,
    },
    TaskStateChanged {
        node: NodeId,
        state: TaskState,
    },
}

/// Errors from building, editing or running a tree.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("parent {0} is not in the tree")]
    UnknownParent(NodeId),

    #[error("node {0} is not in the tree")]
    UnknownNode(NodeId),

    #[error("tree already has a root ({0})")]
    RootExists(NodeId),

    #[error("no compatible ports between '{parent}' and '{child}'")]
    KindMismatch { parent: String, child: String },

    #[error("module '{module}' has no {direction} port '{port}'")]
    UnknownPort {
        module: String,
        direction: PortDirection,
        port: String,
    },

    #[error("tree has already been executed")]
    AlreadyExecuted,

    #[error("invalid configuration for '{module}' ({node}): {source}")]
    Config {
        node: NodeId,
        module: String,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("module '{module}' ({node}) failed: {source}")]
    ExecutionFailed {
        node: NodeId,
        module: String,
        #[source]
        source: ModuleError,
    },
}

/// How one module finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleOutcome {
    pub node: NodeId,
    pub module: String,
    /// The value `process` returned.
    pub success: bool,
}

/// Summary of a run in which no module failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// One entry per module, in tree order.
    pub outcomes: Vec<ModuleOutcome>,
    pub duration: Duration,
}

impl RunReport {
    /// True if every module returned `Ok(true)`.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }

    /// Modules that returned `Ok(false)`.
    pub fn unsuccessful(&self) -> impl Iterator<Item = &ModuleOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Read-only view of one node and its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub module: ModuleInfo,
    pub connection: Option<Connection>,
    pub state: Option<TaskState>,
    pub children: Vec<NodeSnapshot>,
}

/// Read-only view of a whole tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub root: Option<NodeSnapshot>,
    pub executed: bool,
}

impl TreeSnapshot {
    /// Number of nodes in the snapshot.
    pub fn len(&self) -> usize {
        fn count(node: &NodeSnapshot) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        self.root.as_ref().map(count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn find(&self, id: NodeId) -> Option<&NodeSnapshot> {
        fn search(node: &NodeSnapshot, id: NodeId) -> Option<&NodeSnapshot> {
            if node.id == id {
                return Some(node);
            }
            node.children.iter().find_map(|c| search(c, id))
        }
        self.root.as_ref().and_then(|r| search(r, id))
    }
}

struct Node {
    module: Box<dyn Module>,
    connection: Option<Connection>,
    children: Vec<NodeId>,
    task: Option<Arc<CallbackProcess>>,
}

#[derive(Debug, Default)]
struct EventBus {
    subscribers: Mutex<Vec<Sender<TreeEvent>>>,
}

impl EventBus {
    fn subscribe(&self) -> Receiver<TreeEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, event: TreeEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        // Dropped receivers unsubscribe.
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// The tree's own receiver: remembers which task failed first.
#[derive(Debug, Default)]
struct RunCollector {
    first_failure: OnceLock<NodeId>,
    completed: AtomicUsize,
}

impl CallbackReceiver for RunCollector {
    fn receive_callback(&self, _result: &Value, _source: &TaskInfo, repeat: bool) {
        if !repeat {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn receive_exception(&self, source: &TaskInfo, _error: &ModuleError) {
        let _ = self.first_failure.set(source.node);
    }
}

/// A rooted tree of modules wired parent-output to child-input.
///
/// Pipes are unbounded unless a capacity is set with
/// [`with_pipe_capacity`](Self::with_pipe_capacity). Unbounded pipes never
/// block writers, so a producer much faster than its consumer grows memory
/// without limit; bounded pipes block the producer instead.
#[derive(Default)]
pub struct ModuleTree {
    nodes: IndexMap<NodeId, Node>,
    root: Option<NodeId>,
    next_id: u32,
    executed: bool,
    pipe_capacity: Option<usize>,
    receivers: Vec<Arc<dyn CallbackReceiver>>,
    events: EventBus,
}

impl fmt::Debug for ModuleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<_> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.module.name().to_string()))
            .collect();
        f.debug_struct("ModuleTree")
            .field("root", &self.root)
            .field("nodes", &nodes)
            .field("executed", &self.executed)
            .field("pipe_capacity", &self.pipe_capacity)
            .finish()
    }
}

impl ModuleTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use bounded pipes holding at most `capacity` chunks.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = Some(capacity.max(1));
        self
    }

    pub fn set_pipe_capacity(&mut self, capacity: Option<usize>) {
        self.pipe_capacity = capacity.map(|c| c.max(1));
    }

    pub fn pipe_capacity(&self) -> Option<usize> {
        self.pipe_capacity
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn ensure_editable(&self) -> Result<(), TreeError> {
        if self.executed {
            Err(TreeError::AlreadyExecuted)
        } else {
            Ok(())
        }
    }

    /// Discard the current tree and start a new one rooted at `root`.
    ///
    /// Subscribers and tree-wide receivers are kept.
    pub fn start_new_module_tree(&mut self, root: Box<dyn Module>) -> NodeId {
        self.nodes.clear();
        self.root = None;
        self.executed = false;
        let id = self.insert_root(root);
        debug!(root = %id, "started new module tree");
        self.events.emit(TreeEvent::TreeReplaced { root: id });
        id
    }

    /// Make `module` the root of an empty tree.
    pub fn set_root(&mut self, module: Box<dyn Module>) -> Result<NodeId, TreeError> {
        self.ensure_editable()?;
        if let Some(root) = self.root {
            return Err(TreeError::RootExists(root));
        }
        let id = self.insert_root(module);
        self.events.emit(TreeEvent::NodeInserted {
            node: id,
            parent: None,
        });
        Ok(id)
    }

    fn insert_root(&mut self, module: Box<dyn Module>) -> NodeId {
        let id = self.allocate_id();
        self.nodes.insert(
            id,
            Node {
                module,
                connection: None,
                children: Vec::new(),
                task: None,
            },
        );
        self.root = Some(id);
        id
    }

    /// Add `module` as a child of `parent`, wiring the first compatible
    /// (output, input) port pair.
    ///
    /// On error the tree is unchanged and `module` is dropped.
    pub fn add_module(&mut self, module: Box<dyn Module>, parent: NodeId) -> Result<NodeId, TreeError> {
        self.ensure_editable()?;
        let parent_module = self
            .nodes
            .get(&parent)
            .map(|n| n.module.as_ref())
            .ok_or(TreeError::UnknownParent(parent))?;

        let (output, input, kind) =
            compatible_ports(parent_module, module.as_ref()).ok_or_else(|| TreeError::KindMismatch {
                parent: parent_module.name().to_string(),
                child: module.name().to_string(),
            })?;
        self.attach(module, parent, output, input, kind)
    }

    /// Add `module` as a child of `parent` through the named ports.
    pub fn add_module_via(
        &mut self,
        module: Box<dyn Module>,
        parent: NodeId,
        output: &str,
        input: &str,
    ) -> Result<NodeId, TreeError> {
        self.ensure_editable()?;
        let parent_module = self
            .nodes
            .get(&parent)
            .map(|n| n.module.as_ref())
            .ok_or(TreeError::UnknownParent(parent))?;

        let out_port = parent_module
            .core()
            .output_port(output)
            .ok_or_else(|| TreeError::UnknownPort {
                module: parent_module.name().to_string(),
                direction: PortDirection::Output,
                port: output.to_string(),
            })?;
        let in_port = module
            .core()
            .input_port(input)
            .ok_or_else(|| TreeError::UnknownPort {
                module: module.name().to_string(),
                direction: PortDirection::Input,
                port: input.to_string(),
            })?;
        let kind = out_port
            .accepts()
            .iter()
            .copied()
            .find(|k| in_port.accepts_kind(*k))
            .ok_or_else(|| TreeError::KindMismatch {
                parent: parent_module.name().to_string(),
                child: module.name().to_string(),
            })?;
        self.attach(module, parent, output.to_string(), input.to_string(), kind)
    }

    fn attach(
        &mut self,
        mut module: Box<dyn Module>,
        parent: NodeId,
        output: String,
        input: String,
        kind: PipeKind,
    ) -> Result<NodeId, TreeError> {
        let (writer, reader) = Pipe::with_capacity(kind, self.pipe_capacity).split();
        let pipe = writer.id();
        module.core_mut().input_port_mut(&input)?.bind(reader)?;

        let id = NodeId(self.next_id);
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(TreeError::UnknownParent(parent))?;
        parent_node
            .module
            .core_mut()
            .output_port_mut(&output)?
            .bind(writer)?;
        parent_node.children.push(id);
        self.next_id += 1;

        debug!(
            parent = %parent,
            child = %id,
            output = %output,
            input = %input,
            kind = %kind,
            pipe = %pipe,
            "wired module"
        );
        self.nodes.insert(
            id,
            Node {
                module,
                connection: Some(Connection {
                    parent,
                    output,
                    input,
                    kind,
                    pipe,
                }),
                children: Vec::new(),
                task: None,
            },
        );
        self.events.emit(TreeEvent::NodeInserted {
            node: id,
            parent: Some(parent),
        });
        Ok(id)
    }

    /// Remove `node` and its whole subtree. Returns the removed ids,
    /// `node` first.
    pub fn remove_module(&mut self, node: NodeId) -> Result<Vec<NodeId>, TreeError> {
        self.ensure_editable()?;
        if !self.nodes.contains_key(&node) {
            return Err(TreeError::UnknownNode(node));
        }

        let removed = self.depth_first_from(node);
        let connection = self.nodes.get(&node).and_then(|n| n.connection.clone());
        if let Some(conn) = connection
            && let Some(parent) = self.nodes.get_mut(&conn.parent)
        {
            parent.children.retain(|c| *c != node);
            if let Ok(port) = parent.module.core_mut().output_port_mut(&conn.output) {
                port.unbind(conn.pipe);
            }
        }
        if self.root == Some(node) {
            self.root = None;
        }
        for id in &removed {
            self.nodes.shift_remove(id);
            self.events.emit(TreeEvent::NodeRemoved { node: *id });
        }
        debug!(node = %node, count = removed.len(), "removed subtree");
        Ok(removed)
    }

    /// Set a property on a node's module.
    pub fn set_property(&mut self, node: NodeId, key: &str, value: impl Into<String>) -> Result<(), TreeError> {
        self.ensure_editable()?;
        let entry = self.nodes.get_mut(&node).ok_or(TreeError::UnknownNode(node))?;
        entry
            .module
            .core_mut()
            .set_property(key, value)
            .map_err(|source| TreeError::Config {
                node,
                module: entry.module.name().to_string(),
                source,
            })?;
        self.events.emit(TreeEvent::NodeChanged { node });
        Ok(())
    }

    pub fn rename_module(&mut self, node: NodeId, name: impl Into<String>) -> Result<(), TreeError> {
        self.ensure_editable()?;
        let entry = self.nodes.get_mut(&node).ok_or(TreeError::UnknownNode(node))?;
        entry.module.core_mut().set_name(name);
        self.events.emit(TreeEvent::NodeChanged { node });
        Ok(())
    }

    /// Attach an observer pipe to an output port of `node`.
    ///
    /// The returned reader sees everything the port writes once the tree
    /// runs. With bounded pipes it must be drained concurrently with
    /// [`run_modules`](Self::run_modules), or the writer blocks.
    pub fn tap(&mut self, node: NodeId, output: &str, kind: PipeKind) -> Result<PipeReader, TreeError> {
        self.ensure_editable()?;
        let entry = self.nodes.get_mut(&node).ok_or(TreeError::UnknownNode(node))?;
        let name = entry.module.name().to_string();
        let port = entry
            .module
            .core_mut()
            .output_port_mut(output)
            .map_err(|_| TreeError::UnknownPort {
                module: name,
                direction: PortDirection::Output,
                port: output.to_string(),
            })?;
        let (writer, reader) = Pipe::with_capacity(kind, self.pipe_capacity).split();
        port.bind(writer)?;
        Ok(reader)
    }

    /// Receive every [`TreeEvent`] emitted from now on.
    pub fn subscribe(&self) -> Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Register a receiver that hears from every module's task.
    pub fn add_callback_receiver(&mut self, receiver: Arc<dyn CallbackReceiver>) {
        self.receivers.push(receiver);
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(&node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.connection(node).map(|c| c.parent)
    }

    pub fn connection(&self, node: NodeId) -> Option<&Connection> {
        self.nodes.get(&node).and_then(|n| n.connection.as_ref())
    }

    pub fn module(&self, node: NodeId) -> Option<&dyn Module> {
        self.nodes.get(&node).map(|n| n.module.as_ref())
    }

    pub fn module_mut(&mut self, node: NodeId) -> Option<&mut dyn Module> {
        let entry = self.nodes.get_mut(&node)?;
        Some(entry.module.as_mut())
    }

    /// First node, in depth-first order, whose module is called `name`.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.depth_first()
            .into_iter()
            .find(|id| self.module(*id).is_some_and(|m| m.name() == name))
    }

    /// Task state of `node`; `None` before the tree runs.
    pub fn task_state(&self, node: NodeId) -> Option<TaskState> {
        self.nodes
            .get(&node)
            .and_then(|n| n.task.as_ref())
            .map(|t| t.state())
    }

    /// Node ids in depth-first pre-order from the root.
    pub fn depth_first(&self) -> Vec<NodeId> {
        match self.root {
            Some(root) => self.depth_first_from(root),
            None => Vec::new(),
        }
    }

    fn depth_first_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        order
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root: self.root.and_then(|r| self.snapshot_node(r)),
            executed: self.executed,
        }
    }

    fn snapshot_node(&self, id: NodeId) -> Option<NodeSnapshot> {
        let node = self.nodes.get(&id)?;
        Some(NodeSnapshot {
            id,
            module: node.module.core().info(),
            connection: node.connection.clone(),
            state: node.task.as_ref().map(|t| t.state()),
            children: node
                .children
                .iter()
                .filter_map(|c| self.snapshot_node(*c))
                .collect(),
        })
    }

    /// Run every module to completion, one thread each.
    ///
    /// Properties are applied first; a configuration error aborts before
    /// any module starts. Otherwise returns once every task is terminal,
    /// with the first failure observed or a report of all outcomes.
    pub fn run_modules(&mut self) -> Result<RunReport, TreeError> {
        self.ensure_editable()?;

        for (id, node) in self.nodes.iter_mut() {
            node.module
                .apply_properties()
                .map_err(|source| TreeError::Config {
                    node: *id,
                    module: node.module.name().to_string(),
                    source,
                })?;
        }
        self.executed = true;

        let collector = Arc::new(RunCollector::default());
        for (id, node) in self.nodes.iter_mut() {
            let mut receivers: Vec<Arc<dyn CallbackReceiver>> = Vec::new();
            receivers.push(collector.clone());
            receivers.extend(self.receivers.iter().cloned());
            receivers.extend(node.module.core().callback_receivers().iter().cloned());
            let task = Arc::new(CallbackProcess::new(
                TaskInfo {
                    node: *id,
                    module: node.module.name().to_string(),
                },
                receivers,
            ));
            node.module.core_mut().attach_task(Arc::clone(&task));
            node.task = Some(task);
        }

        let start = Instant::now();
        info!(modules = self.nodes.len(), "running module tree");

        let events = &self.events;
        let nodes = &mut self.nodes;
        let results: Vec<(NodeId, String, Result<bool, ModuleError>)> = thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .iter_mut()
                .filter_map(|(id, node)| {
                    let task = node.task.clone()?;
                    let id = *id;
                    let name = node.module.name().to_string();
                    let module = node.module.as_mut();
                    let handle = scope.spawn(move || run_task(id, module, &task, events));
                    Some((id, name, handle))
                })
                .collect();

            handles
                .into_iter()
                .map(|(id, name, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))));
                    (id, name, result)
                })
                .collect()
        });

        let duration = start.elapsed();
        let mut outcomes = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (node, module, result) in results {
            match result {
                Ok(success) => outcomes.push(ModuleOutcome { node, module, success }),
                Err(source) => failures.push((node, module, source)),
            }
        }

        if !failures.is_empty() {
            let first = collector.first_failure.get().copied();
            let index = failures
                .iter()
                .position(|(node, _, _)| Some(*node) == first)
                .unwrap_or(0);
            let (node, module, source) = failures.swap_remove(index);
            warn!(
                node = %node,
                module = %module,
                failed = failures.len() + 1,
                elapsed = ?duration,
                "module tree failed"
            );
            return Err(TreeError::ExecutionFailed { node, module, source });
        }

        info!(
            modules = outcomes.len(),
            completed = collector.completed.load(Ordering::Relaxed),
            elapsed = ?duration,
            "module tree finished"
        );
        Ok(RunReport { outcomes, duration })
    }
}

/// First (output, input, kind) triple that can connect `parent` to `child`.
fn compatible_ports(parent: &dyn Module, child: &dyn Module) -> Option<(String, String, PipeKind)> {
    for output in parent.core().outputs() {
        for input in child.core().inputs().filter(|i| !i.is_bound()) {
            if let Some(kind) = output.accepts().iter().copied().find(|k| input.accepts_kind(*k)) {
                return Some((output.id().to_string(), input.id().to_string(), kind));
            }
        }
    }
    None
}

/// Drive one module through its task lifecycle.
fn run_task(
    node: NodeId,
    module: &mut dyn Module,
    task: &CallbackProcess,
    events: &EventBus,
) -> Result<bool, ModuleError> {
    task.start();
    events.emit(TreeEvent::TaskStateChanged {
        node,
        state: TaskState::Running,
    });
    debug!(node = %node, module = module.name(), "module started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| module.process()));

    // Downstream sees end-of-stream and upstream stops feeding us, whatever happened.
    let core = module.core_mut();
    core.close_outputs();
    core.close_inputs();

    let result = outcome.unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))));
    match &result {
        Ok(success) => {
            if *success {
                debug!(node = %node, module = module.name(), "module completed");
            } else {
                warn!(node = %node, module = module.name(), "module reported no success");
            }
            task.complete(Value::Bool(*success));
            events.emit(TreeEvent::TaskStateChanged {
                node,
                state: TaskState::Completed,
            });
        }
        Err(error) => {
            warn!(node = %node, module = module.name(), error = %error, "module failed");
            task.fail(error);
            events.emit(TreeEvent::TaskStateChanged {
                node,
                state: TaskState::Failed,
            });
        }
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackEvent, CallbackRecorder};
    use crate::module::ModuleCore;
    use crate::port::{InputPort, OutputPort};
    use crate::properties::Properties;

    struct Source {
        core: ModuleCore,
        chunks: Vec<String>,
    }

    impl Source {
        fn new(chunks: &[&str]) -> Box<Self> {
            Box::new(Self {
                core: ModuleCore::new("Source")
                    .output(OutputPort::new("output", "Text.").accept(PipeKind::Char)),
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
            })
        }
    }

    impl Module for Source {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn process(&mut self) -> Result<bool, ModuleError> {
            let output = self.core.output_port_mut("output")?;
            for chunk in &self.chunks {
                output.write_text(chunk)?;
            }
            Ok(true)
        }
    }

    struct ByteSource {
        core: ModuleCore,
    }

    impl Module for ByteSource {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn process(&mut self) -> Result<bool, ModuleError> {
            self.core.output_port_mut("output")?.write_bytes(&[0, 1, 2])?;
            Ok(true)
        }
    }

    fn byte_source() -> Box<ByteSource> {
        Box::new(ByteSource {
            core: ModuleCore::new("Bytes")
                .output(OutputPort::new("output", "Raw bytes.").accept(PipeKind::Byte)),
        })
    }

    struct Passthrough {
        core: ModuleCore,
    }

    impl Module for Passthrough {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn process(&mut self) -> Result<bool, ModuleError> {
            let (reader, output) = self.core.split_io("input", "output")?;
            while let Some(chunk) = reader.read() {
                output.write(&chunk)?;
            }
            Ok(true)
        }
    }

    fn passthrough(name: &str) -> Box<Passthrough> {
        Box::new(Passthrough {
            core: ModuleCore::new(name)
                .property("mode", "copy", "Copy mode.")
                .input(InputPort::new("input", "Anything.").accept(PipeKind::Char))
                .output(OutputPort::new("output", "Same data.").accept(PipeKind::Char)),
        })
    }

    /// Reads its input to a shared string, then returns `result`.
    struct Collect {
        core: ModuleCore,
        sink: Arc<Mutex<String>>,
        result: bool,
    }

    impl Module for Collect {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn process(&mut self) -> Result<bool, ModuleError> {
            let text = self.core.reader("input")?.read_to_string()?;
            self.sink.lock().unwrap().push_str(&text);
            Ok(self.result)
        }
    }

    fn collect(name: &str) -> (Box<Collect>, Arc<Mutex<String>>) {
        let sink = Arc::new(Mutex::new(String::new()));
        let module = Box::new(Collect {
            core: ModuleCore::new(name)
                .input(InputPort::new("input", "Text.").accept(PipeKind::Char)),
            sink: Arc::clone(&sink),
            result: true,
        });
        (module, sink)
    }

    /// Writes some output, then fails or panics.
    struct Failing {
        core: ModuleCore,
        panic: bool,
    }

    impl Module for Failing {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn process(&mut self) -> Result<bool, ModuleError> {
            self.core.output_port_mut("output")?.write_text("partial")?;
            if self.panic {
                panic!("module blew up");
            }
            Err(ModuleError::Failed("bad row".into()))
        }
    }

    fn failing(panic: bool) -> Box<Failing> {
        Box::new(Failing {
            core: ModuleCore::new("Failing")
                .input(InputPort::new("input", "Ignored.").accept(PipeKind::Char))
                .output(OutputPort::new("output", "Partial text.").accept(PipeKind::Char)),
            panic,
        })
    }

    fn drain_events(rx: &Receiver<TreeEvent>) -> Vec<TreeEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_passthrough_delivers_stream() {
        let mut tree = ModuleTree::new();
        let r = tree.start_new_module_tree(Source::new(&["a,b\n", "c,d\n"]));
        let c = tree.add_module(passthrough("C"), r).unwrap();
        let mut out = tree.tap(c, "output", PipeKind::Char).unwrap();

        let report = tree.run_modules().unwrap();
        assert!(report.all_succeeded());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(out.read_to_string().unwrap(), "a,b\nc,d\n");
        assert_eq!(tree.task_state(r), Some(TaskState::Completed));
        assert_eq!(tree.task_state(c), Some(TaskState::Completed));
    }

    #[test]
    fn test_add_module_unknown_parent() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        let events = tree.subscribe();
        let before = tree.snapshot();

        let err = tree.add_module(passthrough("C"), NodeId::new(99)).unwrap_err();
        assert!(matches!(err, TreeError::UnknownParent(id) if id == NodeId::new(99)));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.snapshot(), before);
        assert!(tree.children(root).is_empty());
        assert!(drain_events(&events).is_empty());
    }

    #[test]
    fn test_kind_mismatch_leaves_tree_unchanged() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(byte_source());
        let err = tree.add_module(passthrough("Text only"), root).unwrap_err();
        assert!(matches!(err, TreeError::KindMismatch { .. }));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.module(root).unwrap().core().output_port("output").unwrap().pipe_count(), 0);
    }

    #[test]
    fn test_add_module_via_named_ports() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));

        let err = tree
            .add_module_via(passthrough("C"), root, "missing", "input")
            .unwrap_err();
        assert!(matches!(
            err,
            TreeError::UnknownPort {
                direction: PortDirection::Output,
                ..
            }
        ));

        let child = tree.add_module_via(passthrough("C"), root, "output", "input").unwrap();
        let conn = tree.connection(child).unwrap();
        assert_eq!(conn.parent, root);
        assert_eq!(conn.output, "output");
        assert_eq!(conn.kind, PipeKind::Char);
        assert_eq!(tree.parent(child), Some(root));
    }

    #[test]
    fn test_failure_drains_tree_and_reports_once() {
        let recorder = Arc::new(CallbackRecorder::new());
        let mut tree = ModuleTree::new();
        tree.add_callback_receiver(recorder.clone());

        let root = tree.start_new_module_tree(Source::new(&["1\n", "2\n", "3\n"]));
        let m = tree.add_module(failing(false), root).unwrap();
        let (downstream, seen) = collect("Downstream");
        let d = tree.add_module(downstream, m).unwrap();
        let (sibling, sibling_seen) = collect("Sibling");
        let s = tree.add_module(sibling, root).unwrap();

        let err = tree.run_modules().unwrap_err();
        match err {
            TreeError::ExecutionFailed { node, module, source } => {
                assert_eq!(node, m);
                assert_eq!(module, "Failing");
                assert!(matches!(source, ModuleError::Failed(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(*seen.lock().unwrap(), "partial");
        assert_eq!(*sibling_seen.lock().unwrap(), "1\n2\n3\n");
        assert_eq!(recorder.exception_count(), 1);
        for node in [root, m, d, s] {
            assert!(tree.task_state(node).unwrap().is_terminal());
            assert_eq!(recorder.terminal_count(node), 1);
        }
        assert_eq!(tree.task_state(m), Some(TaskState::Failed));
        assert_eq!(tree.task_state(d), Some(TaskState::Completed));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        let m = tree.add_module(failing(true), root).unwrap();
        let (downstream, seen) = collect("Downstream");
        tree.add_module(downstream, m).unwrap();

        let err = tree.run_modules().unwrap_err();
        assert!(matches!(
            err,
            TreeError::ExecutionFailed {
                source: ModuleError::Panicked(ref msg),
                ..
            } if msg == "module blew up"
        ));
        assert_eq!(*seen.lock().unwrap(), "partial");
    }

    #[test]
    fn test_false_result_is_not_failure() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        let (mut sink, _) = collect("Sink");
        sink.result = false;
        let s = tree.add_module(sink, root).unwrap();

        let report = tree.run_modules().unwrap();
        assert!(!report.all_succeeded());
        let unsuccessful: Vec<_> = report.unsuccessful().map(|o| o.node).collect();
        assert_eq!(unsuccessful, vec![s]);
        assert_eq!(tree.task_state(s), Some(TaskState::Completed));
    }

    #[test]
    fn test_fan_out_to_children() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["one ", "two ", "three"]));
        let (a, seen_a) = collect("A");
        let (b, seen_b) = collect("B");
        tree.add_module(a, root).unwrap();
        tree.add_module(b, root).unwrap();
        assert_eq!(tree.module(root).unwrap().core().output_port("output").unwrap().pipe_count(), 2);

        tree.run_modules().unwrap();
        assert_eq!(*seen_a.lock().unwrap(), "one two three");
        assert_eq!(*seen_b.lock().unwrap(), "one two three");
    }

    #[test]
    fn test_bounded_pipes_do_not_deadlock() {
        let chunks: Vec<String> = (0..200).map(|i| format!("{i}\n")).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let expected: String = chunks.concat();

        let mut tree = ModuleTree::new().with_pipe_capacity(1);
        let root = tree.start_new_module_tree(Source::new(&refs));
        let p = tree.add_module(passthrough("P"), root).unwrap();
        let (sink, seen) = collect("Sink");
        tree.add_module(sink, p).unwrap();

        tree.run_modules().unwrap();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[test]
    fn test_config_error_stops_before_start() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        let p = tree.add_module(passthrough("P"), root).unwrap();
        tree.module_mut(p)
            .unwrap()
            .core_mut()
            .properties_mut()
            .merge(Properties::from([("bogus".to_string(), "1".to_string())]));

        let err = tree.run_modules().unwrap_err();
        assert!(matches!(
            err,
            TreeError::Config {
                source: ConfigError::UnknownProperty(_),
                ..
            }
        ));
        assert_eq!(tree.task_state(root), None);
        assert!(!tree.is_executed());
    }

    #[test]
    fn test_mutation_after_run_rejected() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        tree.run_modules().unwrap();

        assert!(matches!(
            tree.add_module(passthrough("Late"), root),
            Err(TreeError::AlreadyExecuted)
        ));
        assert!(matches!(tree.run_modules(), Err(TreeError::AlreadyExecuted)));
        assert!(matches!(
            tree.set_property(root, "name", "x"),
            Err(TreeError::AlreadyExecuted)
        ));

        tree.start_new_module_tree(Source::new(&["y"]));
        assert!(!tree.is_executed());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_property_edits() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        let p = tree.add_module(passthrough("P"), root).unwrap();
        let events = tree.subscribe();

        tree.set_property(p, "mode", "move").unwrap();
        tree.rename_module(p, "Copier").unwrap();
        assert!(matches!(
            tree.set_property(p, "colour", "red"),
            Err(TreeError::Config {
                source: ConfigError::UnknownProperty(_),
                ..
            })
        ));
        assert!(matches!(
            tree.set_property(NodeId::new(42), "mode", "x"),
            Err(TreeError::UnknownNode(_))
        ));

        let module = tree.module(p).unwrap();
        assert_eq!(module.name(), "Copier");
        assert_eq!(module.core().properties().value("mode"), Some("move"));
        assert_eq!(
            drain_events(&events),
            vec![TreeEvent::NodeChanged { node: p }, TreeEvent::NodeChanged { node: p }]
        );
    }

    #[test]
    fn test_remove_subtree() {
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        let p = tree.add_module(passthrough("P"), root).unwrap();
        let (sink, _) = collect("Sink");
        let s = tree.add_module(sink, p).unwrap();
        let (other, other_seen) = collect("Other");
        let o = tree.add_module(other, root).unwrap();
        let events = tree.subscribe();

        let removed = tree.remove_module(p).unwrap();
        assert_eq!(removed, vec![p, s]);
        assert_eq!(tree.children(root), &[o]);
        assert!(!tree.contains(s));
        assert_eq!(tree.module(root).unwrap().core().output_port("output").unwrap().pipe_count(), 1);
        assert_eq!(
            drain_events(&events),
            vec![TreeEvent::NodeRemoved { node: p }, TreeEvent::NodeRemoved { node: s }]
        );

        tree.run_modules().unwrap();
        assert_eq!(*other_seen.lock().unwrap(), "x");
    }

    #[test]
    fn test_events_during_build_and_run() {
        let mut tree = ModuleTree::new();
        let events = tree.subscribe();
        let root = tree.start_new_module_tree(Source::new(&["x"]));
        let (sink, _) = collect("Sink");
        let s = tree.add_module(sink, root).unwrap();

        assert_eq!(
            drain_events(&events),
            vec![
                TreeEvent::TreeReplaced { root },
                TreeEvent::NodeInserted {
                    node: s,
                    parent: Some(root)
                },
            ]
        );

        tree.run_modules().unwrap();
        let states: Vec<_> = drain_events(&events)
            .into_iter()
            .filter_map(|e| match e {
                TreeEvent::TaskStateChanged { node, state } if node == s => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![TaskState::Running, TaskState::Completed]);
    }

    #[test]
    fn test_set_root_and_snapshot() {
        let mut tree = ModuleTree::new();
        assert!(tree.snapshot().is_empty());
        let root = tree.set_root(Source::new(&["x"])).unwrap();
        assert!(matches!(
            tree.set_root(Source::new(&["y"])),
            Err(TreeError::RootExists(id)) if id == root
        ));
        let p = tree.add_module(passthrough("P"), root).unwrap();

        let snapshot = tree.snapshot();
        assert_eq!(snapshot.len(), 2);
        let node = snapshot.find(p).unwrap();
        assert_eq!(node.module.name, "P");
        assert_eq!(node.connection.as_ref().unwrap().parent, root);
        assert_eq!(node.state, None);
        assert_eq!(tree.depth_first(), vec![root, p]);
        assert_eq!(tree.find("P"), Some(p));
        assert_eq!(tree.find("Q"), None);
    }

    #[test]
    fn test_module_receivers_hear_progress() {
        struct Chatty {
            core: ModuleCore,
        }
        impl Module for Chatty {
            fn core(&self) -> &ModuleCore {
                &self.core
            }
            fn core_mut(&mut self) -> &mut ModuleCore {
                &mut self.core
            }
            fn process(&mut self) -> Result<bool, ModuleError> {
                self.core.report_progress(0.5);
                Ok(true)
            }
        }

        let recorder = Arc::new(CallbackRecorder::new());
        let mut core = ModuleCore::new("Chatty");
        core.add_callback_receiver(recorder.clone());
        let mut tree = ModuleTree::new();
        let root = tree.start_new_module_tree(Box::new(Chatty { core }));
        tree.run_modules().unwrap();

        let events = recorder.events_for(root);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            CallbackEvent::Result {
                result: Value::Float(f),
                repeat: true,
                ..
            } if (*f - 0.5).abs() < f64::EPSILON
        ));
        assert!(events[1].is_terminal());
    }
}
