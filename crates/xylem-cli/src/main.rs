//! Xylem CLI - build and run module trees from workflow files

mod config;
mod errors;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use config::Config;
use indicatif::{ProgressBar, ProgressStyle};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use xylem::{
    CallbackEvent, CallbackReceiver, CallbackRecorder, ModuleError, ModuleRegistry, ModuleTree,
    NodeSnapshot, PortInfo, RegistryError, TaskInfo, TreeError, Value, Workflow, WorkflowError,
};

/// Output verbosity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    fn info(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }

    fn debug(self, msg: &str) {
        if matches!(self, Verbosity::Verbose) {
            println!("[debug] {msg}");
        }
    }

    fn result(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }

    /// Status lines for `run`, kept off stdout so sinks can own it.
    fn status(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            eprintln!("{msg}");
        }
    }

    /// Default log filter when `RUST_LOG` is unset.
    fn log_filter(self, configured: Option<&str>) -> String {
        match self {
            Verbosity::Quiet => "error".into(),
            Verbosity::Verbose => configured.unwrap_or("debug").into(),
            Verbosity::Normal => configured.unwrap_or("warn").into(),
        }
    }
}

/// A `--set node.key=value` property override.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Assignment {
    node: String,
    key: String,
    value: String,
}

/// Parse `--set` arguments. Property keys never contain dots, so the node
/// name is everything before the last dot.
fn parse_assignment(s: &str) -> Result<Assignment, String> {
    let (target, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NODE.KEY=VALUE, got '{s}'"))?;
    let (node, key) = target
        .rsplit_once('.')
        .ok_or_else(|| format!("expected NODE.KEY before '=', got '{target}'"))?;
    if node.is_empty() || key.is_empty() {
        return Err(format!("empty node or key in '{s}'"));
    }
    Ok(Assignment {
        node: node.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Parser)]
#[command(name = "xylem")]
#[command(about = "Concurrent module pipelines", long_about = None)]
struct Cli {
    /// Verbose output (show debug info)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to config file (default: ~/.config/xylem/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available modules
    List,

    /// Show a module's ports and properties
    Describe {
        /// Module type id (e.g. source.file)
        module: String,
        /// Print the declaration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the module tree a workflow builds
    Show {
        /// Workflow file (YAML, TOML, or JSON)
        workflow: PathBuf,
        /// Print the tree snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a workflow file
    Run {
        /// Workflow file (YAML, TOML, or JSON)
        workflow: PathBuf,
        /// Override a property: NODE.KEY=VALUE (NODE is the module name)
        #[arg(long = "set", value_name = "NODE.KEY=VALUE", value_parser = parse_assignment)]
        set: Vec<Assignment>,
        /// Apply a preset to every module of its type
        #[arg(long)]
        preset: Vec<String>,
        /// Bound every pipe to N chunks (default: unbounded)
        #[arg(long, value_name = "N")]
        pipe_capacity: Option<NonZeroUsize>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Generate man page
    Manpage,

    /// List available presets
    Presets,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config file
    let config = if let Some(ref path) = cli.config {
        Config::load_from_path(Some(path.clone()))
    } else {
        Config::load()
    };

    // Apply config defaults, CLI flags override
    let verbose = cli.verbose || config.defaults.verbose;
    let quiet = cli.quiet || config.defaults.quiet;
    let verbosity = Verbosity::from_flags(verbose, quiet);

    init_logging(verbosity, config.defaults.log_level.as_deref());

    let mut registry = ModuleRegistry::new();
    xylem_modules::register_all(&mut registry);

    match cli.command {
        Commands::List => cmd_list(&registry, verbosity),
        Commands::Describe { module, json } => cmd_describe(&registry, &module, json),
        Commands::Show { workflow, json } => cmd_show(&registry, &workflow, json, verbosity),
        Commands::Run {
            workflow,
            set,
            preset,
            pipe_capacity,
        } => {
            let opts = RunOptions {
                set,
                presets: preset,
                pipe_capacity: pipe_capacity.map(NonZeroUsize::get),
            };
            cmd_run(&registry, &config, &workflow, opts, verbosity)
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "xylem", &mut std::io::stdout());
            Ok(())
        }
        Commands::Manpage => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            man.render(&mut std::io::stdout())?;
            Ok(())
        }
        Commands::Presets => cmd_presets(&config, verbosity),
    }
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence.
fn init_logging(verbosity: Verbosity, configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.log_filter(configured)));

    // A second init (e.g. in tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn cmd_list(registry: &ModuleRegistry, v: Verbosity) -> Result<()> {
    v.info("Available modules:\n");

    for (category, decls) in registry.by_category() {
        v.info(category);
        for decl in decls {
            v.info(&format!("  {:<36} {}", decl.id, decl.info.description));
            v.debug(&format!("    inputs:  {}", port_list(&decl.info.inputs)));
            v.debug(&format!("    outputs: {}", port_list(&decl.info.outputs)));
        }
        v.info("");
    }

    v.info(&format!("Total: {} modules", registry.len()));
    Ok(())
}

fn port_list(ports: &[PortInfo]) -> String {
    if ports.is_empty() {
        return "-".into();
    }
    ports
        .iter()
        .map(|p| format!("{} ({})", p.id, kinds(p)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn kinds(port: &PortInfo) -> String {
    port.accepts
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

fn cmd_describe(registry: &ModuleRegistry, id: &str, json: bool) -> Result<()> {
    let Some(decl) = registry.get_decl(id) else {
        bail!("{}", errors::unknown_module_error(id, registry));
    };

    if json {
        println!("{}", serde_json::to_string_pretty(decl)?);
        return Ok(());
    }

    let info = &decl.info;
    println!("{} ({})", decl.id, info.name);
    println!("  category: {}", info.category);
    if !info.description.is_empty() {
        println!("  {}", info.description);
    }

    println!("\nInputs:");
    if info.inputs.is_empty() {
        println!("  (none)");
    }
    for port in &info.inputs {
        println!("  {:<12} [{}] {}", port.id, kinds(port), port.description);
    }

    println!("\nOutputs:");
    if info.outputs.is_empty() {
        println!("  (none)");
    }
    for port in &info.outputs {
        println!("  {:<12} [{}] {}", port.id, kinds(port), port.description);
    }

    println!("\nProperties:");
    for prop in &info.properties {
        let default = match prop.default.as_deref() {
            Some(d) => format!("default: {d:?}"),
            None => "required".into(),
        };
        println!("  {:<24} {} ({})", format!("\"{}\"", prop.key), prop.description, default);
    }

    Ok(())
}

/// Read and parse a workflow file, with friendly errors.
fn load_workflow(path: &Path) -> Result<Workflow> {
    let display = path.to_string_lossy();
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!(errors::file_read_error(&display, &e)))?;
    Workflow::from_bytes(&data, Some(&*display))
        .with_context(|| format!("Failed to parse workflow '{}'", display))
}

/// Build the tree, turning unknown module ids into suggestions.
fn build_tree(registry: &ModuleRegistry, workflow: &Workflow) -> Result<ModuleTree> {
    match workflow.build(registry) {
        Ok(tree) => Ok(tree),
        Err(WorkflowError::Registry(RegistryError::UnknownModule(id))) => {
            bail!("{}", errors::unknown_module_error(&id, registry))
        }
        Err(e) => Err(e).context("Failed to build module tree"),
    }
}

fn cmd_show(registry: &ModuleRegistry, path: &Path, json: bool, v: Verbosity) -> Result<()> {
    let workflow = load_workflow(path)?;
    let tree = build_tree(registry, &workflow)?;
    let snapshot = tree.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    if let Some(ref name) = workflow.name {
        v.info(&format!("Workflow: {}", name));
    }
    if let Some(ref description) = workflow.description {
        v.info(&format!("  {}", description));
    }
    match tree.pipe_capacity() {
        Some(n) => v.debug(&format!("pipe capacity: {} chunks", n)),
        None => v.debug("pipe capacity: unbounded"),
    }

    if let Some(ref root) = snapshot.root {
        let mut lines = Vec::new();
        render_node(root, "", true, true, v, &mut lines);
        for line in lines {
            println!("{line}");
        }
    }

    v.result(&format!("\n{} modules", snapshot.len()));
    Ok(())
}

fn render_node(
    node: &NodeSnapshot,
    prefix: &str,
    last: bool,
    root: bool,
    v: Verbosity,
    out: &mut Vec<String>,
) {
    let (branch, indent) = match (root, last) {
        (true, _) => ("", ""),
        (false, true) => ("└── ", "    "),
        (false, false) => ("├── ", "│   "),
    };

    let link = node
        .connection
        .as_ref()
        .map(|c| format!("  ({} -> {}, {})", c.output, c.input, c.kind))
        .unwrap_or_default();
    out.push(format!(
        "{prefix}{branch}{} [{}]{link}",
        node.module.name, node.module.category
    ));

    let child_prefix = format!("{prefix}{indent}");
    if matches!(v, Verbosity::Verbose) {
        for prop in &node.module.properties {
            if prop.key == xylem::PROPERTY_NAME {
                continue;
            }
            if let Some(ref value) = prop.value {
                out.push(format!("{child_prefix}    · {} = {:?}", prop.key, value));
            }
        }
    }

    for (i, child) in node.children.iter().enumerate() {
        let last = i + 1 == node.children.len();
        render_node(child, &child_prefix, last, false, v, out);
    }
}

struct RunOptions {
    set: Vec<Assignment>,
    presets: Vec<String>,
    /// From `--pipe-capacity`.
    pipe_capacity: Option<usize>,
}

/// Advances a progress bar as module tasks report.
struct ProgressReceiver {
    bar: ProgressBar,
}

impl CallbackReceiver for ProgressReceiver {
    fn receive_callback(&self, result: &Value, source: &TaskInfo, repeat: bool) {
        if repeat {
            self.bar
                .set_message(format!("{}: {}", source.module, result.to_property_string()));
        } else {
            self.bar.inc(1);
            self.bar.set_message(format!("{} done", source.module));
        }
    }

    fn receive_exception(&self, source: &TaskInfo, error: &ModuleError) {
        self.bar.inc(1);
        self.bar.println(format!("{} failed: {}", source.module, error));
    }
}

fn cmd_run(
    registry: &ModuleRegistry,
    config: &Config,
    path: &Path,
    opts: RunOptions,
    v: Verbosity,
) -> Result<()> {
    let mut workflow = load_workflow(path)?;

    for name in &opts.presets {
        let preset = config
            .get_preset(name)
            .with_context(|| format!("Unknown preset '{}'. Run `xylem presets` to list them.", name))?;
        let touched = preset.apply(&mut workflow);
        if touched == 0 {
            v.status(&format!(
                "Warning: preset '{}' matches no '{}' module",
                name, preset.module
            ));
        }
        v.debug(&format!("preset {} applied to {} module(s)", name, touched));
    }

    // Flag beats workflow, config only fills a gap in the workflow.
    if opts.pipe_capacity.is_some() {
        workflow.pipe_capacity = opts.pipe_capacity;
    } else if workflow.pipe_capacity.is_none() {
        workflow.pipe_capacity = config.defaults.pipe_capacity;
    }

    let mut tree = build_tree(registry, &workflow)?;

    for assignment in &opts.set {
        let Some(node) = tree.find(&assignment.node) else {
            bail!("{}", errors::unknown_node_error(&assignment.node, &tree));
        };
        tree.set_property(node, &assignment.key, assignment.value.clone())
            .with_context(|| {
                format!(
                    "Cannot set '{}' on '{}'",
                    assignment.key, assignment.node
                )
            })?;
        v.debug(&format!(
            "set {}.{} = {:?}",
            assignment.node, assignment.key, assignment.value
        ));
    }

    let recorder = Arc::new(CallbackRecorder::new());
    tree.add_callback_receiver(recorder.clone());

    let bar = if matches!(v, Verbosity::Quiet) {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(tree.len() as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar
    };
    tree.add_callback_receiver(Arc::new(ProgressReceiver { bar: bar.clone() }));

    v.status(&format!(
        "Running workflow: {} ({} modules)",
        path.display(),
        tree.len()
    ));

    let result = tree.run_modules();
    bar.finish_and_clear();

    print_summary(&recorder, v);

    match result {
        Ok(report) => {
            let unsuccessful: Vec<_> = report.unsuccessful().map(|o| o.module.as_str()).collect();
            if unsuccessful.is_empty() {
                v.status(&format!("Completed in {:?}", report.duration));
            } else {
                v.status(&format!(
                    "Completed in {:?}, unsuccessful: {}",
                    report.duration,
                    unsuccessful.join(", ")
                ));
            }
            Ok(())
        }
        Err(e @ TreeError::ExecutionFailed { .. }) => Err(e).context("Workflow failed"),
        Err(e) => Err(e).context("Workflow could not start"),
    }
}

fn print_summary(recorder: &CallbackRecorder, v: Verbosity) {
    let events: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(CallbackEvent::is_terminal)
        .collect();
    if events.is_empty() {
        return;
    }

    v.status("");
    for event in events {
        match event {
            CallbackEvent::Result { source, result, .. } => {
                let result = match result {
                    Value::Bool(true) => "ok".to_string(),
                    Value::Bool(false) => "unsuccessful".to_string(),
                    other => other.to_property_string(),
                };
                v.status(&format!("  {:<28} {}", source.module, result));
            }
            CallbackEvent::Exception { source, error } => {
                v.status(&format!("  {:<28} FAILED: {}", source.module, error));
            }
        }
    }
    v.status("");
}

/// List available presets.
fn cmd_presets(config: &Config, v: Verbosity) -> Result<()> {
    v.info("Built-in presets:\n");

    for (name, desc) in config::list_presets() {
        v.info(&format!("  {:<12} {}", name, desc));
    }

    if !config.presets.is_empty() {
        v.info("\nUser-defined presets:\n");
        for (name, preset) in &config.presets {
            v.info(&format!("  {:<12} {}: {}", name, preset.module, preset.summary()));
            if let Some(ref description) = preset.description {
                v.debug(&format!("{:<14} {}", "", description));
            }
        }
    }

    if let Some(path) = Config::default_path() {
        v.info(&format!("\nConfig file: {}", path.display()));
    }

    Ok(())
}
