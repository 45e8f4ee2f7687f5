//! Configuration file and presets support.

use indexmap::IndexMap;
use serde::Deserialize;
use std::path::PathBuf;
use xylem::{Step, Value, Workflow};

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default CLI options.
    pub defaults: Defaults,
    /// User-defined presets.
    #[serde(default)]
    pub presets: IndexMap<String, Preset>,
}

/// Default CLI options.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Enable verbose output by default.
    pub verbose: bool,
    /// Enable quiet output by default.
    pub quiet: bool,
    /// Log filter used when `RUST_LOG` is unset (e.g. "warn", "xylem=debug").
    pub log_level: Option<String>,
    /// Pipe capacity for workflows that don't set one.
    pub pipe_capacity: Option<usize>,
}

// ============================================================================
// Preset
// ============================================================================

/// A bundle of property values for one module type.
///
/// ```toml
/// [presets.semicolons]
/// module = "analysis.minkowski-distance-matrix"
/// description = "Semicolon-separated tables"
/// options = { "input delimiter regex" = ";" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Preset {
    /// Registry id of the module type the preset applies to.
    pub module: String,
    pub description: Option<String>,
    pub options: IndexMap<String, Value>,
}

impl Preset {
    fn builtin(module: &str, description: &str, options: &[(&str, Value)]) -> Self {
        Preset {
            module: module.into(),
            description: Some(description.into()),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    /// Fill in preset options on every matching step.
    ///
    /// Options the step sets itself win. Returns the number of steps touched.
    pub fn apply(&self, workflow: &mut Workflow) -> usize {
        fn visit(step: &mut Step, preset: &Preset) -> usize {
            let mut touched = 0;
            if step.module == preset.module {
                for (key, value) in &preset.options {
                    step.options
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                touched += 1;
            }
            for child in &mut step.children {
                touched += visit(child, preset);
            }
            touched
        }

        workflow
            .root
            .as_mut()
            .map(|root| visit(root, self))
            .unwrap_or(0)
    }

    /// One-line summary of the options, for listings.
    pub fn summary(&self) -> String {
        if self.options.is_empty() {
            return "(empty)".into();
        }
        self.options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.to_property_string()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Config {
    /// Load config from the default location (~/.config/xylem/config.toml).
    pub fn load() -> Self {
        Self::load_from_path(Self::default_path())
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("xylem").join("config.toml"))
    }

    /// Get a preset by name (user-defined or built-in).
    pub fn get_preset(&self, name: &str) -> Option<Preset> {
        if let Some(preset) = self.presets.get(name) {
            return Some(preset.clone());
        }

        builtin_preset(name)
    }
}

const MINKOWSKI: &str = "analysis.minkowski-distance-matrix";

/// Built-in presets.
fn builtin_preset(name: &str) -> Option<Preset> {
    match name {
        "manhattan" => Some(Preset::builtin(
            MINKOWSKI,
            "Order 1 distances",
            &[("order", Value::Int(1))],
        )),
        "euclidean" => Some(Preset::builtin(
            MINKOWSKI,
            "Order 2 distances",
            &[("order", Value::Int(2))],
        )),
        "tsv" => Some(Preset::builtin(
            MINKOWSKI,
            "Tab-separated input tables",
            &[("input delimiter regex", Value::from("\t"))],
        )),
        "append" | "log" => Some(Preset::builtin(
            "sink.file",
            "Append to the output file",
            &[("append", Value::Bool(true))],
        )),
        "bytes" => Some(Preset::builtin(
            "source.file",
            "Read files as raw bytes",
            &[("mode", Value::from("bytes"))],
        )),
        _ => None,
    }
}

/// Built-in preset names with descriptions.
pub fn list_presets() -> Vec<(&'static str, &'static str)> {
    vec![
        ("manhattan", "Minkowski order 1"),
        ("euclidean", "Minkowski order 2"),
        ("tsv", "Minkowski input split on tabs"),
        ("append", "File sink appends instead of truncating"),
        ("bytes", "File source reads raw bytes"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(
            r#"
            [defaults]
            verbose = true
            log_level = "xylem=debug"
            pipe_capacity = 16

            [presets.semicolons]
            module = "analysis.minkowski-distance-matrix"
            options = { "input delimiter regex" = ";", order = 3 }
            "#,
        )
        .unwrap();

        assert!(config.defaults.verbose);
        assert!(!config.defaults.quiet);
        assert_eq!(config.defaults.log_level.as_deref(), Some("xylem=debug"));
        assert_eq!(config.defaults.pipe_capacity, Some(16));

        let preset = config.get_preset("semicolons").unwrap();
        assert_eq!(preset.module, MINKOWSKI);
        assert_eq!(preset.options["order"], Value::Int(3));
    }

    #[test]
    fn test_user_preset_shadows_builtin() {
        let config: Config = toml::from_str(
            r#"
            [presets.manhattan]
            module = "sink.file"
            "#,
        )
        .unwrap();

        assert_eq!(config.get_preset("manhattan").unwrap().module, "sink.file");
        assert!(config.get_preset("euclidean").is_some());
        assert!(config.get_preset("nope").is_none());
    }

    #[test]
    fn test_every_listed_builtin_resolves() {
        let config = Config::default();
        for (name, _) in list_presets() {
            assert!(config.get_preset(name).is_some(), "{name}");
        }
    }

    #[test]
    fn test_apply_keeps_step_options() {
        let mut workflow = Workflow::new().root(
            Step::new("source.file")
                .option("path", "in.csv")
                .child(Step::new(MINKOWSKI).option("order", 4).child(Step::new("sink.stdout")))
                .child(Step::new(MINKOWSKI)),
        );

        let preset = builtin_preset("manhattan").unwrap();
        assert_eq!(preset.apply(&mut workflow), 2);

        let root = workflow.root.as_ref().unwrap();
        assert_eq!(root.children[0].options["order"], Value::Int(4));
        assert_eq!(root.children[1].options["order"], Value::Int(1));
        assert!(!root.options.contains_key("order"));
    }

    #[test]
    fn test_summary() {
        let preset = builtin_preset("append").unwrap();
        assert_eq!(preset.summary(), "append=true");
        assert_eq!(Preset::default().summary(), "(empty)");
    }
}
