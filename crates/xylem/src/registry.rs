//! Registry of available module types.

use crate::module::{Module, ModuleInfo};
use crate::properties::Properties;
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;

/// Builds a module from a configuration snapshot.
pub type ModuleFactory = Arc<dyn Fn(Properties) -> Box<dyn Module> + Send + Sync>;

/// A registered module type: its id plus what a default instance declares.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleDecl {
    /// Registry id, e.g. `source.text`.
    pub id: String,
    #[serde(flatten)]
    pub info: ModuleInfo,
}

/// Errors from looking up module types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown module type: {0}")]
    UnknownModule(String),
}

/// Catalogue of module types, in registration order.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    declarations: IndexMap<String, ModuleDecl>,
    factories: IndexMap<String, ModuleFactory>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.declarations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module type. Re-registering an id replaces it.
    ///
    /// The factory is called once with an empty configuration to record
    /// the type's declaration.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(Properties) -> Box<dyn Module> + Send + Sync + 'static,
    {
        let id = id.into();
        let info = factory(Properties::new()).core().info();
        self.declarations.insert(
            id.clone(),
            ModuleDecl {
                id: id.clone(),
                info,
            },
        );
        self.factories.insert(id, Arc::new(factory));
    }

    /// Instantiate a module type with `config`.
    pub fn create(&self, id: &str, config: Properties) -> Result<Box<dyn Module>, RegistryError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;
        Ok(factory(config))
    }

    pub fn get_decl(&self, id: &str) -> Option<&ModuleDecl> {
        self.declarations.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.declarations.contains_key(id)
    }

    /// Iterate over all declarations.
    pub fn declarations(&self) -> impl Iterator<Item = &ModuleDecl> {
        self.declarations.values()
    }

    /// Registered ids, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.declarations.keys().map(String::as_str)
    }

    /// Declarations grouped by category, categories in first-seen order.
    pub fn by_category(&self) -> IndexMap<&str, Vec<&ModuleDecl>> {
        let mut groups: IndexMap<&str, Vec<&ModuleDecl>> = IndexMap::new();
        for decl in self.declarations.values() {
            groups.entry(decl.info.category.as_str()).or_default().push(decl);
        }
        groups
    }

    /// Number of registered module types.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleCore, ModuleError};
    use crate::pipe::PipeKind;
    use crate::port::{InputPort, OutputPort};
    use crate::properties::PropertiesExt;

    struct Echo {
        core: ModuleCore,
    }

    impl Module for Echo {
        fn core(&self) -> &ModuleCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }
        fn process(&mut self) -> Result<bool, ModuleError> {
            Ok(true)
        }
    }

    fn echo(category: &'static str) -> impl Fn(Properties) -> Box<dyn Module> + Send + Sync {
        move |config| -> Box<dyn Module> {
            Box::new(Echo {
                core: ModuleCore::new("Echo")
                    .with_category(category)
                    .property("prefix", ">", "Prefix for each line.")
                    .input(InputPort::new("input", "Text.").accept(PipeKind::Char))
                    .output(OutputPort::new("output", "Text.").accept(PipeKind::Char))
                    .configure(config),
            })
        }
    }

    fn make_test_registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("text.echo", echo("Text"));
        registry.register("text.echo-loud", echo("Text"));
        registry.register("debug.echo", echo("Debug"));
        registry
    }

    #[test]
    fn test_create_with_config() {
        let registry = make_test_registry();
        let module = registry
            .create("text.echo", Properties::new().with("prefix", "#"))
            .unwrap();
        assert_eq!(module.name(), "Echo");
        assert_eq!(module.core().properties().value("prefix"), Some("#"));
    }

    #[test]
    fn test_unknown_module() {
        let registry = make_test_registry();
        assert!(matches!(
            registry.create("nonexistent", Properties::new()),
            Err(RegistryError::UnknownModule(id)) if id == "nonexistent"
        ));
    }

    #[test]
    fn test_get_decl() {
        let registry = make_test_registry();
        let decl = registry.get_decl("text.echo").unwrap();
        assert_eq!(decl.info.inputs[0].id, "input");
        assert!(decl.info.properties.iter().any(|p| p.key == "prefix"));
        assert!(registry.get_decl("nonexistent").is_none());
    }

    #[test]
    fn test_by_category_keeps_order() {
        let registry = make_test_registry();
        let groups = registry.by_category();
        let categories: Vec<_> = groups.keys().copied().collect();
        assert_eq!(categories, vec!["Text", "Debug"]);
        assert_eq!(groups["Text"].len(), 2);
        assert_eq!(registry.len(), 3);
    }
}
