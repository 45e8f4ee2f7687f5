//! Better error messages with actionable suggestions.

use std::path::Path;
use xylem::{ModuleRegistry, ModuleTree, NodeId};

/// Build an error message for an unknown module type id.
pub fn unknown_module_error(id: &str, registry: &ModuleRegistry) -> String {
    let mut msg = format!("Unknown module type '{}'", id);

    if let Some(suggestion) = find_similar(id, registry.ids()) {
        msg.push_str(&format!(".\n\nDid you mean '{}'?", suggestion));
        return msg;
    }

    msg.push_str(".\n\nAvailable modules:\n");
    for (category, decls) in registry.by_category() {
        let ids: Vec<_> = decls.iter().map(|d| d.id.as_str()).collect();
        msg.push_str(&format!("  {:<12} {}\n", format!("{}:", category), ids.join(", ")));
    }
    msg.push_str("\nRun `xylem list` for details.");

    msg
}

/// Build an error message for a `--set` target that names no node.
pub fn unknown_node_error(name: &str, tree: &ModuleTree) -> String {
    let names: Vec<String> = tree
        .depth_first()
        .into_iter()
        .filter_map(|id: NodeId| tree.module(id).map(|m| m.name().to_string()))
        .collect();

    let mut msg = format!("No module named '{}' in the workflow", name);

    if let Some(suggestion) = find_similar(name, names.iter().map(String::as_str)) {
        msg.push_str(&format!(".\n\nDid you mean '{}'?", suggestion));
    } else if !names.is_empty() {
        msg.push_str(&format!(".\n\nModules: {}", names.join(", ")));
    }

    msg
}

/// Build an error message for a file read failure.
pub fn file_read_error(path: &str, err: &std::io::Error) -> String {
    use std::io::ErrorKind;

    let mut msg = format!("Failed to read '{}'", path);

    match err.kind() {
        ErrorKind::NotFound => {
            msg.push_str(": file not found");

            if let Some(suggestions) = find_similar_files(path)
                && !suggestions.is_empty()
            {
                msg.push_str(&format!(".\n\nDid you mean: {}?", suggestions.join(", ")));
            }
        }
        ErrorKind::PermissionDenied => {
            msg.push_str(": permission denied. Check file permissions.");
        }
        ErrorKind::InvalidData => {
            msg.push_str(": file contains invalid data.");
        }
        _ => {
            msg.push_str(&format!(": {}", err));
        }
    }

    msg
}

/// Closest candidate within edit distance 2 (case-insensitive).
fn find_similar<'a>(input: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let input = input.to_lowercase();

    candidates
        .into_iter()
        .map(|c| (levenshtein(&input, &c.to_lowercase()), c))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c)
}

/// Simple Levenshtein distance for short strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Find similar files in the same directory (for "did you mean" suggestions).
fn find_similar_files(path: &str) -> Option<Vec<String>> {
    let path = Path::new(path);
    let filename = path.file_name()?.to_str()?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let entries = std::fs::read_dir(parent).ok()?;
    let mut suggestions = Vec::new();

    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str()
            && levenshtein(filename, name) <= 2
            && name != filename
        {
            suggestions.push(name.to_string());
        }
    }

    suggestions.sort();
    suggestions.truncate(3);
    Some(suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        xylem_modules::register_all(&mut registry);
        registry
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("json", "json"), 0);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn test_find_similar() {
        let ids = ["source.text", "source.file", "passthrough"];
        assert_eq!(find_similar("source.txt", ids), Some("source.text"));
        assert_eq!(find_similar("PASSTHRUGH", ids), Some("passthrough"));
        assert_eq!(find_similar("matrix", ids), None);
    }

    #[test]
    fn test_unknown_module_suggestion() {
        let msg = unknown_module_error("pasthrough", &registry());
        assert!(msg.contains("Did you mean 'passthrough'?"), "{msg}");

        let msg = unknown_module_error("zzzzzzzz", &registry());
        assert!(msg.contains("Available modules"), "{msg}");
        assert!(msg.contains("passthrough"), "{msg}");
    }

    #[test]
    fn test_file_read_error_suggests_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tree.yaml"), "").unwrap();
        let missing = dir.path().join("tree.yml");
        let missing = missing.to_string_lossy();

        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        let msg = file_read_error(&missing, &err);
        assert!(msg.contains("file not found"), "{msg}");
        assert!(msg.contains("tree.yaml"), "{msg}");
    }
}
