//! Selection of local variables to ship with a run.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::syntax::strip_literals;

/// An identifier, with the attribute dot in front of it if there is one.
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\.\s*)?([A-Za-z_][A-Za-z0-9_]*)").expect("identifier pattern is valid")
});

/// Names referenced as bare identifiers in `code`.
///
/// Attribute accesses (`obj.name`), string contents and comments do not
/// count.
pub fn referenced_names(code: &str) -> HashSet<String> {
    let stripped = strip_literals(code);
    IDENTIFIER
        .captures_iter(&stripped)
        .filter(|caps| caps.get(1).is_none())
        .filter_map(|caps| caps.get(2))
        .map(|name| name.as_str().to_string())
        .collect()
}

/// Keeps the `namespace` entries whose names `code` references.
///
/// ```
/// use flock::capture::select_globals;
/// use serde_json::{json, Map};
///
/// let mut ns = Map::new();
/// ns.insert("scale".to_string(), json!(3));
/// ns.insert("unused".to_string(), json!(true));
///
/// let picked = select_globals("DATA * scale", &ns);
/// assert_eq!(picked.len(), 1);
/// assert_eq!(picked["scale"], json!(3));
/// ```
pub fn select_globals(code: &str, namespace: &Map<String, Value>) -> Map<String, Value> {
    let names = referenced_names(code);
    namespace
        .iter()
        .filter(|(key, _)| names.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn attributes_strings_and_comments_are_skipped() {
        let names = referenced_names("total = obj.size + count # offset\nlabel = 'factor'\n");
        assert!(names.contains("total"));
        assert!(names.contains("obj"));
        assert!(names.contains("count"));
        assert!(!names.contains("size"));
        assert!(!names.contains("offset"));
        assert!(!names.contains("factor"));
    }

    #[test]
    fn spaced_attribute_access_is_skipped() {
        let names = referenced_names("frame . columns");
        assert_eq!(names, HashSet::from(["frame".to_string()]));
    }

    #[test]
    fn only_referenced_entries_are_kept() {
        let mut ns = Map::new();
        ns.insert("a".to_string(), json!(1));
        ns.insert("b".to_string(), json!([1, 2]));
        ns.insert("c".to_string(), json!("x"));
        let picked = select_globals("print(a, b)", &ns);
        assert_eq!(picked.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
