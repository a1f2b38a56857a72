//! Actionable hints for common remote errors.
//!
//! Two failures account for most first-run confusion: a package that the
//! remote runtime does not ship, and a module imported locally but not in
//! the submitted code.

use std::sync::LazyLock;

use regex::Regex;

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"No module named '([^']+)'").expect("missing-module pattern is valid")
});

static UNDEFINED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"name '([^']+)' is not defined").expect("undefined-name pattern is valid")
});

/// Lowercase identifiers, the usual shape of a module name.
static MODULE_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("module-name pattern is valid"));

fn capture<'a>(re: &Regex, message: &'a str) -> Option<&'a str> {
    re.captures(message)?.get(1).map(|m| m.as_str())
}

/// Returns guidance for a remote error, if any applies.
///
/// ```
/// use flock::guidance::hint_for;
///
/// let hint = hint_for("ModuleNotFoundError", "No module named 'pandas'").unwrap();
/// assert!(hint.contains("pandas"));
/// assert!(hint_for("ValueError", "bad value").is_none());
/// ```
pub fn hint_for(error_type: &str, message: &str) -> Option<String> {
    match error_type {
        "ModuleNotFoundError" | "ImportError" => {
            let module = capture(&MISSING_MODULE, message)?;
            let package = module.split('.').next().unwrap_or(module);
            Some(format!(
                "The remote runtime doesn't include '{module}' by default. \
                 Add the package that provides it as a dependency, e.g. '{package}'."
            ))
        }
        "NameError" => {
            let name = capture(&UNDEFINED_NAME, message)?;
            MODULE_LIKE.is_match(name).then(|| {
                format!(
                    "If '{name}' is a module, import it inside the submitted code; \
                     local imports are not sent to remote workers."
                )
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_module_suggests_dependency() {
        let hint =
            hint_for("ModuleNotFoundError", "No module named 'sklearn.linear_model'").unwrap();
        assert!(hint.contains("'sklearn.linear_model'"));
        assert!(hint.contains("e.g. 'sklearn'"));
    }

    #[test]
    fn undefined_module_like_name_suggests_import() {
        let hint = hint_for("NameError", "name 'np' is not defined").unwrap();
        assert!(hint.contains("import it"));
    }

    #[test]
    fn undefined_class_like_name_gets_no_hint() {
        assert!(hint_for("NameError", "name 'DataFrame' is not defined").is_none());
    }

    #[test]
    fn import_error_uses_the_same_hint() {
        let hint = hint_for("ImportError", "No module named 'yaml'").unwrap();
        assert!(hint.contains("e.g. 'yaml'"));
    }

    #[test]
    fn unrelated_errors_get_no_hint() {
        assert!(hint_for("ZeroDivisionError", "division by zero").is_none());
        assert!(hint_for("ModuleNotFoundError", "something else").is_none());
    }
}
