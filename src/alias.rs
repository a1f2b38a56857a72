//! Execution environment specs and alias resolution.
//!
//! An alias names one published remote artifact. It is derived from an
//! [`EnvironmentSpec`] and a digest of the deployed entrypoint, so two specs
//! that differ only in the order or case of their dependencies and
//! extensions always resolve to the same alias, while a changed entrypoint
//! never reuses artifacts published for the old one.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marker mixed into every fingerprint. Bump it when the event protocol
/// changes in a way that invalidates previously published artifacts.
pub const PROTOCOL_VERSION: &[u8] = b"1";

/// Number of hex characters of the fingerprint kept in the alias.
pub const HASH_PREFIX_LEN: usize = 5;

/// Maximum length of the human-readable dependency summary.
pub const SUMMARY_MAX_LEN: usize = 50;

/// Summary used when an environment has no dependencies.
pub const CLEAN_SUMMARY: &str = "clean";

/// Memory of the bootstrap environment used to build dependency bundles.
pub const BOOTSTRAP_MEMORY_MB: u32 = 3008;

/// Timeout of the bootstrap environment used to build dependency bundles.
pub const BOOTSTRAP_TIMEOUT_SECS: u32 = 300;

/// A logical execution environment.
///
/// Field values are kept exactly as given; normalization only happens when
/// the alias is computed. This keeps case-sensitive extension identifiers
/// intact for the backend while still making the alias case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    runtime: String,
    memory_mb: u32,
    timeout_secs: u32,
    #[serde(default)]
    dependencies: BTreeSet<String>,
    #[serde(default)]
    extensions: BTreeSet<String>,
}

impl EnvironmentSpec {
    /// Creates a spec with no dependencies and no extensions.
    pub fn new(runtime: impl Into<String>, memory_mb: u32, timeout_secs: u32) -> Self {
        Self {
            runtime: runtime.into(),
            memory_mb,
            timeout_secs,
            dependencies: BTreeSet::new(),
            extensions: BTreeSet::new(),
        }
    }

    /// The fixed environment used to build dependency bundles for `runtime`.
    pub fn bootstrap(runtime: impl Into<String>) -> Self {
        Self::new(runtime, BOOTSTRAP_MEMORY_MB, BOOTSTRAP_TIMEOUT_SECS)
    }

    /// Adds dependencies (package requirement strings).
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Adds extensions (runtime layer identifiers).
    #[must_use]
    pub fn with_extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions.extend(exts.into_iter().map(Into::into));
        self
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    pub fn timeout_secs(&self) -> u32 {
        self.timeout_secs
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn extensions(&self) -> &BTreeSet<String> {
        &self.extensions
    }

    /// Whether deploying this spec needs a dependency build.
    pub fn needs_build(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Lower-cased, deduplicated, sorted dependencies.
    pub fn normalized_dependencies(&self) -> Vec<String> {
        normalize(&self.dependencies)
    }

    /// Lower-cased, deduplicated, sorted extensions.
    pub fn normalized_extensions(&self) -> Vec<String> {
        normalize(&self.extensions)
    }
}

/// Name of a published remote artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Alias(String);

impl Alias {
    /// Wraps an alias name read back from the backend.
    pub fn from_backend(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Alias {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolves the alias for `spec` deployed with the `entrypoint` digest.
///
/// Format: `<runtime>-<memory>M-<timeout>s-<hash>-<summary>`, where
/// `runtime` has its dots removed, `hash` is a short prefix of
/// [`fingerprint`], and `summary` is a readable digest of the dependency
/// names. The summary never feeds the hash.
pub fn resolve(spec: &EnvironmentSpec, entrypoint: &str) -> Alias {
    let deps = spec.normalized_dependencies();
    let hash = fingerprint(entrypoint, &deps, &spec.normalized_extensions());
    let runtime: String = spec.runtime.chars().filter(|c| *c != '.').collect();

    Alias(format!(
        "{}-{}M-{}s-{}-{}",
        runtime,
        spec.memory_mb,
        spec.timeout_secs,
        &hash[..HASH_PREFIX_LEN],
        summary(&deps)
    ))
}

/// Full hex SHA-256 fingerprint of an entrypoint digest and normalized
/// dependency and extension sets.
///
/// Every section and every entry is length-prefixed so that e.g.
/// `["ab", "c"]` and `["a", "bc"]` never hash alike.
pub fn fingerprint(entrypoint: &str, deps: &[String], exts: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(PROTOCOL_VERSION);
    hasher.update((entrypoint.len() as u64).to_le_bytes());
    hasher.update(entrypoint.as_bytes());
    for section in [deps, exts] {
        hasher.update((section.len() as u64).to_le_bytes());
        for item in section {
            hasher.update((item.len() as u64).to_le_bytes());
            hasher.update(item.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 over length-prefixed `parts`.
///
/// Used to condense entrypoint sources and settings into the digest that
/// [`resolve`] takes.
pub fn digest_parts(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

fn normalize(items: &BTreeSet<String>) -> Vec<String> {
    let lowered: BTreeSet<String> = items.iter().map(|s| s.to_lowercase()).collect();
    lowered.into_iter().collect()
}

fn summary(normalized_deps: &[String]) -> String {
    let joined = normalized_deps
        .iter()
        .map(|dep| {
            dep.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("_");

    let truncated: String = joined.chars().take(SUMMARY_MAX_LEN).collect();
    if truncated.is_empty() {
        CLEAN_SUMMARY.to_string()
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: &str = "entry";

    fn base() -> EnvironmentSpec {
        EnvironmentSpec::new("python3.7", 512, 60)
    }

    #[test]
    fn clean_alias_format() {
        let alias = resolve(&base(), ENTRY);
        let parts: Vec<&str> = alias.as_str().split('-').collect();
        assert_eq!(parts[0], "python37");
        assert_eq!(parts[1], "512M");
        assert_eq!(parts[2], "60s");
        assert_eq!(parts[3].len(), HASH_PREFIX_LEN);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[4], "clean");
    }

    #[test]
    fn summary_strips_non_word_characters() {
        let spec = base().with_dependencies(["numpy==1.16", "scikit-learn"]);
        let alias = resolve(&spec, ENTRY);
        assert!(alias.as_str().ends_with("-numpy116_scikitlearn"));
    }

    #[test]
    fn summary_is_truncated() {
        let long = "a".repeat(80);
        let spec = base().with_dependencies([long]);
        let alias = resolve(&spec, ENTRY);
        let summary = alias.as_str().rsplit('-').next().unwrap_or_default();
        assert_eq!(summary.len(), SUMMARY_MAX_LEN);
    }

    #[test]
    fn case_and_order_do_not_matter() {
        let a = base().with_dependencies(["NumPy", "pandas"]);
        let b = base().with_dependencies(["pandas", "numpy"]);
        assert_eq!(resolve(&a, ENTRY), resolve(&b, ENTRY));
    }

    #[test]
    fn duplicates_after_case_folding_collapse() {
        let a = base().with_dependencies(["numpy", "NUMPY"]);
        let b = base().with_dependencies(["numpy"]);
        assert_eq!(resolve(&a, ENTRY), resolve(&b, ENTRY));
    }

    #[test]
    fn extensions_change_hash_but_keep_raw_case() {
        let arn = "arn:aws:lambda:us-west-2:123:layer:Tools:3";
        let with_layer = base().with_extensions([arn]);
        assert_ne!(resolve(&with_layer, ENTRY), resolve(&base(), ENTRY));
        assert!(with_layer.extensions().contains(arn));
    }

    #[test]
    fn partition_of_entries_matters() {
        let a = fingerprint(ENTRY, &["ab".into(), "c".into()], &[]);
        let b = fingerprint(ENTRY, &["a".into(), "bc".into()], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn dependency_versus_extension_placement_matters() {
        let a = fingerprint(ENTRY, &["x".into()], &[]);
        let b = fingerprint(ENTRY, &[], &["x".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn entrypoint_changes_the_alias() {
        let old = digest_parts(&[b"main.py", b"def lambda_handler(e, c): return 1\n"]);
        let new = digest_parts(&[b"main.py", b"def lambda_handler(e, c): return 2\n"]);
        assert_ne!(resolve(&base(), &old), resolve(&base(), &new));
    }

    #[test]
    fn digest_parts_are_delimited() {
        assert_ne!(digest_parts(&[b"ab", b"c"]), digest_parts(&[b"a", b"bc"]));
    }

    #[test]
    fn bootstrap_spec_is_fixed() {
        let boot = EnvironmentSpec::bootstrap("python3.8");
        assert_eq!(boot.memory_mb(), BOOTSTRAP_MEMORY_MB);
        assert_eq!(boot.timeout_secs(), BOOTSTRAP_TIMEOUT_SECS);
        assert!(!boot.needs_build());
        assert!(boot.extensions().is_empty());
        assert_eq!(boot.runtime(), "python3.8");
    }
}
