//! Declarative TOML wiring file parsing (spec.md §6).
//!
//! A wiring file lists factory instances under `[[factory]]`, each keyed
//! by a unique `prefix`. Entries sharing a prefix across multiple sources
//! (e.g. a plugin-provided default overlaid by a user file) are merged:
//! the first-seen entry wins for any field it sets, and later entries only
//! fill in fields the first left empty. Grounded on
//! `JWiringService::AddWirings`/`Overlay`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use jana2_core::{EventLevel, JanaError, JanaResult};

/// One `[[factory]]` entry: a configured factory (or processor) instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WiringEntry {
    /// Plugin the component type comes from. Empty means "built-in".
    #[serde(default)]
    pub plugin_name: String,
    /// Registered component type name.
    pub type_name: String,
    /// Unique key for this instance; namespaces its parameters.
    pub prefix: String,
    /// Event level this instance operates at, if level-specific.
    #[serde(default)]
    pub level: Option<EventLevel>,
    /// Names of collections this instance reads.
    #[serde(default)]
    pub input_names: Vec<String>,
    /// Event level of each input, parallel to `input_names`.
    #[serde(default)]
    pub input_levels: Vec<EventLevel>,
    /// Names of collections this instance writes.
    #[serde(default)]
    pub output_names: Vec<String>,
    /// Free-form string configuration, namespaced by `prefix`.
    #[serde(default)]
    pub configs: HashMap<String, String>,
}

impl WiringEntry {
    fn overlay_from(&mut self, below: &WiringEntry) -> JanaResult<()> {
        if self.type_name != below.type_name {
            return Err(JanaError::Configuration(format!(
                "wiring '{}': type name mismatch '{}' vs '{}'",
                self.prefix, self.type_name, below.type_name
            )));
        }
        if self.plugin_name != below.plugin_name && !below.plugin_name.is_empty() && self.plugin_name.is_empty() {
            self.plugin_name = below.plugin_name.clone();
        }
        if self.input_names.is_empty() && !below.input_names.is_empty() {
            self.input_names = below.input_names.clone();
        }
        if self.input_levels.is_empty() && !below.input_levels.is_empty() {
            self.input_levels = below.input_levels.clone();
        }
        if self.output_names.is_empty() && !below.output_names.is_empty() {
            self.output_names = below.output_names.clone();
        }
        for (key, value) in &below.configs {
            self.configs.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawWiringFile {
    #[serde(default, rename = "factory")]
    factory: Vec<WiringEntry>,
    #[serde(default)]
    configs: HashMap<String, String>,
}

/// The parsed contents of one or more wiring files, merged by prefix.
#[derive(Debug, Default)]
pub struct WiringTable {
    order: Vec<String>,
    by_prefix: HashMap<String, WiringEntry>,
    shared_parameters: HashMap<String, String>,
}

impl WiringTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a wiring file from disk and merge it into a fresh table.
    ///
    /// # Errors
    /// [`JanaError::Io`] if the file cannot be read, [`JanaError::Wiring`]
    /// if it is not valid TOML, [`JanaError::DuplicatePrefix`] if two
    /// entries in the same file share a prefix.
    pub fn from_file(path: impl AsRef<Path>) -> JanaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut table = Self::new();
        table.merge_str(&text)?;
        Ok(table)
    }

    /// Parse TOML text and merge it into this table, overlaying shared
    /// prefixes per the module doc.
    ///
    /// # Errors
    /// [`JanaError::Wiring`] on malformed TOML, [`JanaError::DuplicatePrefix`]
    /// if two entries in `text` itself share a prefix.
    pub fn merge_str(&mut self, text: &str) -> JanaResult<()> {
        let raw: RawWiringFile = toml::from_str(text)?;

        let mut seen_in_bundle = std::collections::HashSet::new();
        for entry in raw.factory {
            if !seen_in_bundle.insert(entry.prefix.clone()) {
                return Err(JanaError::DuplicatePrefix(entry.prefix));
            }
            match self.by_prefix.get_mut(&entry.prefix) {
                Some(existing) => existing.overlay_from(&entry)?,
                None => {
                    self.order.push(entry.prefix.clone());
                    self.by_prefix.insert(entry.prefix.clone(), entry);
                }
            }
        }

        for (key, value) in raw.configs {
            self.shared_parameters.entry(key).or_insert(value);
        }
        Ok(())
    }

    /// The entry registered under `prefix`, if any.
    #[must_use]
    pub fn get(&self, prefix: &str) -> Option<&WiringEntry> {
        self.by_prefix.get(prefix)
    }

    /// All entries, in first-seen order.
    #[must_use]
    pub fn entries(&self) -> Vec<&WiringEntry> {
        self.order.iter().filter_map(|p| self.by_prefix.get(p)).collect()
    }

    /// Every entry matching `plugin_name`/`type_name`.
    #[must_use]
    pub fn entries_for(&self, plugin_name: &str, type_name: &str) -> Vec<&WiringEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.plugin_name == plugin_name && e.type_name == type_name)
            .collect()
    }

    /// Parameters shared across all wired components (the file's
    /// top-level `[configs]` table), distinct from any one prefix's own
    /// `configs`.
    #[must_use]
    pub fn shared_parameters(&self) -> &HashMap<String, String> {
        &self.shared_parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_factory_entries_and_configs() {
        let toml = r#"
            [[factory]]
            type_name = "TrackFinder"
            prefix = "trk1"
            input_names = ["hits"]
            output_names = ["tracks"]

            [factory.configs]
            max_iterations = "50"

            [configs]
            shared_key = "shared_value"
        "#;
        let mut table = WiringTable::new();
        table.merge_str(toml).unwrap();

        let entry = table.get("trk1").unwrap();
        assert_eq!(entry.type_name, "TrackFinder");
        assert_eq!(entry.input_names, vec!["hits".to_string()]);
        assert_eq!(entry.configs.get("max_iterations").unwrap(), "50");
        assert_eq!(table.shared_parameters().get("shared_key").unwrap(), "shared_value");
    }

    #[test]
    fn duplicate_prefix_within_one_bundle_is_rejected() {
        let toml = r#"
            [[factory]]
            type_name = "A"
            prefix = "dup"

            [[factory]]
            type_name = "B"
            prefix = "dup"
        "#;
        let mut table = WiringTable::new();
        let err = table.merge_str(toml).unwrap_err();
        assert!(matches!(err, JanaError::DuplicatePrefix(_)));
    }

    #[test]
    fn later_bundle_overlays_only_empty_fields() {
        let mut table = WiringTable::new();
        table
            .merge_str(
                r#"
                [[factory]]
                type_name = "TrackFinder"
                prefix = "trk1"
                output_names = ["tracks"]
                "#,
            )
            .unwrap();
        table
            .merge_str(
                r#"
                [[factory]]
                type_name = "TrackFinder"
                prefix = "trk1"
                input_names = ["hits"]
                output_names = ["overridden_should_not_apply"]
                "#,
            )
            .unwrap();

        let entry = table.get("trk1").unwrap();
        // output_names was already set by the first bundle, so the second
        // bundle's value is ignored.
        assert_eq!(entry.output_names, vec!["tracks".to_string()]);
        // input_names was empty, so the second bundle fills it in.
        assert_eq!(entry.input_names, vec!["hits".to_string()]);
    }

    #[test]
    fn type_name_mismatch_on_overlay_is_an_error() {
        let mut table = WiringTable::new();
        table
            .merge_str(
                r#"
                [[factory]]
                type_name = "TrackFinder"
                prefix = "trk1"
                "#,
            )
            .unwrap();
        let err = table
            .merge_str(
                r#"
                [[factory]]
                type_name = "ClusterFinder"
                prefix = "trk1"
                "#,
            )
            .unwrap_err();
        assert!(matches!(err, JanaError::Configuration(_)));
    }
}
