//! Model catalog: parses `models.txt`, a plain-text registry of known
//! embedding models and their output dimension.

use crate::error::CatalogError;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// One entry from the model catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: String,
    pub dimension: usize,
    pub autoload: bool,
}

/// The set of models a service instance knows about, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: HashMap<String, ModelEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a catalog file. Lines starting with `#` are comments; malformed
    /// lines are logged and skipped rather than aborting the load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut models = HashMap::new();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                warn!(line = lineno + 1, "malformed catalog line, skipping");
                continue;
            }
            let (name, dim_str, autoload_str) = (fields[0], fields[1], fields[2]);
            let Ok(dimension) = dim_str.parse::<usize>() else {
                warn!(line = lineno + 1, "non-numeric dimension, skipping");
                continue;
            };
            let autoload = autoload_str != "0";
            models.insert(
                name.to_string(),
                ModelEntry {
                    name: name.to_string(),
                    dimension,
                    autoload,
                },
            );
        }
        Self { models }
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn autoloaded(&self) -> impl Iterator<Item = &ModelEntry> {
        self.models.values().filter(|m| m.autoload)
    }

    /// Filesystem-safe form of a model name: every path separator becomes `_`.
    pub fn normalize_name(name: &str) -> String {
        name.replace(['/', '\\'], "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_entries() {
        let cat = Catalog::parse("m1 512 1\nm2 384 0\n");
        assert_eq!(cat.get("m1").unwrap().dimension, 512);
        assert!(cat.get("m1").unwrap().autoload);
        assert!(!cat.get("m2").unwrap().autoload);
    }

    #[test]
    fn skips_comments_and_blanks() {
        let cat = Catalog::parse("# a comment\n\nm1 8 1\n");
        assert_eq!(cat.get("m1").unwrap().dimension, 8);
        assert_eq!(cat.autoloaded().count(), 1);
    }

    #[test]
    fn skips_malformed_lines() {
        let cat = Catalog::parse("m1 not-a-number 1\nm2 16 1\nthreefields extra 1 1\n");
        assert!(cat.get("m1").is_none());
        assert!(cat.get("m2").is_some());
    }

    #[test]
    fn unknown_model_is_none() {
        let cat = Catalog::new();
        assert!(cat.get("nope").is_none());
        assert!(!cat.contains("nope"));
    }

    #[test]
    fn normalizes_path_separators() {
        assert_eq!(
            Catalog::normalize_name("sentence-transformers/distiluse"),
            "sentence-transformers_distiluse"
        );
    }
}
