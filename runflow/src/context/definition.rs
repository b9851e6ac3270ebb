//! Pipeline definitions supplied by the pipeline-file parser.

use crate::run::Arguments;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named pipeline as declared in a pipeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Default arguments, merged under the invocation arguments.
    #[serde(default)]
    pub arguments: Arguments,
    /// File the definition was declared in.
    pub file_name: String,
    /// Visible to other files.
    #[serde(default = "default_public")]
    pub public: bool,
    /// Shipped with the tool rather than written by the user.
    #[serde(default)]
    pub built_in: bool,
}

fn default_public() -> bool {
    true
}

impl Definition {
    /// Creates a public, user-defined definition.
    #[must_use]
    pub fn new(arguments: Arguments, file_name: impl Into<String>) -> Self {
        Self {
            arguments,
            file_name: file_name.into(),
            public: true,
            built_in: false,
        }
    }

    /// Sets visibility.
    #[must_use]
    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Marks the definition as built in.
    #[must_use]
    pub fn with_built_in(mut self, built_in: bool) -> Self {
        self.built_in = built_in;
        self
    }
}

/// Definitions by pipeline identifier.
///
/// One identifier may be declared in several files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Definitions {
    by_identifier: HashMap<String, Vec<Definition>>,
}

impl Definitions {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition under `identifier`.
    pub fn insert(&mut self, identifier: impl Into<String>, definition: Definition) {
        self.by_identifier
            .entry(identifier.into())
            .or_default()
            .push(definition);
    }

    /// Builder form of [`Definitions::insert`].
    #[must_use]
    pub fn with(mut self, identifier: impl Into<String>, definition: Definition) -> Self {
        self.insert(identifier, definition);
        self
    }

    /// All definitions declared for `identifier`, in declaration order.
    #[must_use]
    pub fn get(&self, identifier: &str) -> &[Definition] {
        self.by_identifier
            .get(identifier)
            .map_or(&[], Vec::as_slice)
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }

    /// Resolves `identifier` to one definition.
    ///
    /// A definition from `root_file_name` wins, then the first public one,
    /// then the first private one.
    #[must_use]
    pub fn resolve(&self, identifier: &str, root_file_name: Option<&str>) -> Option<&Definition> {
        let candidates = self.get(identifier);
        root_file_name
            .and_then(|root| candidates.iter().find(|d| d.file_name == root))
            .or_else(|| candidates.iter().find(|d| d.public))
            .or_else(|| candidates.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(file: &str, public: bool, marker: &str) -> Definition {
        let arguments = json!({ "marker": marker })
            .as_object()
            .cloned()
            .unwrap_or_default();
        Definition::new(arguments, file).with_public(public)
    }

    fn marker(definition: Option<&Definition>) -> Option<&str> {
        definition
            .and_then(|d| d.arguments.get("marker"))
            .and_then(|v| v.as_str())
    }

    #[test]
    fn test_root_file_wins() {
        let definitions = Definitions::new()
            .with("build", def("shared.yml", true, "shared"))
            .with("build", def("root.yml", false, "root"));
        let resolved = definitions.resolve("build", Some("root.yml"));
        assert_eq!(marker(resolved), Some("root"));
    }

    #[test]
    fn test_public_before_private() {
        let definitions = Definitions::new()
            .with("build", def("a.yml", false, "private"))
            .with("build", def("b.yml", true, "public"));
        let resolved = definitions.resolve("build", Some("other.yml"));
        assert_eq!(marker(resolved), Some("public"));
        assert_eq!(marker(definitions.resolve("build", None)), Some("public"));
    }

    #[test]
    fn test_private_fallback() {
        let definitions = Definitions::new()
            .with("build", def("a.yml", false, "first"))
            .with("build", def("b.yml", false, "second"));
        assert_eq!(marker(definitions.resolve("build", None)), Some("first"));
        assert!(definitions.resolve("missing", None).is_none());
    }

    #[test]
    fn test_deserialize_table() {
        let definitions: Definitions = serde_json::from_value(json!({
            "lint": [{
                "file_name": "ci.yml",
                "arguments": {"shell": {"command": "cargo clippy"}}
            }]
        }))
        .unwrap();
        let lint = definitions.resolve("lint", None).unwrap();
        assert!(lint.public);
        assert!(!lint.built_in);
        assert_eq!(lint.file_name, "ci.yml");
    }
}
