//! Language parser adapters.
//!
//! Each adapter turns source text of one language into a normalized
//! [`CodeModel`]. The contract is identical across languages; backends
//! differ in depth (tree-sitter for Python, regex scanning for PHP and
//! JavaScript). Parsing never fails: a syntax error yields a partial model
//! with `partial` set.

mod javascript;
mod php;
mod python;

pub use javascript::JavaScriptAnalyzer;
pub use php::PhpAnalyzer;
pub use python::PythonAnalyzer;

use crate::model::{CodeModel, Language, language_of};

/// One language backend.
pub trait LanguageAnalyzer: Send + Sync {
   fn language(&self) -> Language;

   /// Parse source into a code model. Must not panic; syntax errors produce
   /// a partial model instead.
   fn parse(&self, path: &str, source: &str) -> CodeModel;
}

static PYTHON: PythonAnalyzer = PythonAnalyzer;
static PHP: PhpAnalyzer = PhpAnalyzer;
static JAVASCRIPT: JavaScriptAnalyzer = JavaScriptAnalyzer;

/// Look up the adapter registered for a path's extension.
pub fn analyzer_for(path: &str) -> Option<&'static dyn LanguageAnalyzer> {
   match language_of(path)? {
      Language::Python => Some(&PYTHON),
      Language::Php => Some(&PHP),
      Language::JavaScript => Some(&JAVASCRIPT),
   }
}

/// Parse one side of a diff; unknown languages yield an empty model.
pub fn parse_source(path: &str, source: &str) -> CodeModel {
   analyzer_for(path).map_or_else(CodeModel::empty, |analyzer| analyzer.parse(path, source))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_registry_dispatches_by_extension() {
      assert_eq!(analyzer_for("a.py").map(|a| a.language()), Some(Language::Python));
      assert_eq!(analyzer_for("a.php").map(|a| a.language()), Some(Language::Php));
      assert_eq!(analyzer_for("a.js").map(|a| a.language()), Some(Language::JavaScript));
      assert!(analyzer_for("a.rb").is_none());
   }

   #[test]
   fn test_unknown_language_parses_to_empty_model() {
      let model = parse_source("notes.txt", "whatever\n");
      assert!(model.is_empty());
      assert!(model.language.is_none());
   }
}
