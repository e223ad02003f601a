use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

/// Languages with a registered parser adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
   Python,
   Php,
   JavaScript,
}

impl Language {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Python => "python",
         Self::Php => "php",
         Self::JavaScript => "javascript",
      }
   }
}

impl fmt::Display for Language {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// Map a path to a language by extension. Unknown extensions get `None` and
/// the differ falls back to pure structural signals.
pub fn language_of(path: &str) -> Option<Language> {
   let ext = Path::new(path).extension()?.to_str()?;
   match ext {
      "py" | "pyi" => Some(Language::Python),
      "php" => Some(Language::Php),
      "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(Language::JavaScript),
      _ => None,
   }
}

/// Control-flow features observed in a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlFlow {
   If,
   For,
   While,
   Try,
   With,
   Comprehension,
   Lambda,
   Ternary,
}

impl ControlFlow {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::If => "if",
         Self::For => "for",
         Self::While => "while",
         Self::Try => "try",
         Self::With => "with",
         Self::Comprehension => "comprehension",
         Self::Lambda => "lambda",
         Self::Ternary => "ternary",
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Visibility {
   Public,
   Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modifier {
   Static,
   Abstract,
   Final,
}

impl Modifier {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Static => "static",
         Self::Abstract => "abstract",
         Self::Final => "final",
      }
   }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
   pub name:            String,
   pub default_present: bool,
   pub annotation:      Option<String>,
}

impl Parameter {
   /// Render for event details, e.g. `x: int` or `y=...`.
   pub fn describe(&self) -> String {
      let mut out = self.name.clone();
      if let Some(ann) = &self.annotation {
         out.push_str(": ");
         out.push_str(ann);
      }
      if self.default_present {
         out.push_str("=...");
      }
      out
   }
}

/// Behavioral usage counters the differ compares pairwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageCounts {
   pub lambdas:            usize,
   pub comprehensions:     usize,
   pub ternaries:          usize,
   pub assertions:         usize,
   pub augmented_assigns:  usize,
   pub destructured_assigns: usize,
   pub attribute_accesses: usize,
   pub subscript_accesses: usize,
   pub boolean_literals:   usize,
   pub nested_loops:       usize,
   pub higher_order_calls: usize,
   pub yields:             usize,
   pub nonlocal_decls:     usize,
   pub global_decls:       usize,
}

/// Normalized view of one function or method.
#[derive(Debug, Clone)]
pub struct FunctionRecord {
   pub name:           String,
   pub qualified_name: String,
   pub parameters:     Vec<Parameter>,

   pub return_annotation: Option<String>,

   pub decorators:   Vec<String>,
   pub is_async:     bool,
   pub is_generator: bool,

   /// Stable hash of the normalized body (comments and blank lines stripped).
   pub body_digest: String,

   pub complexity_score: u32,
   pub calls:            BTreeSet<String>,
   pub raises:           BTreeSet<String>,

   /// Exception types named in catch/except clauses.
   pub catches: BTreeSet<String>,

   /// Normalized source of each return expression (empty string for bare return).
   pub return_exprs: BTreeSet<String>,

   pub control_flow: BTreeSet<ControlFlow>,
   pub visibility:   Visibility,
   pub modifiers:    BTreeSet<Modifier>,
   pub usage:        UsageCounts,
}

impl FunctionRecord {
   pub fn new(name: &str, qualified_name: &str) -> Self {
      let visibility = if name.starts_with('_') { Visibility::Private } else { Visibility::Public };
      Self {
         name: name.to_string(),
         qualified_name: qualified_name.to_string(),
         parameters: Vec::new(),
         return_annotation: None,
         decorators: Vec::new(),
         is_async: false,
         is_generator: false,
         body_digest: String::new(),
         complexity_score: 1,
         calls: BTreeSet::new(),
         raises: BTreeSet::new(),
         catches: BTreeSet::new(),
         return_exprs: BTreeSet::new(),
         control_flow: BTreeSet::new(),
         visibility,
         modifiers: BTreeSet::new(),
         usage: UsageCounts::default(),
      }
   }

   pub fn node_id(&self) -> String {
      format!("func:{}", self.qualified_name)
   }
}

/// Normalized view of one class.
#[derive(Debug, Clone)]
pub struct ClassRecord {
   pub name:           String,
   pub qualified_name: String,
   pub bases:          Vec<String>,
   pub decorators:     Vec<String>,
   pub methods:        BTreeSet<String>,
   pub attributes:     BTreeSet<String>,
   pub modifiers:      BTreeSet<Modifier>,
}

impl ClassRecord {
   pub fn new(name: &str, qualified_name: &str) -> Self {
      Self {
         name: name.to_string(),
         qualified_name: qualified_name.to_string(),
         bases: Vec::new(),
         decorators: Vec::new(),
         methods: BTreeSet::new(),
         attributes: BTreeSet::new(),
         modifiers: BTreeSet::new(),
      }
   }

   pub fn node_id(&self) -> String {
      format!("class:{}", self.qualified_name)
   }
}

/// One import/include edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Import {
   pub module_path: String,
   pub symbols:     Vec<String>,
   pub alias:       Option<String>,
}

/// Module-level facts.
#[derive(Debug, Clone, Default)]
pub struct ModuleRecord {
   pub imports: Vec<Import>,

   pub top_level_assignments: BTreeSet<String>,

   pub docstring_present: bool,
}

/// The normalized, language-independent view of one file.
///
/// Functions and classes are keyed by node id (`func:<qualified>`,
/// `class:<qualified>`); insertion order follows source order.
#[derive(Debug, Clone, Default)]
pub struct CodeModel {
   pub language: Option<Language>,

   pub functions: IndexMap<String, FunctionRecord>,
   pub classes:   IndexMap<String, ClassRecord>,
   pub module:    ModuleRecord,

   /// Structural token stream with identifiers replaced by role tokens;
   /// consumed by the layer 5a heuristics.
   pub tokens: Vec<String>,

   /// Set when the parser hit a syntax error and returned what it could.
   pub partial: bool,
}

impl CodeModel {
   pub fn empty() -> Self {
      Self::default()
   }

   pub fn is_empty(&self) -> bool {
      self.functions.is_empty() && self.classes.is_empty() && self.module.imports.is_empty()
   }
}

/// Stable hex digest of normalized source, truncated to 16 chars.
pub fn body_digest(normalized: &str) -> String {
   let mut hasher = Sha256::new();
   hasher.update(normalized.as_bytes());
   let digest = hasher.finalize();
   let mut out = String::with_capacity(16);
   for byte in &digest[..8] {
      use std::fmt::Write;
      let _ = write!(out, "{byte:02x}");
   }
   out
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_language_of_known_extensions() {
      assert_eq!(language_of("src/app.py"), Some(Language::Python));
      assert_eq!(language_of("index.php"), Some(Language::Php));
      assert_eq!(language_of("web/main.ts"), Some(Language::JavaScript));
      assert_eq!(language_of("README.md"), None);
      assert_eq!(language_of("Makefile"), None);
   }

   #[test]
   fn test_body_digest_is_stable_and_short() {
      let a = body_digest("return x+1");
      let b = body_digest("return x+1");
      let c = body_digest("return x+2");
      assert_eq!(a, b);
      assert_ne!(a, c);
      assert_eq!(a.len(), 16);
   }

   #[test]
   fn test_underscore_prefix_means_private() {
      assert_eq!(FunctionRecord::new("_helper", "_helper").visibility, Visibility::Private);
      assert_eq!(FunctionRecord::new("run", "run").visibility, Visibility::Public);
   }
}
