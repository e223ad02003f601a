//! Lightweight regex backend for PHP: functions, classes, includes, and
//! top-level variables. Deep body analysis is reserved for the strong
//! backends; this adapter feeds the structural layers only.

use std::sync::OnceLock;

use regex::Regex;

use super::LanguageAnalyzer;
use crate::model::{ClassRecord, CodeModel, FunctionRecord, Import, Language, Parameter};

pub struct PhpAnalyzer;

fn function_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"function\s+([A-Za-z_]\w*)\s*\(([^)]*)\)").unwrap())
}

fn class_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| {
      Regex::new(r"class\s+([A-Za-z_]\w*)(?:\s+extends\s+([A-Za-z_\\]\w*))?").unwrap()
   })
}

fn variable_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"\$([A-Za-z_]\w*)\s*=[^=]").unwrap())
}

fn include_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r#"(?:include|require)(?:_once)?\s*\(?\s*['"]([^'"]+)['"]"#).unwrap())
}

impl LanguageAnalyzer for PhpAnalyzer {
   fn language(&self) -> Language {
      Language::Php
   }

   fn parse(&self, _path: &str, source: &str) -> CodeModel {
      let mut model = CodeModel { language: Some(Language::Php), ..CodeModel::default() };

      for caps in function_re().captures_iter(source) {
         let name = &caps[1];
         let mut record = FunctionRecord::new(name, name);
         record.parameters = parse_php_params(&caps[2]);
         model.functions.insert(record.node_id(), record);
      }

      for caps in class_re().captures_iter(source) {
         let name = &caps[1];
         let mut class = ClassRecord::new(name, name);
         if let Some(base) = caps.get(2) {
            class.bases.push(base.as_str().to_string());
         }
         model.classes.insert(class.node_id(), class);
      }

      for caps in variable_re().captures_iter(source) {
         model.module.top_level_assignments.insert(caps[1].to_string());
      }

      for caps in include_re().captures_iter(source) {
         model.module.imports.push(Import {
            module_path: caps[1].to_string(),
            symbols:     Vec::new(),
            alias:       None,
         });
      }

      model
   }
}

fn parse_php_params(raw: &str) -> Vec<Parameter> {
   raw.split(',')
      .filter_map(|part| {
         let part = part.trim();
         if part.is_empty() {
            return None;
         }
         let default_present = part.contains('=');
         let name = part
            .split('=')
            .next()
            .unwrap_or("")
            .split_whitespace()
            .find(|token| token.starts_with('$'))?
            .trim_start_matches('&')
            .to_string();
         Some(Parameter { name, default_present, annotation: None })
      })
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_php_functions_and_defaults() {
      let source = "<?php\nfunction hello($name = \"World\") {\n    echo $name;\n}\nfunction goodbye($name) {}\n?>";
      let model = PhpAnalyzer.parse("test.php", source);
      assert!(model.functions.contains_key("func:hello"));
      assert!(model.functions.contains_key("func:goodbye"));
      assert!(model.functions["func:hello"].parameters[0].default_present);
      assert!(!model.functions["func:goodbye"].parameters[0].default_present);
   }

   #[test]
   fn test_php_classes_and_includes() {
      let source = "<?php\nrequire_once 'db.php';\nclass UserManager extends Base {}\n$config = array();\n";
      let model = PhpAnalyzer.parse("test.php", source);
      assert!(model.classes.contains_key("class:UserManager"));
      assert_eq!(model.classes["class:UserManager"].bases, vec!["Base".to_string()]);
      assert_eq!(model.module.imports[0].module_path, "db.php");
      assert!(model.module.top_level_assignments.contains("config"));
   }
}
