//! Lightweight regex backend for JavaScript and TypeScript: declared and
//! arrow functions, classes, imports, and top-level variables.

use std::sync::OnceLock;

use regex::Regex;

use super::LanguageAnalyzer;
use crate::model::{ClassRecord, CodeModel, FunctionRecord, Import, Language, Parameter};

pub struct JavaScriptAnalyzer;

fn declared_fn_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| {
      Regex::new(r"(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*\(([^)]*)\)").unwrap()
   })
}

fn arrow_fn_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| {
      Regex::new(r"(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?\(([^)]*)\)\s*=>")
         .unwrap()
   })
}

fn class_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| {
      Regex::new(r"class\s+([A-Za-z_$][\w$]*)(?:\s+extends\s+([A-Za-z_$][\w$.]*))?").unwrap()
   })
}

fn variable_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"(?m)^(?:const|let|var)\s+([A-Za-z_$][\w$]*)").unwrap())
}

fn import_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| {
      Regex::new(r#"import\s+(?:([\w${},*\s]+)\s+from\s+)?['"]([^'"]+)['"]"#).unwrap()
   })
}

fn require_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap())
}

impl LanguageAnalyzer for JavaScriptAnalyzer {
   fn language(&self) -> Language {
      Language::JavaScript
   }

   fn parse(&self, _path: &str, source: &str) -> CodeModel {
      let mut model = CodeModel { language: Some(Language::JavaScript), ..CodeModel::default() };

      for caps in declared_fn_re().captures_iter(source) {
         let name = &caps[1];
         let mut record = FunctionRecord::new(name, name);
         record.parameters = parse_js_params(&caps[2]);
         record.is_async = caps.get(0).is_some_and(|m| m.as_str().starts_with("async"));
         model.functions.insert(record.node_id(), record);
      }

      for caps in arrow_fn_re().captures_iter(source) {
         let name = &caps[1];
         // Declared functions win when both patterns match the same name.
         let id = format!("func:{name}");
         if !model.functions.contains_key(&id) {
            let mut record = FunctionRecord::new(name, name);
            record.parameters = parse_js_params(&caps[2]);
            record.is_async = caps[0].contains("async");
            model.functions.insert(id, record);
         }
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

      for caps in import_re().captures_iter(source) {
         let symbols = caps.get(1).map_or_else(Vec::new, |m| {
            m.as_str()
               .trim_matches(|c| c == '{' || c == '}' || char::is_whitespace(c))
               .split(',')
               .map(|s| s.trim().to_string())
               .filter(|s| !s.is_empty())
               .collect()
         });
         model.module.imports.push(Import {
            module_path: caps[2].to_string(),
            symbols,
            alias: None,
         });
      }

      for caps in require_re().captures_iter(source) {
         model.module.imports.push(Import {
            module_path: caps[1].to_string(),
            symbols:     Vec::new(),
            alias:       None,
         });
      }

      model
   }
}

fn parse_js_params(raw: &str) -> Vec<Parameter> {
   raw.split(',')
      .filter_map(|part| {
         let part = part.trim();
         if part.is_empty() {
            return None;
         }
         let default_present = part.contains('=');
         let name = part
            .split(['=', ':'])
            .next()?
            .trim()
            .trim_start_matches("...")
            .to_string();
         if name.is_empty() {
            return None;
         }
         Some(Parameter { name, default_present, annotation: None })
      })
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_function_forms() {
      let source = "function add(a, b) { return a + b; }\nconst mul = (a, b) => a * b;\nasync function fetchIt(url) {}\n";
      let model = JavaScriptAnalyzer.parse("test.js", source);
      assert!(model.functions.contains_key("func:add"));
      assert!(model.functions.contains_key("func:mul"));
      assert!(model.functions["func:fetchIt"].is_async);
   }

   #[test]
   fn test_classes_imports_variables() {
      let source = "import { useState } from 'react';\nconst axios = require('axios');\nclass App extends Component {}\nlet counter = 0;\n";
      let model = JavaScriptAnalyzer.parse("test.js", source);
      assert!(model.classes.contains_key("class:App"));
      assert_eq!(model.classes["class:App"].bases, vec!["Component".to_string()]);
      assert_eq!(model.module.imports[0].module_path, "react");
      assert_eq!(model.module.imports[0].symbols, vec!["useState"]);
      assert_eq!(model.module.imports[1].module_path, "axios");
      assert!(model.module.top_level_assignments.contains("counter"));
   }

   #[test]
   fn test_default_parameters() {
      let model = JavaScriptAnalyzer.parse("t.js", "function greet(name = 'World') {}\n");
      assert!(model.functions["func:greet"].parameters[0].default_present);
   }
}
