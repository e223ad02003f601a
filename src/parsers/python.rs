//! Strong Python backend built on tree-sitter.
//!
//! Extracts the full code model: functions with signatures, decorators,
//! call/raise sets, control-flow features and usage counters, classes with
//! bases and attributes, and module-level imports and assignments.

use tree_sitter::{Node, Parser};

use super::LanguageAnalyzer;
use crate::model::{
   ClassRecord, CodeModel, ControlFlow, FunctionRecord, Import, Language, Modifier, Parameter,
   body_digest,
};

pub struct PythonAnalyzer;

impl LanguageAnalyzer for PythonAnalyzer {
   fn language(&self) -> Language {
      Language::Python
   }

   fn parse(&self, _path: &str, source: &str) -> CodeModel {
      let mut model = CodeModel { language: Some(Language::Python), ..CodeModel::default() };

      let mut parser = Parser::new();
      if parser.set_language(tree_sitter_python::language()).is_err() {
         model.partial = true;
         return model;
      }
      let Some(tree) = parser.parse(source, None) else {
         model.partial = true;
         return model;
      };

      let root = tree.root_node();
      model.partial = root.has_error();
      let src = source.as_bytes();

      walk_module(root, src, &mut model);
      model.tokens = role_tokens(root, src);
      model
   }
}

fn text<'a>(node: Node<'_>, src: &'a [u8]) -> &'a str {
   node.utf8_text(src).unwrap_or("")
}

fn walk_module(root: Node<'_>, src: &[u8], model: &mut CodeModel) {
   let mut cursor = root.walk();
   let mut first_statement = true;
   for child in root.named_children(&mut cursor) {
      match child.kind() {
         "comment" => continue,
         "function_definition" => collect_function(child, src, &[], Vec::new(), model),
         "decorated_definition" => collect_decorated(child, src, &[], model),
         "class_definition" => collect_class(child, src, Vec::new(), model),
         "import_statement" => collect_import(child, src, model),
         "import_from_statement" => collect_import_from(child, src, model),
         "expression_statement" => {
            if first_statement
               && child.named_child(0).is_some_and(|n| n.kind() == "string")
            {
               model.module.docstring_present = true;
            }
            collect_top_level_assignment(child, src, model);
         },
         _ => {},
      }
      first_statement = false;
   }
}

fn collect_decorated(node: Node<'_>, src: &[u8], scope: &[String], model: &mut CodeModel) {
   let mut decorators = Vec::new();
   let mut cursor = node.walk();
   for child in node.named_children(&mut cursor) {
      if child.kind() == "decorator" {
         decorators.push(text(child, src).trim_start_matches('@').trim().to_string());
      }
   }
   let Some(definition) = node.child_by_field_name("definition") else { return };
   match definition.kind() {
      "function_definition" => collect_function(definition, src, scope, decorators, model),
      "class_definition" => collect_class_with_decorators(definition, src, scope.to_vec(), decorators, model),
      _ => {},
   }
}

fn collect_function(
   node: Node<'_>,
   src: &[u8],
   scope: &[String],
   decorators: Vec<String>,
   model: &mut CodeModel,
) {
   let Some(name_node) = node.child_by_field_name("name") else { return };
   let name = text(name_node, src).to_string();
   let qualified = qualify(scope, &name);
   let mut record = FunctionRecord::new(&name, &qualified);

   for decorator in &decorators {
      match decorator.as_str() {
         "staticmethod" => {
            record.modifiers.insert(Modifier::Static);
         },
         d if d.ends_with("abstractmethod") => {
            record.modifiers.insert(Modifier::Abstract);
         },
         "final" | "typing.final" => {
            record.modifiers.insert(Modifier::Final);
         },
         _ => {},
      }
   }
   record.decorators = decorators;

   record.is_async = node.child(0).is_some_and(|c| c.kind() == "async");

   if let Some(params) = node.child_by_field_name("parameters") {
      record.parameters = collect_parameters(params, src);
   }
   if let Some(ret) = node.child_by_field_name("return_type") {
      record.return_annotation = Some(text(ret, src).trim().to_string());
   }

   let mut nested = Vec::new();
   if let Some(body) = node.child_by_field_name("body") {
      walk_body(body, src, &mut record, 0, &mut nested);
      record.body_digest = body_digest(&normalized_body(body, src));
   }

   model.functions.insert(record.node_id(), record);

   let mut inner_scope = scope.to_vec();
   inner_scope.push(name);
   for definition in nested {
      match definition.kind() {
         "function_definition" => collect_function(definition, src, &inner_scope, Vec::new(), model),
         "decorated_definition" => collect_decorated(definition, src, &inner_scope, model),
         _ => {},
      }
   }
}

fn collect_parameters(params: Node<'_>, src: &[u8]) -> Vec<Parameter> {
   let mut out = Vec::new();
   let mut cursor = params.walk();
   for param in params.named_children(&mut cursor) {
      match param.kind() {
         "identifier" => out.push(Parameter {
            name:            text(param, src).to_string(),
            default_present: false,
            annotation:      None,
         }),
         "typed_parameter" => {
            let name = param
               .named_child(0)
               .map(|n| text(n, src).to_string())
               .unwrap_or_default();
            let annotation = param
               .child_by_field_name("type")
               .map(|n| text(n, src).trim().to_string());
            out.push(Parameter { name, default_present: false, annotation });
         },
         "default_parameter" => {
            let name = param
               .child_by_field_name("name")
               .map(|n| text(n, src).to_string())
               .unwrap_or_default();
            out.push(Parameter { name, default_present: true, annotation: None });
         },
         "typed_default_parameter" => {
            let name = param
               .child_by_field_name("name")
               .map(|n| text(n, src).to_string())
               .unwrap_or_default();
            let annotation = param
               .child_by_field_name("type")
               .map(|n| text(n, src).trim().to_string());
            out.push(Parameter { name, default_present: true, annotation });
         },
         "list_splat_pattern" | "dictionary_splat_pattern" => out.push(Parameter {
            name:            text(param, src).to_string(),
            default_present: false,
            annotation:      None,
         }),
         _ => {},
      }
   }
   out
}

/// Walk a function body collecting counters and control-flow features.
/// Nested definitions are returned for separate extraction and excluded
/// from the enclosing function's facts.
fn walk_body<'t>(
   node: Node<'t>,
   src: &[u8],
   record: &mut FunctionRecord,
   loop_depth: usize,
   nested: &mut Vec<Node<'t>>,
) {
   let mut cursor = node.walk();
   for child in node.named_children(&mut cursor) {
      let mut next_depth = loop_depth;
      match child.kind() {
         "comment" => continue,
         "function_definition" | "decorated_definition" => {
            nested.push(child);
            continue;
         },
         "class_definition" => continue,
         "call" => {
            if let Some(function) = child.child_by_field_name("function") {
               let callee = text(function, src).to_string();
               if matches!(callee.as_str(), "map" | "filter" | "reduce" | "functools.reduce") {
                  record.usage.higher_order_calls += 1;
               }
               record.calls.insert(callee);
            }
         },
         "raise_statement" => {
            let raised = child.named_child(0).map_or(String::new(), |n| {
               if n.kind() == "call" {
                  n.child_by_field_name("function")
                     .map(|f| text(f, src).to_string())
                     .unwrap_or_default()
               } else {
                  text(n, src).to_string()
               }
            });
            record.raises.insert(raised);
         },
         "return_statement" => {
            let expr = child
               .named_child(0)
               .map_or(String::new(), |n| normalize_expr(text(n, src)));
            record.return_exprs.insert(expr);
         },
         "yield" => {
            record.is_generator = true;
            record.usage.yields += 1;
         },
         "nonlocal_statement" => {
            record.usage.nonlocal_decls += 1;
         },
         "global_statement" => {
            record.usage.global_decls += 1;
         },
         "lambda" => {
            record.usage.lambdas += 1;
            record.control_flow.insert(ControlFlow::Lambda);
         },
         "list_comprehension" | "set_comprehension" | "dictionary_comprehension"
         | "generator_expression" => {
            record.usage.comprehensions += 1;
            record.control_flow.insert(ControlFlow::Comprehension);
            record.complexity_score += 1;
         },
         "conditional_expression" => {
            record.usage.ternaries += 1;
            record.control_flow.insert(ControlFlow::Ternary);
            record.complexity_score += 1;
         },
         "assert_statement" => {
            record.usage.assertions += 1;
         },
         "augmented_assignment" => {
            record.usage.augmented_assigns += 1;
         },
         "assignment" => {
            if child
               .child_by_field_name("left")
               .is_some_and(|l| matches!(l.kind(), "pattern_list" | "tuple_pattern"))
            {
               record.usage.destructured_assigns += 1;
            }
         },
         "attribute" => {
            record.usage.attribute_accesses += 1;
         },
         "subscript" => {
            record.usage.subscript_accesses += 1;
         },
         "true" | "false" => {
            record.usage.boolean_literals += 1;
         },
         "for_statement" => {
            record.control_flow.insert(ControlFlow::For);
            record.complexity_score += 1;
            if loop_depth > 0 {
               record.usage.nested_loops += 1;
            }
            next_depth = loop_depth + 1;
         },
         "while_statement" => {
            record.control_flow.insert(ControlFlow::While);
            record.complexity_score += 1;
            if loop_depth > 0 {
               record.usage.nested_loops += 1;
            }
            next_depth = loop_depth + 1;
         },
         "if_statement" | "elif_clause" => {
            record.control_flow.insert(ControlFlow::If);
            record.complexity_score += 1;
         },
         "try_statement" => {
            record.control_flow.insert(ControlFlow::Try);
         },
         "except_clause" => {
            record.complexity_score += 1;
            if let Some(caught) = child.named_child(0) {
               if caught.kind() != "block" {
                  record.catches.insert(text(caught, src).trim().to_string());
               }
            }
         },
         "with_statement" => {
            record.control_flow.insert(ControlFlow::With);
         },
         "boolean_operator" => {
            record.complexity_score += 1;
         },
         _ => {},
      }
      walk_body(child, src, record, next_depth, nested);
   }
}

fn collect_class(node: Node<'_>, src: &[u8], scope: Vec<String>, model: &mut CodeModel) {
   collect_class_with_decorators(node, src, scope, Vec::new(), model);
}

fn collect_class_with_decorators(
   node: Node<'_>,
   src: &[u8],
   scope: Vec<String>,
   decorators: Vec<String>,
   model: &mut CodeModel,
) {
   let Some(name_node) = node.child_by_field_name("name") else { return };
   let name = text(name_node, src).to_string();
   let qualified = qualify(&scope, &name);
   let mut class = ClassRecord::new(&name, &qualified);
   class.decorators = decorators;

   if let Some(superclasses) = node.child_by_field_name("superclasses") {
      let mut cursor = superclasses.walk();
      for base in superclasses.named_children(&mut cursor) {
         if base.kind() != "comment" {
            class.bases.push(text(base, src).trim().to_string());
         }
      }
      if class.bases.iter().any(|b| b.contains("ABC")) {
         class.modifiers.insert(Modifier::Abstract);
      }
   }

   let mut class_scope = scope;
   class_scope.push(name);

   if let Some(body) = node.child_by_field_name("body") {
      let mut cursor = body.walk();
      for child in body.named_children(&mut cursor) {
         match child.kind() {
            "function_definition" => {
               collect_method(child, src, &class_scope, Vec::new(), &mut class, model);
            },
            "decorated_definition" => {
               let mut method_decorators = Vec::new();
               let mut inner = child.walk();
               for part in child.named_children(&mut inner) {
                  if part.kind() == "decorator" {
                     method_decorators
                        .push(text(part, src).trim_start_matches('@').trim().to_string());
                  }
               }
               if let Some(definition) = child.child_by_field_name("definition") {
                  if definition.kind() == "function_definition" {
                     collect_method(definition, src, &class_scope, method_decorators, &mut class, model);
                  } else if definition.kind() == "class_definition" {
                     collect_class_with_decorators(
                        definition,
                        src,
                        class_scope.clone(),
                        method_decorators,
                        model,
                     );
                  }
               }
            },
            "class_definition" => {
               collect_class(child, src, class_scope.clone(), model);
            },
            "expression_statement" => {
               if let Some(assignment) = child.named_child(0) {
                  if assignment.kind() == "assignment" {
                     collect_class_attribute(assignment, src, &mut class);
                  }
               }
            },
            _ => {},
         }
      }
   }

   model.classes.insert(class.node_id(), class);
}

fn collect_method(
   node: Node<'_>,
   src: &[u8],
   class_scope: &[String],
   decorators: Vec<String>,
   class: &mut ClassRecord,
   model: &mut CodeModel,
) {
   let Some(name_node) = node.child_by_field_name("name") else { return };
   let method_name = text(name_node, src);
   class.methods.insert(format!("func:{}", qualify(class_scope, method_name)));

   // self.<attr> assignments define instance attributes.
   if let Some(body) = node.child_by_field_name("body") {
      collect_self_attributes(body, src, class);
   }

   collect_function(node, src, class_scope, decorators, model);
}

fn collect_self_attributes(node: Node<'_>, src: &[u8], class: &mut ClassRecord) {
   let mut cursor = node.walk();
   for child in node.named_children(&mut cursor) {
      if child.kind() == "assignment" {
         if let Some(left) = child.child_by_field_name("left") {
            if left.kind() == "attribute" {
               let object = left.child_by_field_name("object").map(|n| text(n, src));
               if object == Some("self") {
                  if let Some(attribute) = left.child_by_field_name("attribute") {
                     class.attributes.insert(text(attribute, src).to_string());
                  }
               }
            }
         }
      }
      collect_self_attributes(child, src, class);
   }
}

fn collect_class_attribute(assignment: Node<'_>, src: &[u8], class: &mut ClassRecord) {
   let Some(left) = assignment.child_by_field_name("left") else { return };
   if left.kind() != "identifier" {
      return;
   }
   let name = text(left, src).to_string();
   match assignment.child_by_field_name("type") {
      Some(annotation) => {
         class.attributes.insert(format!("{name}: {}", text(annotation, src).trim()));
      },
      None => {
         class.attributes.insert(name);
      },
   }
}

fn collect_import(node: Node<'_>, src: &[u8], model: &mut CodeModel) {
   let mut cursor = node.walk();
   for child in node.named_children(&mut cursor) {
      match child.kind() {
         "dotted_name" => model.module.imports.push(Import {
            module_path: text(child, src).to_string(),
            symbols:     Vec::new(),
            alias:       None,
         }),
         "aliased_import" => {
            let module_path = child
               .child_by_field_name("name")
               .map(|n| text(n, src).to_string())
               .unwrap_or_default();
            let alias = child
               .child_by_field_name("alias")
               .map(|n| text(n, src).to_string());
            model.module.imports.push(Import { module_path, symbols: Vec::new(), alias });
         },
         _ => {},
      }
   }
}

fn collect_import_from(node: Node<'_>, src: &[u8], model: &mut CodeModel) {
   let module_path = node
      .child_by_field_name("module_name")
      .map(|n| text(n, src).to_string())
      .unwrap_or_default();

   let mut symbols = Vec::new();
   let mut alias = None;
   let mut cursor = node.walk();
   for child in node.named_children(&mut cursor) {
      if Some(child) == node.child_by_field_name("module_name") {
         continue;
      }
      match child.kind() {
         "dotted_name" => symbols.push(text(child, src).to_string()),
         "wildcard_import" => symbols.push("*".to_string()),
         "aliased_import" => {
            if let Some(name) = child.child_by_field_name("name") {
               symbols.push(text(name, src).to_string());
            }
            alias = child.child_by_field_name("alias").map(|n| text(n, src).to_string());
         },
         _ => {},
      }
   }

   model.module.imports.push(Import { module_path, symbols, alias });
}

fn collect_top_level_assignment(statement: Node<'_>, src: &[u8], model: &mut CodeModel) {
   let Some(inner) = statement.named_child(0) else { return };
   if inner.kind() != "assignment" {
      return;
   }
   let Some(left) = inner.child_by_field_name("left") else { return };
   match left.kind() {
      "identifier" => {
         model.module.top_level_assignments.insert(text(left, src).to_string());
      },
      "pattern_list" | "tuple_pattern" => {
         let mut cursor = left.walk();
         for target in left.named_children(&mut cursor) {
            if target.kind() == "identifier" {
               model.module.top_level_assignments.insert(text(target, src).to_string());
            }
         }
      },
      _ => {},
   }
}

fn qualify(scope: &[String], name: &str) -> String {
   if scope.is_empty() {
      name.to_string()
   } else {
      format!("{}.{name}", scope.join("."))
   }
}

/// Body source with comments dropped and whitespace collapsed, so that
/// formatting-only edits hash identically.
fn normalized_body(body: Node<'_>, src: &[u8]) -> String {
   let mut parts = Vec::new();
   collect_leaf_text(body, src, &mut parts);
   parts.join(" ")
}

fn collect_leaf_text(node: Node<'_>, src: &[u8], out: &mut Vec<String>) {
   if node.kind() == "comment" {
      return;
   }
   if node.child_count() == 0 {
      let t = text(node, src).trim();
      if !t.is_empty() {
         out.push(t.to_string());
      }
      return;
   }
   for i in 0..node.child_count() {
      if let Some(child) = node.child(i) {
         collect_leaf_text(child, src, out);
      }
   }
}

fn normalize_expr(expr: &str) -> String {
   expr.split_whitespace().collect::<Vec<_>>().join("")
}

/// Structural token stream with identifiers and literals replaced by role
/// tokens; consumed by the layer 5a heuristics.
fn role_tokens(root: Node<'_>, src: &[u8]) -> Vec<String> {
   let mut tokens = Vec::new();
   collect_role_tokens(root, src, &mut tokens);
   tokens
}

fn collect_role_tokens(node: Node<'_>, src: &[u8], out: &mut Vec<String>) {
   if node.kind() == "comment" {
      return;
   }
   if node.child_count() == 0 {
      let token = match node.kind() {
         "identifier" => "ID".to_string(),
         "integer" | "float" => "NUM".to_string(),
         "string_content" | "string_start" | "string_end" => "STR".to_string(),
         other => other.to_string(),
      };
      if out.last().map(String::as_str) != Some("STR") || token != "STR" {
         out.push(token);
      }
      return;
   }
   for i in 0..node.child_count() {
      if let Some(child) = node.child(i) {
         collect_role_tokens(child, src, out);
      }
   }
}
