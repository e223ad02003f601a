//! Layers 1-4: deterministic structural differ.
//!
//! Compares two code models of the same file and emits core events. All
//! output is a pure function of the inputs and configuration; nothing here
//! does I/O.

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::config::SvcsConfig;
use crate::events::{SemanticEvent, kind};
use crate::model::{ClassRecord, CodeModel, FunctionRecord};

/// Compare two models and emit core-layer events. `location` is the file
/// path both models were parsed from.
pub fn diff_models(
   before: &CodeModel,
   after: &CodeModel,
   location: &str,
   config: &SvcsConfig,
) -> Vec<SemanticEvent> {
   let mut events = Vec::new();

   diff_functions(before, after, location, config, &mut events);
   diff_classes(before, after, location, &mut events);
   diff_module(before, after, location, &mut events);
   diff_functional_usage(before, after, location, config, &mut events);

   events
}

fn diff_functions(
   before: &CodeModel,
   after: &CodeModel,
   location: &str,
   config: &SvcsConfig,
   events: &mut Vec<SemanticEvent>,
) {
   let before_ids: BTreeSet<&String> = before.functions.keys().collect();
   let after_ids: BTreeSet<&String> = after.functions.keys().collect();

   for id in after_ids.difference(&before_ids) {
      let record = &after.functions[*id];
      events.push(SemanticEvent::core(
         kind::NODE_ADDED,
         id.as_str(),
         location,
         format!("Function '{}' added", signature_of(record)),
      ));
   }
   for id in before_ids.difference(&after_ids) {
      let record = &before.functions[*id];
      events.push(SemanticEvent::core(
         kind::NODE_REMOVED,
         id.as_str(),
         location,
         format!("Function '{}' removed", signature_of(record)),
      ));
   }
   for id in before_ids.intersection(&after_ids) {
      // A bug in one comparator must not take down the rest of the file.
      let compared = catch_unwind(AssertUnwindSafe(|| {
         let mut out = Vec::new();
         compare_function(
            &before.functions[*id],
            &after.functions[*id],
            id.as_str(),
            location,
            config,
            &mut out,
         );
         out
      }));
      match compared {
         Ok(out) => events.extend(out),
         Err(_) => events.push(comparator_failure(id.as_str(), location, "function comparator")),
      }
   }
}

fn comparator_failure(node_id: &str, location: &str, which: &str) -> SemanticEvent {
   tracing::error!(node = node_id, which, "comparator panicked");
   SemanticEvent::core(
      kind::ANALYSIS_PARTIAL_FAILURE,
      node_id,
      location,
      format!("Analysis partially failed: {which} crashed for {node_id}"),
   )
}

fn signature_of(record: &FunctionRecord) -> String {
   let params: Vec<String> = record.parameters.iter().map(|p| p.describe()).collect();
   format!("{}({})", record.name, params.join(", "))
}

#[allow(clippy::too_many_lines, reason = "one comparator per event type, linear and flat")]
fn compare_function(
   before: &FunctionRecord,
   after: &FunctionRecord,
   node_id: &str,
   location: &str,
   config: &SvcsConfig,
   events: &mut Vec<SemanticEvent>,
) {
   let mut push = |event_type: &str, details: String| {
      events.push(SemanticEvent::core(event_type, node_id, location, details));
   };

   // Signature: parameter list or annotations.
   if before.parameters != after.parameters
      || before.return_annotation != after.return_annotation
   {
      push(
         kind::SIGNATURE_CHANGED,
         format!("{} -> {}", signature_of(before), signature_of(after)),
      );
   }

   let before_defaults: BTreeSet<&str> = before
      .parameters
      .iter()
      .filter(|p| p.default_present)
      .map(|p| p.name.as_str())
      .collect();
   let after_defaults: BTreeSet<&str> = after
      .parameters
      .iter()
      .filter(|p| p.default_present)
      .map(|p| p.name.as_str())
      .collect();
   let gained: Vec<&&str> = after_defaults.difference(&before_defaults).collect();
   let lost: Vec<&&str> = before_defaults.difference(&after_defaults).collect();
   if !gained.is_empty() {
      push(kind::DEFAULT_PARAMETERS_ADDED, format!("Defaults added for: {}", join(&gained)));
   }
   if !lost.is_empty() {
      push(kind::DEFAULT_PARAMETERS_REMOVED, format!("Defaults removed for: {}", join(&lost)));
   }

   if before.return_exprs != after.return_exprs {
      push(
         kind::RETURN_PATTERN_CHANGED,
         format!(
            "Return statements changed ({} -> {})",
            before.return_exprs.len(),
            after.return_exprs.len()
         ),
      );
   }

   match (before.is_async, after.is_async) {
      (false, true) => push(kind::FUNCTION_MADE_ASYNC, "Function became async".to_string()),
      (true, false) => push(kind::FUNCTION_MADE_SYNC, "Function became synchronous".to_string()),
      _ => {},
   }
   match (before.is_generator, after.is_generator) {
      (false, true) => push(kind::FUNCTION_MADE_GENERATOR, "Function became a generator".to_string()),
      (true, false) => {
         push(kind::GENERATOR_MADE_FUNCTION, "Generator became a plain function".to_string());
      },
      _ => {},
   }

   let before_decorators: BTreeSet<&String> = before.decorators.iter().collect();
   let after_decorators: BTreeSet<&String> = after.decorators.iter().collect();
   let added: Vec<&&String> = after_decorators.difference(&before_decorators).collect();
   let removed: Vec<&&String> = before_decorators.difference(&after_decorators).collect();
   if !added.is_empty() {
      push(kind::DECORATOR_ADDED, format!("Decorators added: {}", join(&added)));
   }
   if !removed.is_empty() {
      push(kind::DECORATOR_REMOVED, format!("Decorators removed: {}", join(&removed)));
   }

   // Exception handling: presence and shape of catch clauses.
   let before_catches = !before.catches.is_empty() || has_try(before);
   let after_catches = !after.catches.is_empty() || has_try(after);
   match (before_catches, after_catches) {
      (false, true) => push(kind::EXCEPTION_HANDLING_ADDED, "Exception handling added".to_string()),
      (true, false) => {
         push(kind::EXCEPTION_HANDLING_REMOVED, "Exception handling removed".to_string());
      },
      (true, true) if before.catches != after.catches => {
         push(
            kind::EXCEPTION_HANDLING_CHANGED,
            format!(
               "Caught exceptions changed: {{{}}} -> {{{}}}",
               join_set(&before.catches),
               join_set(&after.catches)
            ),
         );
      },
      _ => {},
   }

   // Error signaling: raise population.
   match (before.raises.is_empty(), after.raises.is_empty()) {
      (true, false) => push(
         kind::ERROR_HANDLING_INTRODUCED,
         format!("Now raises: {}", join_set(&after.raises)),
      ),
      (false, true) => push(
         kind::ERROR_HANDLING_REMOVED,
         format!("No longer raises: {}", join_set(&before.raises)),
      ),
      (false, false) if before.raises != after.raises => {
         push(
            kind::EXCEPTION_HANDLING_CHANGED,
            format!(
               "Raised exceptions changed: {{{}}} -> {{{}}}",
               join_set(&before.raises),
               join_set(&after.raises)
            ),
         );
      },
      _ => {},
   }

   let calls_added: Vec<&String> = after.calls.difference(&before.calls).collect();
   let calls_removed: Vec<&String> = before.calls.difference(&after.calls).collect();
   if !calls_added.is_empty() {
      push(kind::INTERNAL_CALL_ADDED, format!("Calls added: {}", join(&calls_added)));
   }
   if !calls_removed.is_empty() {
      push(kind::INTERNAL_CALL_REMOVED, format!("Calls removed: {}", join(&calls_removed)));
   }

   if before.control_flow != after.control_flow {
      let gained: Vec<&str> = after
         .control_flow
         .difference(&before.control_flow)
         .map(|f| f.as_str())
         .collect();
      let lost: Vec<&str> = before
         .control_flow
         .difference(&after.control_flow)
         .map(|f| f.as_str())
         .collect();
      push(
         kind::CONTROL_FLOW_CHANGED,
         format!("Control flow changed (+{{{}}} -{{{}}})", gained.join(", "), lost.join(", ")),
      );
   }

   let abs_delta = before.complexity_score.abs_diff(after.complexity_score);
   let rel_delta = if before.complexity_score == 0 {
      f64::from(abs_delta)
   } else {
      f64::from(abs_delta) / f64::from(before.complexity_score)
   };
   if abs_delta > 0
      && (abs_delta >= config.complexity_abs_threshold
         || rel_delta >= config.complexity_rel_threshold)
   {
      push(
         kind::FUNCTION_COMPLEXITY_CHANGED,
         format!("Complexity {} -> {}", before.complexity_score, after.complexity_score),
      );
   }

   usage_delta(&mut push, kind::LAMBDA_USAGE_CHANGED, "lambdas", before.usage.lambdas, after.usage.lambdas);
   usage_delta(
      &mut push,
      kind::COMPREHENSION_USAGE_CHANGED,
      "comprehensions",
      before.usage.comprehensions,
      after.usage.comprehensions,
   );
   usage_delta(&mut push, kind::ASSERTION_USAGE_CHANGED, "assertions", before.usage.assertions, after.usage.assertions);
   usage_delta(
      &mut push,
      kind::ASSIGNMENT_PATTERN_CHANGED,
      "destructuring assignments",
      before.usage.destructured_assigns,
      after.usage.destructured_assigns,
   );
   usage_delta(
      &mut push,
      kind::AUGMENTED_ASSIGNMENT_CHANGED,
      "augmented assignments",
      before.usage.augmented_assigns,
      after.usage.augmented_assigns,
   );
   usage_delta(
      &mut push,
      kind::ATTRIBUTE_ACCESS_CHANGED,
      "attribute accesses",
      before.usage.attribute_accesses,
      after.usage.attribute_accesses,
   );
   usage_delta(
      &mut push,
      kind::SUBSCRIPT_ACCESS_CHANGED,
      "subscript accesses",
      before.usage.subscript_accesses,
      after.usage.subscript_accesses,
   );
   usage_delta(
      &mut push,
      kind::BOOLEAN_LITERAL_USAGE_CHANGED,
      "boolean literals",
      before.usage.boolean_literals,
      after.usage.boolean_literals,
   );

   if before.is_generator && after.is_generator && before.usage.yields != after.usage.yields {
      push(
         kind::YIELD_PATTERN_CHANGED,
         format!("Yield statements {} -> {}", before.usage.yields, after.usage.yields),
      );
   }
}

fn has_try(record: &FunctionRecord) -> bool {
   record.control_flow.contains(&crate::model::ControlFlow::Try)
}

fn usage_delta(
   push: &mut impl FnMut(&str, String),
   event_type: &str,
   what: &str,
   before: usize,
   after: usize,
) {
   if before != after {
      push(event_type, format!("Count of {what}: {before} -> {after}"));
   }
}

fn diff_classes(before: &CodeModel, after: &CodeModel, location: &str, events: &mut Vec<SemanticEvent>) {
   let before_ids: BTreeSet<&String> = before.classes.keys().collect();
   let after_ids: BTreeSet<&String> = after.classes.keys().collect();

   for id in after_ids.difference(&before_ids) {
      let class = &after.classes[*id];
      events.push(SemanticEvent::core(
         kind::NODE_ADDED,
         id.as_str(),
         location,
         format!("Class '{}' added", class.name),
      ));
   }
   for id in before_ids.difference(&after_ids) {
      let class = &before.classes[*id];
      events.push(SemanticEvent::core(
         kind::NODE_REMOVED,
         id.as_str(),
         location,
         format!("Class '{}' removed", class.name),
      ));
   }
   for id in before_ids.intersection(&after_ids) {
      let compared = catch_unwind(AssertUnwindSafe(|| {
         let mut out = Vec::new();
         compare_class(&before.classes[*id], &after.classes[*id], id.as_str(), location, &mut out);
         out
      }));
      match compared {
         Ok(out) => events.extend(out),
         Err(_) => events.push(comparator_failure(id.as_str(), location, "class comparator")),
      }
   }
}

fn compare_class(
   before: &ClassRecord,
   after: &ClassRecord,
   node_id: &str,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   let mut push = |event_type: &str, details: String| {
      events.push(SemanticEvent::core(event_type, node_id, location, details));
   };

   if before.methods != after.methods {
      let added: Vec<&String> = after.methods.difference(&before.methods).collect();
      let removed: Vec<&String> = before.methods.difference(&after.methods).collect();
      push(
         kind::CLASS_METHODS_CHANGED,
         format!("Methods added: {{{}}}; removed: {{{}}}", join(&added), join(&removed)),
      );
   }

   if before.attributes != after.attributes {
      let added: Vec<&String> = after.attributes.difference(&before.attributes).collect();
      let removed: Vec<&String> = before.attributes.difference(&after.attributes).collect();
      push(
         kind::CLASS_ATTRIBUTES_CHANGED,
         format!("Attributes added: {{{}}}; removed: {{{}}}", join(&added), join(&removed)),
      );
   }

   if before.bases != after.bases {
      push(
         kind::INHERITANCE_CHANGED,
         format!("Bases: ({}) -> ({})", before.bases.join(", "), after.bases.join(", ")),
      );
   }

   let before_decorators: BTreeSet<&String> = before.decorators.iter().collect();
   let after_decorators: BTreeSet<&String> = after.decorators.iter().collect();
   let added: Vec<&&String> = after_decorators.difference(&before_decorators).collect();
   let removed: Vec<&&String> = before_decorators.difference(&after_decorators).collect();
   if !added.is_empty() {
      push(kind::DECORATOR_ADDED, format!("Decorators added: {}", join(&added)));
   }
   if !removed.is_empty() {
      push(kind::DECORATOR_REMOVED, format!("Decorators removed: {}", join(&removed)));
   }
}

fn diff_module(before: &CodeModel, after: &CodeModel, location: &str, events: &mut Vec<SemanticEvent>) {
   let module_id = format!("module:{location}");

   let before_imports: BTreeSet<&String> =
      before.module.imports.iter().map(|i| &i.module_path).collect();
   let after_imports: BTreeSet<&String> =
      after.module.imports.iter().map(|i| &i.module_path).collect();

   let added: Vec<&&String> = after_imports.difference(&before_imports).collect();
   let removed: Vec<&&String> = before_imports.difference(&after_imports).collect();
   if !added.is_empty() {
      events.push(SemanticEvent::core(
         kind::DEPENDENCY_ADDED,
         &module_id,
         location,
         format!("Added imports: {}", join(&added)),
      ));
   }
   if !removed.is_empty() {
      events.push(SemanticEvent::core(
         kind::DEPENDENCY_REMOVED,
         &module_id,
         location,
         format!("Removed imports: {}", join(&removed)),
      ));
   }

   if before.module.top_level_assignments != after.module.top_level_assignments {
      let added: Vec<&String> = after
         .module
         .top_level_assignments
         .difference(&before.module.top_level_assignments)
         .collect();
      let removed: Vec<&String> = before
         .module
         .top_level_assignments
         .difference(&after.module.top_level_assignments)
         .collect();
      events.push(SemanticEvent::core(
         kind::GLOBAL_SCOPE_CHANGED,
         &module_id,
         location,
         format!("Globals added: {{{}}}; removed: {{{}}}", join(&added), join(&removed)),
      ));
   }

   let before_nonlocal: usize = before.functions.values().map(|f| f.usage.nonlocal_decls).sum();
   let after_nonlocal: usize = after.functions.values().map(|f| f.usage.nonlocal_decls).sum();
   if before_nonlocal != after_nonlocal {
      events.push(SemanticEvent::core(
         kind::NONLOCAL_SCOPE_CHANGED,
         &module_id,
         location,
         format!("Nonlocal declarations {before_nonlocal} -> {after_nonlocal}"),
      ));
   }
}

fn diff_functional_usage(
   before: &CodeModel,
   after: &CodeModel,
   location: &str,
   config: &SvcsConfig,
   events: &mut Vec<SemanticEvent>,
) {
   let population = |model: &CodeModel| -> usize {
      model
         .functions
         .values()
         .map(|f| f.usage.lambdas + f.usage.comprehensions + f.usage.higher_order_calls)
         .sum()
   };
   let before_total = population(before);
   let after_total = population(after);
   let module_id = format!("module:{location}");
   let threshold = config.functional_usage_threshold;

   if before_total == 0 && after_total >= threshold {
      events.push(SemanticEvent::core(
         kind::FUNCTIONAL_PROGRAMMING_ADOPTED,
         &module_id,
         location,
         format!("Functional constructs introduced ({after_total} uses)"),
      ));
   } else if after_total == 0 && before_total >= threshold {
      events.push(SemanticEvent::core(
         kind::FUNCTIONAL_PROGRAMMING_REMOVED,
         &module_id,
         location,
         format!("Functional constructs removed ({before_total} uses before)"),
      ));
   } else if before_total > 0
      && after_total > 0
      && before_total.abs_diff(after_total) >= threshold
   {
      events.push(SemanticEvent::core(
         kind::FUNCTIONAL_PROGRAMMING_CHANGED,
         &module_id,
         location,
         format!("Functional construct usage {before_total} -> {after_total}"),
      ));
   }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
   items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

fn join_set(set: &BTreeSet<String>) -> String {
   set.iter().cloned().collect::<Vec<_>>().join(", ")
}
