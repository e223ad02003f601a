//! Layer 5a: heuristic refactoring-pattern detector.
//!
//! Cross-statement pattern rules over the code models and normalized token
//! streams. Confidences come from fixed rule tables; events under the
//! configured floor are dropped. No I/O.

use crate::config::SvcsConfig;
use crate::events::{Layer, SemanticEvent};
use crate::model::{CodeModel, ControlFlow, FunctionRecord};

const BUILTIN_COLLAPSES: &[&str] = &["abs", "max", "min", "sorted", "sum", "any", "all"];
const MUTATION_SUFFIXES: &[&str] = &[".append", ".extend", ".insert", ".update", ".pop"];

pub const LOOP_TO_COMPREHENSION: &str = "loop_to_comprehension";
pub const CONDITIONAL_TO_BUILTIN: &str = "conditional_to_builtin";
pub const ALGORITHM_OPTIMIZED: &str = "algorithm_optimized";
pub const ERROR_HANDLING_PATTERN_IMPROVED: &str = "error_handling_pattern_improved";
pub const DESIGN_PATTERN_APPLIED: &str = "design_pattern_applied";
pub const MAGIC_NUMBERS_TO_CONSTANTS: &str = "magic_numbers_to_constants";
pub const COMPLEX_EXPRESSION_SIMPLIFIED: &str = "complex_expression_simplified";

/// Detect higher-level refactors between two models of the same file.
pub fn detect_patterns(
   before: &CodeModel,
   after: &CodeModel,
   location: &str,
   config: &SvcsConfig,
) -> Vec<SemanticEvent> {
   let mut events = Vec::new();

   for (id, after_fn) in &after.functions {
      let Some(before_fn) = before.functions.get(id) else { continue };
      detect_loop_to_comprehension(before_fn, after_fn, id, location, &mut events);
      detect_conditional_to_builtin(before_fn, after_fn, id, location, &mut events);
      detect_algorithm_optimized(before_fn, after_fn, id, location, &mut events);
      detect_error_handling_improved(before_fn, after_fn, id, location, &mut events);
      detect_design_pattern(before_fn, after_fn, id, location, &mut events);
      detect_expression_simplified(before_fn, after_fn, id, location, &mut events);
   }

   detect_magic_numbers(before, after, location, &mut events);

   events.retain(|e| e.confidence.unwrap_or(0.0) >= config.min_confidence);
   events
}

fn pattern_event(
   event_type: &str,
   node_id: &str,
   location: &str,
   details: String,
   confidence: f64,
   reasoning: &str,
) -> SemanticEvent {
   SemanticEvent::new(Layer::Heuristic, event_type, node_id, location, details)
      .with_confidence(confidence)
      .with_reasoning(reasoning)
}

/// A for-loop with accumulator appends disappears and a comprehension
/// appears in the same function.
fn detect_loop_to_comprehension(
   before: &FunctionRecord,
   after: &FunctionRecord,
   node_id: &str,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   let had_accumulator_loop = before.control_flow.contains(&ControlFlow::For)
      && before.calls.iter().any(|c| c.ends_with(".append"));
   let gained_comprehension = after.usage.comprehensions > before.usage.comprehensions;
   let loop_gone = !after.control_flow.contains(&ControlFlow::For);

   if had_accumulator_loop && gained_comprehension && loop_gone {
      events.push(pattern_event(
         LOOP_TO_COMPREHENSION,
         node_id,
         location,
         format!(
            "Accumulator loop in '{}' replaced by a comprehension (before: for-loop with append; after: {} comprehension(s))",
            after.name, after.usage.comprehensions
         ),
         0.8,
         "A loop building a collection via append was rewritten as a comprehension",
      ));
   }
}

/// An if/else value selection collapses into a builtin call.
fn detect_conditional_to_builtin(
   before: &FunctionRecord,
   after: &FunctionRecord,
   node_id: &str,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   let lost_branching = before.control_flow.contains(&ControlFlow::If)
      && !after.control_flow.contains(&ControlFlow::If)
      && !after.control_flow.contains(&ControlFlow::Ternary);
   if !lost_branching {
      return;
   }

   let gained: Vec<&str> = BUILTIN_COLLAPSES
      .iter()
      .copied()
      .filter(|builtin| after.calls.contains(*builtin) && !before.calls.contains(*builtin))
      .collect();

   if let Some(builtin) = gained.first() {
      events.push(pattern_event(
         CONDITIONAL_TO_BUILTIN,
         node_id,
         location,
         format!(
            "Conditional logic in '{}' collapsed into builtin '{builtin}()' (before: if/else selection; after: direct call)",
            after.name
         ),
         0.85,
         "Branching value selection replaced by an equivalent builtin",
      ));
   }
}

/// Nested loops decrease while hash-based construction appears, or in-place
/// mutation gives way to an immutable pipeline.
fn detect_algorithm_optimized(
   before: &FunctionRecord,
   after: &FunctionRecord,
   node_id: &str,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   let fewer_nested_loops = after.usage.nested_loops < before.usage.nested_loops;
   let gained_hash_construction = ["set", "dict", "frozenset"]
      .iter()
      .any(|c| after.calls.contains(*c) && !before.calls.contains(*c));

   if fewer_nested_loops && gained_hash_construction {
      events.push(pattern_event(
         ALGORITHM_OPTIMIZED,
         node_id,
         location,
         format!(
            "Nested loops in '{}' reduced ({} -> {}) with hash-based lookup introduced",
            after.name, before.usage.nested_loops, after.usage.nested_loops
         ),
         0.75,
         "Quadratic scan replaced by hash-based membership",
      ));
      return;
   }

   let dropped_mutation = before
      .calls
      .iter()
      .any(|c| MUTATION_SUFFIXES.iter().any(|s| c.ends_with(s)))
      && !after
         .calls
         .iter()
         .any(|c| MUTATION_SUFFIXES.iter().any(|s| c.ends_with(s)));
   let gained_immutable = ["sorted", "tuple", "map", "filter"]
      .iter()
      .any(|c| after.calls.contains(*c) && !before.calls.contains(*c));

   if dropped_mutation && gained_immutable {
      events.push(pattern_event(
         ALGORITHM_OPTIMIZED,
         node_id,
         location,
         format!("In-place mutation in '{}' replaced by an immutable pipeline", after.name),
         0.7,
         "Mutating accumulation replaced by a value-producing construct",
      ));
   }
}

/// Generic catch becomes typed, or manual resource management becomes a
/// scoped acquisition.
fn detect_error_handling_improved(
   before: &FunctionRecord,
   after: &FunctionRecord,
   node_id: &str,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   let before_generic = before.control_flow.contains(&ControlFlow::Try)
      && (before.catches.is_empty() || before.catches.contains("Exception"));
   let after_typed = !after.catches.is_empty() && !after.catches.contains("Exception");

   if before_generic && after_typed {
      events.push(pattern_event(
         ERROR_HANDLING_PATTERN_IMPROVED,
         node_id,
         location,
         format!(
            "Generic exception handling in '{}' narrowed to: {}",
            after.name,
            after.catches.iter().cloned().collect::<Vec<_>>().join(", ")
         ),
         0.85,
         "Catch-all handler replaced by typed handlers",
      ));
      return;
   }

   let manual_before = before.calls.iter().any(|c| c == "open")
      && before.calls.iter().any(|c| c.ends_with(".close"))
      && !before.control_flow.contains(&ControlFlow::With);
   let scoped_after = after.control_flow.contains(&ControlFlow::With);

   if manual_before && scoped_after {
      events.push(pattern_event(
         ERROR_HANDLING_PATTERN_IMPROVED,
         node_id,
         location,
         format!("Manual resource management in '{}' replaced by a with-block", after.name),
         0.8,
         "Explicit open/close pair replaced by scoped acquisition",
      ));
   }
}

/// Decorator wrapping or property accessors introduced.
fn detect_design_pattern(
   before: &FunctionRecord,
   after: &FunctionRecord,
   node_id: &str,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   let accessor = after
      .decorators
      .iter()
      .find(|d| d.as_str() == "property" || d.ends_with(".setter") || d.ends_with(".getter"));
   if let Some(decorator) = accessor {
      if !before.decorators.contains(decorator) {
         events.push(pattern_event(
            DESIGN_PATTERN_APPLIED,
            node_id,
            location,
            format!("Accessor '@{decorator}' introduced on '{}'", after.name),
            0.8,
            "Attribute access mediated through a property accessor",
         ));
         return;
      }
   }

   if before.decorators.is_empty() && !after.decorators.is_empty() {
      events.push(pattern_event(
         DESIGN_PATTERN_APPLIED,
         node_id,
         location,
         format!(
            "Decorator wrapping introduced on '{}': {}",
            after.name,
            after.decorators.join(", ")
         ),
         0.75,
         "Cross-cutting behavior attached via decorator",
      ));
   }
}

/// Complexity drops noticeably while the control-flow shape is unchanged.
fn detect_expression_simplified(
   before: &FunctionRecord,
   after: &FunctionRecord,
   node_id: &str,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   if before.control_flow == after.control_flow
      && before.return_exprs != after.return_exprs
      && after.complexity_score + 2 <= before.complexity_score
   {
      events.push(pattern_event(
         COMPLEX_EXPRESSION_SIMPLIFIED,
         node_id,
         location,
         format!(
            "Expression complexity in '{}' reduced ({} -> {})",
            after.name, before.complexity_score, after.complexity_score
         ),
         0.6,
         "Same control-flow shape with a materially simpler expression",
      ));
   }
}

/// Numeric literals replaced by named uppercase module constants.
fn detect_magic_numbers(
   before: &CodeModel,
   after: &CodeModel,
   location: &str,
   events: &mut Vec<SemanticEvent>,
) {
   let num_count = |model: &CodeModel| model.tokens.iter().filter(|t| t.as_str() == "NUM").count();

   let new_constants: Vec<&String> = after
      .module
      .top_level_assignments
      .difference(&before.module.top_level_assignments)
      .filter(|name| name.len() > 1 && name.chars().all(|c| c.is_ascii_uppercase() || c == '_'))
      .collect();

   if !new_constants.is_empty() && num_count(after) <= num_count(before) {
      events.push(pattern_event(
         MAGIC_NUMBERS_TO_CONSTANTS,
         &format!("module:{location}"),
         location,
         format!(
            "Named constants introduced: {}",
            new_constants.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
         ),
         0.7,
         "Literal values hoisted into named module constants",
      ));
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::parsers::parse_source;

   fn detect(before: &str, after: &str) -> Vec<SemanticEvent> {
      let config = SvcsConfig::default();
      let before_model = parse_source("a.py", before);
      let after_model = parse_source("a.py", after);
      detect_patterns(&before_model, &after_model, "a.py", &config)
   }

   #[test]
   fn test_loop_to_comprehension() {
      let before = "def t(xs):\n    out = []\n    for x in xs:\n        out.append(x*2)\n    return out\n";
      let after = "def t(xs):\n    return [x*2 for x in xs]\n";
      let events = detect(before, after);
      let hit = events
         .iter()
         .find(|e| e.event_type == LOOP_TO_COMPREHENSION)
         .expect("pattern detected");
      assert!(hit.confidence.unwrap() >= 0.7);
      assert_eq!(hit.layer, Layer::Heuristic);
      assert_eq!(hit.node_id, "func:t");
   }

   #[test]
   fn test_conditional_to_builtin() {
      let before = "def pick(a, b):\n    if a > b:\n        result = a\n    else:\n        result = b\n    return result\n";
      let after = "def pick(a, b):\n    return max(a, b)\n";
      let events = detect(before, after);
      assert!(events.iter().any(|e| e.event_type == CONDITIONAL_TO_BUILTIN));
   }

   #[test]
   fn test_generic_catch_narrowed() {
      let before = "def f():\n    try:\n        work()\n    except Exception:\n        pass\n";
      let after = "def f():\n    try:\n        work()\n    except ValueError:\n        pass\n";
      let events = detect(before, after);
      assert!(events.iter().any(|e| e.event_type == ERROR_HANDLING_PATTERN_IMPROVED));
   }

   #[test]
   fn test_property_accessor() {
      let before = "class A:\n    def size(self):\n        return self._size\n";
      let after = "class A:\n    @property\n    def size(self):\n        return self._size\n";
      let events = detect(before, after);
      let hit = events
         .iter()
         .find(|e| e.event_type == DESIGN_PATTERN_APPLIED)
         .expect("accessor detected");
      assert!(hit.confidence.unwrap() >= 0.75);
   }

   #[test]
   fn test_magic_numbers_to_constants() {
      let before = "def area(r):\n    return 3.14159 * r * r\n";
      let after = "PI = 3.14159\n\ndef area(r):\n    return PI * r * r\n";
      let events = detect(before, after);
      assert!(events.iter().any(|e| e.event_type == MAGIC_NUMBERS_TO_CONSTANTS));
   }

   #[test]
   fn test_algorithm_optimized_by_hashing() {
      let before = "def dupes(xs):\n    out = []\n    for i in xs:\n        for j in xs:\n            if i == j:\n                out.append(i)\n    return out\n";
      let after = "def dupes(xs):\n    seen = set(xs)\n    return [x for x in xs if x in seen]\n";
      let events = detect(before, after);
      assert!(events.iter().any(|e| e.event_type == ALGORITHM_OPTIMIZED));
   }

   #[test]
   fn test_identical_input_detects_nothing() {
      let source = "def f(x):\n    return x\n";
      assert!(detect(source, source).is_empty());
   }
}
