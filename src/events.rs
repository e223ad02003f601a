use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Analysis layer that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
   /// Layers 1-4: deterministic structural/syntactic analysis.
   Core,
   /// Layer 5a: heuristic pattern detection.
   Heuristic,
   /// Layer 5b: LLM-backed abstract change detection.
   Llm,
}

impl Layer {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Core => "core",
         Self::Heuristic => "5a",
         Self::Llm => "5b",
      }
   }

   pub const fn description(self) -> &'static str {
      match self {
         Self::Core => "Structural/Syntactic Analysis",
         Self::Heuristic => "Heuristic Pattern Analysis",
         Self::Llm => "LLM Abstract Analysis",
      }
   }

   pub fn parse(s: &str) -> Option<Self> {
      match s {
         "core" => Some(Self::Core),
         "5a" => Some(Self::Heuristic),
         "5b" => Some(Self::Llm),
         _ => None,
      }
   }
}

impl fmt::Display for Layer {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl Serialize for Layer {
   fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
      serializer.serialize_str(self.as_str())
   }
}

impl<'de> Deserialize<'de> for Layer {
   fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
      let s = String::deserialize(deserializer)?;
      Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown layer tag: {s}")))
   }
}

/// A single observable semantic change between two versions of a file.
///
/// Field set matches the note payload wire format; `repository_id` is
/// context-bound and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticEvent {
   pub event_id:   String,
   pub event_type: String,
   pub node_id:    String,
   pub location:   String,
   pub details:    String,
   pub layer:      Layer,

   pub layer_description: String,

   #[serde(default)]
   pub confidence: Option<f64>,
   #[serde(default)]
   pub reasoning:  Option<String>,
   #[serde(default)]
   pub impact:     Option<String>,

   #[serde(default)]
   pub branch:    String,
   #[serde(default)]
   pub author:    String,
   #[serde(default)]
   pub timestamp: i64,

   /// Unknown keys from newer payload versions, preserved on round-trip.
   #[serde(flatten)]
   pub extra: Map<String, Value>,
}

impl SemanticEvent {
   /// Deterministic event from layers 1-4 (confidence is always null there).
   pub fn core(event_type: &str, node_id: &str, location: &str, details: String) -> Self {
      Self::new(Layer::Core, event_type, node_id, location, details)
   }

   pub fn new(layer: Layer, event_type: &str, node_id: &str, location: &str, details: String) -> Self {
      Self {
         event_id: String::new(),
         event_type: event_type.to_string(),
         node_id: node_id.to_string(),
         location: location.to_string(),
         details,
         layer,
         layer_description: layer.description().to_string(),
         confidence: None,
         reasoning: None,
         impact: None,
         branch: String::new(),
         author: String::new(),
         timestamp: 0,
         extra: Map::new(),
      }
   }

   pub fn with_confidence(mut self, confidence: f64) -> Self {
      self.confidence = Some(confidence);
      self
   }

   pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
      self.reasoning = Some(reasoning.into());
      self
   }

   pub fn with_impact(mut self, impact: impl Into<String>) -> Self {
      self.impact = Some(impact.into());
      self
   }

   /// Canonical sort key used for note payloads and in-commit ordering.
   pub fn sort_key(&self) -> (&str, &str, &str) {
      (&self.node_id, &self.event_type, &self.event_id)
   }
}

/// Commit metadata row as stored alongside events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
   pub commit_hash: String,
   pub branch:      String,
   pub author:      String,
   pub timestamp:   i64,
   pub message:     String,
}

/// Canonical core event type tags (layers 1-4).
pub mod kind {
   pub const FILE_ADDED: &str = "file_added";
   pub const FILE_REMOVED: &str = "file_removed";
   pub const FILE_RENAMED: &str = "file_renamed";
   pub const NODE_ADDED: &str = "node_added";
   pub const NODE_REMOVED: &str = "node_removed";
   pub const SIGNATURE_CHANGED: &str = "signature_changed";
   pub const DEFAULT_PARAMETERS_ADDED: &str = "default_parameters_added";
   pub const DEFAULT_PARAMETERS_REMOVED: &str = "default_parameters_removed";
   pub const RETURN_PATTERN_CHANGED: &str = "return_pattern_changed";
   pub const FUNCTION_MADE_ASYNC: &str = "function_made_async";
   pub const FUNCTION_MADE_SYNC: &str = "function_made_sync";
   pub const FUNCTION_MADE_GENERATOR: &str = "function_made_generator";
   pub const GENERATOR_MADE_FUNCTION: &str = "generator_made_function";
   pub const DECORATOR_ADDED: &str = "decorator_added";
   pub const DECORATOR_REMOVED: &str = "decorator_removed";
   pub const EXCEPTION_HANDLING_ADDED: &str = "exception_handling_added";
   pub const EXCEPTION_HANDLING_REMOVED: &str = "exception_handling_removed";
   pub const EXCEPTION_HANDLING_CHANGED: &str = "exception_handling_changed";
   pub const ERROR_HANDLING_INTRODUCED: &str = "error_handling_introduced";
   pub const ERROR_HANDLING_REMOVED: &str = "error_handling_removed";
   pub const INTERNAL_CALL_ADDED: &str = "internal_call_added";
   pub const INTERNAL_CALL_REMOVED: &str = "internal_call_removed";
   pub const CONTROL_FLOW_CHANGED: &str = "control_flow_changed";
   pub const FUNCTION_COMPLEXITY_CHANGED: &str = "function_complexity_changed";
   pub const LAMBDA_USAGE_CHANGED: &str = "lambda_usage_changed";
   pub const COMPREHENSION_USAGE_CHANGED: &str = "comprehension_usage_changed";
   pub const YIELD_PATTERN_CHANGED: &str = "yield_pattern_changed";
   pub const ASSERTION_USAGE_CHANGED: &str = "assertion_usage_changed";
   pub const ASSIGNMENT_PATTERN_CHANGED: &str = "assignment_pattern_changed";
   pub const AUGMENTED_ASSIGNMENT_CHANGED: &str = "augmented_assignment_changed";
   pub const ATTRIBUTE_ACCESS_CHANGED: &str = "attribute_access_changed";
   pub const SUBSCRIPT_ACCESS_CHANGED: &str = "subscript_access_changed";
   pub const BOOLEAN_LITERAL_USAGE_CHANGED: &str = "boolean_literal_usage_changed";
   pub const CLASS_METHODS_CHANGED: &str = "class_methods_changed";
   pub const CLASS_ATTRIBUTES_CHANGED: &str = "class_attributes_changed";
   pub const INHERITANCE_CHANGED: &str = "inheritance_changed";
   pub const DEPENDENCY_ADDED: &str = "dependency_added";
   pub const DEPENDENCY_REMOVED: &str = "dependency_removed";
   pub const GLOBAL_SCOPE_CHANGED: &str = "global_scope_changed";
   pub const NONLOCAL_SCOPE_CHANGED: &str = "nonlocal_scope_changed";
   pub const FUNCTIONAL_PROGRAMMING_ADOPTED: &str = "functional_programming_adopted";
   pub const FUNCTIONAL_PROGRAMMING_CHANGED: &str = "functional_programming_changed";
   pub const FUNCTIONAL_PROGRAMMING_REMOVED: &str = "functional_programming_removed";
   pub const ANALYSIS_PARTIAL_FAILURE: &str = "analysis_partial_failure";
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_layer_round_trip() {
      for layer in [Layer::Core, Layer::Heuristic, Layer::Llm] {
         assert_eq!(Layer::parse(layer.as_str()), Some(layer));
      }
      assert_eq!(Layer::parse("5c"), None);
   }

   #[test]
   fn test_event_serde_preserves_unknown_keys() {
      let json = r#"{
         "event_id": "abc",
         "event_type": "node_added",
         "node_id": "func:f",
         "location": "a.py",
         "details": "added",
         "layer": "core",
         "layer_description": "Structural/Syntactic Analysis",
         "confidence": null,
         "branch": "main",
         "author": "A <a@x>",
         "timestamp": 1700000000,
         "future_field": {"nested": true}
      }"#;
      let event: SemanticEvent = serde_json::from_str(json).unwrap();
      assert_eq!(event.extra.get("future_field").and_then(|v| v.get("nested")), Some(&Value::Bool(true)));
      let out = serde_json::to_value(&event).unwrap();
      assert_eq!(out.get("future_field").and_then(|v| v.get("nested")), Some(&Value::Bool(true)));
   }

   #[test]
   fn test_core_event_has_null_confidence() {
      let event = SemanticEvent::core(kind::NODE_ADDED, "func:f", "a.py", "added".to_string());
      assert!(event.confidence.is_none());
      assert_eq!(event.layer_description, "Structural/Syntactic Analysis");
   }
}
