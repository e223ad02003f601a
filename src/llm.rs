//! Layer 5b: LLM-backed abstract-change detection.
//!
//! A triviality gate keeps obviously mechanical changes away from the model;
//! everything else is sent as a before/after pair with a JSON-response
//! instruction. Transport is a trait so tests can record calls instead of
//! talking HTTP. LLM failures never fail a commit: they log and yield an
//! empty event set.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::config::SvcsConfig;
use crate::error::{Result, SvcsError};
use crate::events::{Layer, SemanticEvent};

/// Change types the model is allowed to report.
const ALLOWED_CHANGE_TYPES: &[&str] = &[
   "algorithm_optimization",
   "design_pattern",
   "readability_improvement",
   "architecture_change",
   "abstraction_improvement",
   "performance_optimization",
   "maintainability_improvement",
   "error_strategy_change",
];

/// Abstraction over the LLM call so tests can inject a recorder.
pub trait LlmTransport: Send + Sync {
   fn complete(&self, prompt: &str) -> Result<String>;
}

/// Why the triviality gate skipped a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
   Analyze,
   TinyFile,
   TinyChange,
   FormattingOnly,
   LiteralOnly,
   BelowComplexityFloor,
}

/// Decide whether a change is worth an LLM call.
pub fn gate_change(before: &str, after: &str) -> GateDecision {
   let before_lines = line_count(before);
   let after_lines = line_count(after);

   if before_lines <= 5 && after_lines <= 5 {
      return GateDecision::TinyFile;
   }

   let lines_changed = before_lines.abs_diff(after_lines);
   if lines_changed <= 2 && before_lines.max(after_lines) <= 10 {
      return GateDecision::TinyChange;
   }

   if normalize(before) == normalize(after) {
      return GateDecision::FormattingOnly;
   }

   if only_literal_changes(before, after) {
      return GateDecision::LiteralOnly;
   }

   if structural_score(before) + structural_score(after) < 3 {
      return GateDecision::BelowComplexityFloor;
   }

   GateDecision::Analyze
}

fn line_count(code: &str) -> usize {
   if code.is_empty() { 0 } else { code.lines().count() }
}

/// Comments and whitespace stripped for equality comparison.
fn normalize(code: &str) -> String {
   code
      .lines()
      .map(|line| {
         let without_comment = line.split('#').next().unwrap_or("");
         without_comment.split_whitespace().collect::<String>()
      })
      .filter(|line| !line.is_empty())
      .collect::<Vec<_>>()
      .join("\n")
}

/// True when every differing line pair differs only in a literal value.
fn only_literal_changes(before: &str, after: &str) -> bool {
   let before_lines: Vec<&str> = before.lines().collect();
   let after_lines: Vec<&str> = after.lines().collect();
   if before_lines.len() != after_lines.len() {
      return false;
   }

   let mut any_change = false;
   for (b, a) in before_lines.iter().zip(&after_lines) {
      if b.trim() == a.trim() {
         continue;
      }
      any_change = true;
      if strip_literals(b) != strip_literals(a) {
         return false;
      }
   }
   any_change
}

/// Replace numeric and quoted literals by placeholders.
fn strip_literals(line: &str) -> String {
   let mut out = String::with_capacity(line.len());
   let mut chars = line.chars().peekable();
   while let Some(c) = chars.next() {
      match c {
         '"' | '\'' => {
            out.push('S');
            while let Some(&n) = chars.peek() {
               chars.next();
               if n == c {
                  break;
               }
            }
         },
         '0'..='9' => {
            out.push('N');
            while chars.peek().is_some_and(|n| n.is_ascii_digit() || *n == '.') {
               chars.next();
            }
         },
         other if other.is_whitespace() => {},
         other => out.push(other),
      }
   }
   out
}

/// Count of structural keywords across both sides (class/def/import/try/
/// for/while/with/decorator occurrences).
fn structural_score(code: &str) -> usize {
   code
      .lines()
      .map(|line| {
         let trimmed = line.trim_start();
         usize::from(
            trimmed.starts_with("class ")
               || trimmed.starts_with("def ")
               || trimmed.starts_with("async def ")
               || trimmed.starts_with("import ")
               || trimmed.starts_with("from ")
               || trimmed.starts_with("try")
               || trimmed.starts_with("for ")
               || trimmed.starts_with("while ")
               || trimmed.starts_with("with ")
               || trimmed.starts_with('@'),
         )
      })
      .sum()
}

/// Truncate at line boundaries to at most `max_chars`.
pub fn smart_truncate(code: &str, max_chars: usize) -> String {
   if code.len() <= max_chars {
      return code.to_string();
   }
   let mut out = String::new();
   for line in code.lines() {
      if out.len() + line.len() + 1 > max_chars.saturating_sub(32) {
         out.push_str("# ... [truncated for analysis] ...\n");
         break;
      }
      out.push_str(line);
      out.push('\n');
   }
   out
}

#[derive(Debug, Deserialize)]
struct AbstractChange {
   change_type:     String,
   confidence:      f64,
   description:     String,
   reasoning:       String,
   impact:          String,
   before_abstract: String,
   after_abstract:  String,
}

/// Blocking HTTP transport against an Anthropic-compatible messages API.
pub struct HttpTransport {
   client:  reqwest::blocking::Client,
   url:     String,
   api_key: String,
   model:   String,
}

impl HttpTransport {
   pub fn new(config: &SvcsConfig) -> Result<Self> {
      let api_key = config
         .llm_api_key
         .clone()
         .ok_or_else(|| SvcsError::Other("LLM API key not configured".to_string()))?;
      let client = reqwest::blocking::Client::builder()
         .timeout(Duration::from_secs(config.llm_timeout_secs))
         .connect_timeout(Duration::from_secs(config.llm_connect_timeout_secs))
         .build()
         .map_err(SvcsError::HttpError)?;
      let trimmed = config.llm_api_url.trim_end_matches('/');
      let url = if trimmed.ends_with("/v1") {
         format!("{trimmed}/messages")
      } else {
         format!("{trimmed}/v1/messages")
      };
      Ok(Self { client, url, api_key, model: config.llm_model.clone() })
   }
}

impl LlmTransport for HttpTransport {
   fn complete(&self, prompt: &str) -> Result<String> {
      let request = serde_json::json!({
         "model": self.model,
         "max_tokens": 1500,
         "messages": [{ "role": "user", "content": prompt }],
      });

      let response = self
         .client
         .post(&self.url)
         .header("content-type", "application/json")
         .header("anthropic-version", "2023-06-01")
         .header("x-api-key", &self.api_key)
         .json(&request)
         .send()
         .map_err(SvcsError::HttpError)?;

      let status = response.status();
      let body = response.text().map_err(SvcsError::HttpError)?;
      if !status.is_success() {
         return Err(SvcsError::ApiError { status: status.as_u16(), body });
      }

      let value: Value = serde_json::from_str(&body)?;
      let text = value
         .get("content")
         .and_then(|c| c.as_array())
         .and_then(|items| {
            items
               .iter()
               .find(|i| i.get("type").and_then(Value::as_str) == Some("text"))
         })
         .and_then(|i| i.get("text"))
         .and_then(Value::as_str)
         .unwrap_or("")
         .to_string();
      Ok(text)
   }
}

/// Run layer 5b for one file change. Returns an empty set when the gate
/// skips, the layer is disabled, or the call fails.
pub fn detect_abstract_changes(
   before: &str,
   after: &str,
   location: &str,
   config: &SvcsConfig,
   transport: &dyn LlmTransport,
) -> Vec<SemanticEvent> {
   if before == after {
      return Vec::new();
   }

   let decision = gate_change(before, after);
   if decision != GateDecision::Analyze {
      tracing::debug!(file = location, ?decision, "layer 5b gated");
      return Vec::new();
   }

   let prompt = build_prompt(before, after, location, config.llm_max_code_chars);
   tracing::info!(file = location, prompt_chars = prompt.len(), model = %config.llm_model, "layer 5b inference");

   let response = match call_with_retries(transport, &prompt, config) {
      Ok(response) => response,
      Err(e) => {
         tracing::warn!(file = location, error = %e, "layer 5b call failed; continuing without abstract events");
         return Vec::new();
      },
   };

   match parse_response(&response, location, config.min_confidence) {
      Ok(events) => {
         tracing::info!(file = location, events = events.len(), "layer 5b complete");
         events
      },
      Err(e) => {
         tracing::warn!(file = location, error = %e, "layer 5b response unparseable; ignoring");
         Vec::new()
      },
   }
}

fn call_with_retries(
   transport: &dyn LlmTransport,
   prompt: &str,
   config: &SvcsConfig,
) -> Result<String> {
   let mut attempt = 0;
   loop {
      attempt += 1;
      match transport.complete(prompt) {
         Ok(response) => return Ok(response),
         Err(e) if attempt < config.llm_max_retries => {
            let backoff_ms = config.llm_initial_backoff_ms * (1 << (attempt - 1));
            tracing::warn!(error = %e, attempt, backoff_ms, "retrying LLM call");
            std::thread::sleep(Duration::from_millis(backoff_ms));
         },
         Err(e) => {
            return Err(SvcsError::ApiRetryExhausted {
               retries: config.llm_max_retries,
               source:  Box::new(e),
            });
         },
      }
   }
}

fn build_prompt(before: &str, after: &str, location: &str, max_chars: usize) -> String {
   let before = smart_truncate(before, max_chars);
   let after = smart_truncate(after, max_chars);
   let types = ALLOWED_CHANGE_TYPES.join("|");
   format!(
      "Analyze the semantic evolution of this code change and detect ABSTRACT changes that cannot \
       be detected programmatically.\n\nFILE: {location}\n\nBEFORE CODE:\n```\n{before}\n```\n\n\
       AFTER CODE:\n```\n{after}\n```\n\nRespond with a JSON object only:\n{{\n  \
       \"abstract_changes\": [\n    {{\n      \"change_type\": \"{types}\",\n      \
       \"confidence\": 0.0,\n      \"description\": \"...\",\n      \"reasoning\": \"...\",\n      \
       \"impact\": \"low|medium|high|critical\",\n      \"before_abstract\": \"...\",\n      \
       \"after_abstract\": \"...\"\n    }}\n  ]\n}}\n\nOnly report changes that require semantic \
       understanding beyond syntax analysis."
   )
}

fn parse_response(response: &str, location: &str, min_confidence: f64) -> Result<Vec<SemanticEvent>> {
   let json_text = extract_json_object(response)
      .ok_or_else(|| SvcsError::Other("no JSON object in LLM response".to_string()))?;
   let value: Value = serde_json::from_str(json_text)?;

   let mut events = Vec::new();
   let changes = value
      .get("abstract_changes")
      .and_then(Value::as_array)
      .cloned()
      .unwrap_or_default();

   for raw in changes {
      let Ok(change) = serde_json::from_value::<AbstractChange>(raw) else {
         tracing::debug!("dropping abstract change with missing fields");
         continue;
      };
      if !ALLOWED_CHANGE_TYPES.contains(&change.change_type.as_str()) {
         continue;
      }
      if !(0.0..=1.0).contains(&change.confidence) || change.confidence < min_confidence {
         continue;
      }

      let details = format!(
         "{} (before: {}; after: {})",
         change.description, change.before_abstract, change.after_abstract
      );
      let mut event = SemanticEvent::new(
         Layer::Llm,
         &format!("abstract_{}", change.change_type),
         &format!("module:{location}"),
         location,
         details,
      )
      .with_confidence(change.confidence)
      .with_reasoning(change.reasoning);
      if let Some(impact) = normalize_impact(&change.impact) {
         event = event.with_impact(impact);
      }
      events.push(event);
   }

   Ok(events)
}

fn normalize_impact(raw: &str) -> Option<&'static str> {
   match raw.trim().to_lowercase().as_str() {
      "low" => Some("low"),
      "medium" => Some("medium"),
      "high" => Some("high"),
      "critical" => Some("critical"),
      _ => None,
   }
}

/// First balanced JSON object in free-form model output.
fn extract_json_object(text: &str) -> Option<&str> {
   let start = text.find('{')?;
   let bytes = text.as_bytes();
   let mut depth = 0usize;
   let mut in_string = false;
   let mut escaped = false;

   for (offset, &byte) in bytes[start..].iter().enumerate() {
      if in_string {
         if escaped {
            escaped = false;
         } else if byte == b'\\' {
            escaped = true;
         } else if byte == b'"' {
            in_string = false;
         }
         continue;
      }
      match byte {
         b'"' => in_string = true,
         b'{' => depth += 1,
         b'}' => {
            depth -= 1;
            if depth == 0 {
               return Some(&text[start..=start + offset]);
            }
         },
         _ => {},
      }
   }
   None
}

#[cfg(test)]
mod tests {
   use std::sync::Mutex;

   use super::*;

   /// Transport that records prompts and replays a canned response.
   struct RecordingTransport {
      calls:    Mutex<Vec<String>>,
      response: String,
   }

   impl RecordingTransport {
      fn new(response: &str) -> Self {
         Self { calls: Mutex::new(Vec::new()), response: response.to_string() }
      }

      fn call_count(&self) -> usize {
         self.calls.lock().unwrap().len()
      }
   }

   impl LlmTransport for RecordingTransport {
      fn complete(&self, prompt: &str) -> Result<String> {
         self.calls.lock().unwrap().push(prompt.to_string());
         Ok(self.response.clone())
      }
   }

   #[test]
   fn test_gate_skips_tiny_files() {
      // A 3-line change to a 4-line file must not reach the transport.
      let before = "a = 1\nb = 2\nc = 3\nd = 4\n";
      let after = "a = 9\nb = 8\nc = 7\nd = 4\n";
      let transport = RecordingTransport::new("{}");
      let config = SvcsConfig::default();
      let events = detect_abstract_changes(before, after, "a.py", &config, &transport);
      assert!(events.is_empty());
      assert_eq!(transport.call_count(), 0);
   }

   #[test]
   fn test_gate_skips_formatting_only() {
      let before = "def f(x):\n    return x + 1  # add one\n".repeat(6);
      let after = "def f(x):\n    return x+1\n".repeat(6);
      assert_eq!(gate_change(&before, &after), GateDecision::FormattingOnly);
   }

   #[test]
   fn test_gate_skips_literal_only_changes() {
      let before = "def f():\n    return 10\n\ndef g():\n    return 'abc'\n\ndef h():\n    return 1\n\ndef i():\n    return 2\n";
      let after = "def f():\n    return 20\n\ndef g():\n    return 'xyz'\n\ndef h():\n    return 1\n\ndef i():\n    return 2\n";
      assert_eq!(gate_change(before, after), GateDecision::LiteralOnly);
   }

   #[test]
   fn test_gate_requires_structural_density() {
      let before = "x = compute()\ny = x * 2\nz = y - 3\nw = z + 1\nv = w * 9\nu = v - 2\nt = u + 7\ns = t * 3\nr = s - 1\nq = r + 4\np = q * 2\n";
      let after = "x = compute()\ny = x * 3\nz = y - pivot()\nw = z + shift()\nv = w * 9\nu = v - 2\nt = u + 7\ns = t * 3\nr = s - 1\nq = r + 4\np = q * 2\n";
      assert_eq!(gate_change(before, after), GateDecision::BelowComplexityFloor);
   }

   fn non_trivial_pair() -> (String, String) {
      let before = "import os\n\ndef scan(paths):\n    found = []\n    for p in paths:\n        for q in paths:\n            if p == q:\n                found.append(p)\n    return found\n".to_string();
      let after = "import os\n\ndef scan(paths):\n    seen = set(paths)\n    with timer():\n        return [p for p in paths if p in seen]\n".to_string();
      (before, after)
   }

   #[test]
   fn test_parses_json_with_surrounding_prose() {
      let (before, after) = non_trivial_pair();
      let response = r#"Here is my analysis:
{
  "abstract_changes": [
    {
      "change_type": "algorithm_optimization",
      "confidence": 0.9,
      "description": "Quadratic scan replaced by set membership",
      "reasoning": "Nested loops became a hash lookup",
      "impact": "high",
      "before_abstract": "O(n^2) comparison",
      "after_abstract": "O(n) membership"
    },
    {
      "change_type": "readability_improvement",
      "confidence": 0.4,
      "description": "too weak to keep",
      "reasoning": "r",
      "impact": "low",
      "before_abstract": "b",
      "after_abstract": "a"
    }
  ]
}
Hope that helps!"#;
      let transport = RecordingTransport::new(response);
      let config = SvcsConfig::default();
      let events = detect_abstract_changes(&before, &after, "scan.py", &config, &transport);
      assert_eq!(transport.call_count(), 1);
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].event_type, "abstract_algorithm_optimization");
      assert_eq!(events[0].layer, Layer::Llm);
      assert_eq!(events[0].impact.as_deref(), Some("high"));
      assert!(events[0].confidence.unwrap() >= 0.6);
   }

   #[test]
   fn test_unknown_change_types_dropped() {
      let (before, after) = non_trivial_pair();
      let response = r#"{"abstract_changes": [{"change_type": "vibes_improvement", "confidence": 0.9, "description": "d", "reasoning": "r", "impact": "low", "before_abstract": "b", "after_abstract": "a"}]}"#;
      let transport = RecordingTransport::new(response);
      let config = SvcsConfig::default();
      let events = detect_abstract_changes(&before, &after, "scan.py", &config, &transport);
      assert!(events.is_empty());
   }

   #[test]
   fn test_garbage_response_yields_no_events() {
      let (before, after) = non_trivial_pair();
      let transport = RecordingTransport::new("I could not find anything interesting.");
      let config = SvcsConfig::default();
      let events = detect_abstract_changes(&before, &after, "scan.py", &config, &transport);
      assert!(events.is_empty());
   }

   #[test]
   fn test_smart_truncate_respects_line_boundaries() {
      let code = "line one is here\n".repeat(400);
      let truncated = smart_truncate(&code, 2000);
      assert!(truncated.len() <= 2000);
      assert!(truncated.ends_with("[truncated for analysis] ...\n"));
      for line in truncated.lines().take(3) {
         assert!(line == "line one is here" || line.starts_with("# ..."));
      }
   }

   #[test]
   fn test_extract_json_handles_braces_in_strings() {
      let text = r#"prefix {"a": "value with } brace", "b": 2} suffix"#;
      let json = extract_json_object(text).unwrap();
      let value: Value = serde_json::from_str(json).unwrap();
      assert_eq!(value.get("b"), Some(&Value::from(2)));
   }
}
