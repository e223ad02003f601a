//! Analysis orchestrator: fans one file change out to the analysis layers,
//! merges and de-duplicates their events, and stamps commit metadata plus
//! deterministic event ids.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use sha2::{Digest, Sha256};

use crate::config::SvcsConfig;
use crate::differ;
use crate::events::{CommitInfo, SemanticEvent, kind};
use crate::heuristics;
use crate::llm::{self, LlmTransport};
use crate::model::language_of;
use crate::parsers;

/// Analyze one (path, before, after) triple into an unstamped event set.
///
/// Layers 1-4 and 5a run always (for recognized languages); 5b runs only
/// when a transport is supplied. A panic inside one layer is converted into
/// an `analysis_partial_failure` event and the remaining layers still run.
pub fn analyze_file(
   path: &str,
   before: &[u8],
   after: &[u8],
   config: &SvcsConfig,
   transport: Option<&dyn LlmTransport>,
) -> Vec<SemanticEvent> {
   if before == after {
      return Vec::new();
   }

   let before_text = String::from_utf8_lossy(before);
   let after_text = String::from_utf8_lossy(after);

   let mut events = Vec::new();

   if language_of(path).is_some() {
      let before_model = parsers::parse_source(path, &before_text);
      let after_model = parsers::parse_source(path, &after_text);
      if before_model.partial || after_model.partial {
         tracing::debug!(file = path, "parsed with syntax errors; analysis is partial");
      }

      match catch_unwind(AssertUnwindSafe(|| {
         differ::diff_models(&before_model, &after_model, path, config)
      })) {
         Ok(core_events) => events.extend(core_events),
         Err(_) => events.push(failure_event(path, "structural differ panicked")),
      }

      match catch_unwind(AssertUnwindSafe(|| {
         heuristics::detect_patterns(&before_model, &after_model, path, config)
      })) {
         Ok(pattern_events) => events.extend(pattern_events),
         Err(_) => events.push(failure_event(path, "pattern detector panicked")),
      }
   }

   if let Some(transport) = transport {
      events.extend(llm::detect_abstract_changes(&before_text, &after_text, path, config, transport));
   }

   for event in &mut events {
      if event.node_id.is_empty() {
         event.node_id = format!("module:{path}");
      }
   }

   dedup_events(events)
}

fn failure_event(path: &str, reason: &str) -> SemanticEvent {
   tracing::error!(file = path, reason, "analysis layer failed");
   SemanticEvent::core(
      kind::ANALYSIS_PARTIAL_FAILURE,
      &format!("module:{path}"),
      path,
      format!("Analysis partially failed: {reason}"),
   )
}

/// Drop events with identical (event_type, node_id, location, details),
/// keeping the highest-confidence copy.
fn dedup_events(events: Vec<SemanticEvent>) -> Vec<SemanticEvent> {
   let mut best: HashMap<(String, String, String, String), SemanticEvent> = HashMap::new();
   let mut order: Vec<(String, String, String, String)> = Vec::new();

   for event in events {
      let key = (
         event.event_type.clone(),
         event.node_id.clone(),
         event.location.clone(),
         event.details.clone(),
      );
      let replace = match best.get(&key) {
         Some(existing) => existing.confidence.unwrap_or(1.0) < event.confidence.unwrap_or(1.0),
         None => {
            order.push(key.clone());
            true
         },
      };
      if replace {
         best.insert(key, event);
      }
   }

   order.into_iter().filter_map(|key| best.remove(&key)).collect()
}

/// Stamp commit metadata and deterministic ids, and put the set into its
/// canonical (node_id, event_type) order.
pub fn finalize_events(commit: &CommitInfo, events: &mut Vec<SemanticEvent>) {
   events.sort_by(|a, b| {
      (&a.node_id, &a.event_type, &a.details).cmp(&(&b.node_id, &b.event_type, &b.details))
   });
   for (ordinal, event) in events.iter_mut().enumerate() {
      event.branch = commit.branch.clone();
      event.author = commit.author.clone();
      event.timestamp = commit.timestamp;
      event.event_id = derive_event_id(
         &commit.commit_hash,
         event.layer.as_str(),
         &event.event_type,
         &event.node_id,
         &event.location,
         ordinal,
      );
   }
}

/// First 16 hex chars of
/// `sha256(commit_hash || layer || event_type || node_id || location || ordinal)`.
pub fn derive_event_id(
   commit_hash: &str,
   layer: &str,
   event_type: &str,
   node_id: &str,
   location: &str,
   ordinal: usize,
) -> String {
   let mut hasher = Sha256::new();
   hasher.update(commit_hash.as_bytes());
   hasher.update(layer.as_bytes());
   hasher.update(event_type.as_bytes());
   hasher.update(node_id.as_bytes());
   hasher.update(location.as_bytes());
   hasher.update(ordinal.to_string().as_bytes());
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
   use crate::events::Layer;

   fn commit() -> CommitInfo {
      CommitInfo {
         commit_hash: "a".repeat(40),
         branch:      "main".to_string(),
         author:      "Test <test@example.com>".to_string(),
         timestamp:   1_700_000_000,
         message:     "msg".to_string(),
      }
   }

   #[test]
   fn test_identical_content_yields_no_events() {
      let config = SvcsConfig::default();
      let source = b"def f(x):\n    return x\n";
      assert!(analyze_file("a.py", source, source, &config, None).is_empty());
   }

   #[test]
   fn test_add_function_scenario() {
      let config = SvcsConfig::default();
      let events = analyze_file("a.py", b"", b"def f(x):\n    return x+1\n", &config, None);
      assert!(events.iter().any(|e| e.event_type == kind::NODE_ADDED && e.node_id == "func:f"));
      assert!(events.iter().all(|e| e.location == "a.py"));
   }

   #[test]
   fn test_unknown_language_emits_nothing_structural() {
      let config = SvcsConfig::default();
      let events = analyze_file("data.csv", b"a,b\n1,2\n", b"a,b\n1,3\n", &config, None);
      assert!(events.is_empty());
   }

   #[test]
   fn test_determinism_of_core_and_heuristic_layers() {
      let config = SvcsConfig::default();
      let before = b"def t(xs):\n    out = []\n    for x in xs:\n        out.append(x*2)\n    return out\n";
      let after = b"def t(xs):\n    return [x*2 for x in xs]\n";

      let first = analyze_file("a.py", before, after, &config, None);
      let second = analyze_file("a.py", before, after, &config, None);

      let describe = |events: &[SemanticEvent]| -> Vec<String> {
         events
            .iter()
            .map(|e| format!("{}|{}|{}|{}", e.layer, e.event_type, e.node_id, e.details))
            .collect()
      };
      assert_eq!(describe(&first), describe(&second));
      assert!(first.iter().any(|e| e.layer == Layer::Heuristic));
   }

   #[test]
   fn test_dedup_keeps_highest_confidence() {
      let base = SemanticEvent::new(Layer::Heuristic, "loop_to_comprehension", "func:f", "a.py", "same".to_string());
      let low = base.clone().with_confidence(0.6);
      let high = base.with_confidence(0.9);
      let out = dedup_events(vec![low, high]);
      assert_eq!(out.len(), 1);
      assert!((out[0].confidence.unwrap() - 0.9).abs() < f64::EPSILON);
   }

   #[test]
   fn test_finalize_assigns_stable_ids_and_order() {
      let config = SvcsConfig::default();
      let commit = commit();

      let mut first = analyze_file("a.py", b"", b"def f(x):\n    return x+1\n", &config, None);
      finalize_events(&commit, &mut first);
      let mut second = analyze_file("a.py", b"", b"def f(x):\n    return x+1\n", &config, None);
      finalize_events(&commit, &mut second);

      let ids: Vec<&str> = first.iter().map(|e| e.event_id.as_str()).collect();
      let ids2: Vec<&str> = second.iter().map(|e| e.event_id.as_str()).collect();
      assert_eq!(ids, ids2);
      assert!(ids.iter().all(|id| id.len() == 16));

      // Canonical order: (node_id, event_type) ascending.
      let mut sorted = first.clone();
      sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
      let order: Vec<&str> = first.iter().map(|e| e.event_type.as_str()).collect();
      let expected: Vec<&str> = sorted.iter().map(|e| e.event_type.as_str()).collect();
      assert_eq!(order, expected);

      // Different commits produce different ids.
      let mut other_commit = commit.clone();
      other_commit.commit_hash = "b".repeat(40);
      let mut third = analyze_file("a.py", b"", b"def f(x):\n    return x+1\n", &config, None);
      finalize_events(&other_commit, &mut third);
      assert_ne!(first[0].event_id, third[0].event_id);
   }
}
