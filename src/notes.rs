//! Notes codec and synchronization.
//!
//! Each analyzed commit gets one JSON payload attached under
//! `refs/notes/svcs-semantic`. Object keys are sorted and the event list is
//! in canonical order, so equal event sets encode identically. Fetches land
//! on a staging ref and are union-merged per commit by `event_id`; the
//! local tree is never overwritten wholesale.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SvcsError};
use crate::events::{CommitInfo, SemanticEvent};
use crate::git::Git;
use crate::store::SemanticStore;

pub const NOTES_REF: &str = "refs/notes/svcs-semantic";
const INCOMING_REF: &str = "refs/notes/svcs-semantic-incoming";
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Maximum accepted payload size for incoming notes (update-hook guard).
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// The full event set of one commit, as attached to the notes ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotePayload {
   pub schema_version: u32,
   pub commit_hash:    String,

   /// ISO-8601 UTC encode time.
   pub created_at: String,

   pub semantic_events: Vec<SemanticEvent>,

   /// Unknown keys from newer producers, preserved on round-trip.
   #[serde(flatten)]
   pub extra: Map<String, Value>,
}

impl NotePayload {
   pub fn new(commit_hash: &str, mut events: Vec<SemanticEvent>) -> Self {
      events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
      Self {
         schema_version:  PAYLOAD_SCHEMA_VERSION,
         commit_hash:     commit_hash.to_string(),
         created_at:      Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
         semantic_events: events,
         extra:           Map::new(),
      }
   }

   /// Canonical UTF-8 encoding: pretty-printed JSON with sorted object keys.
   pub fn encode(&self) -> Result<String> {
      // Round-tripping through Value sorts object keys lexicographically.
      let value = serde_json::to_value(self)?;
      let mut text = serde_json::to_string_pretty(&value)?;
      text.push('\n');
      Ok(text)
   }

   /// Parse and validate an incoming payload.
   pub fn decode(raw: &str, commit_hint: &str) -> Result<Self> {
      if raw.len() > MAX_PAYLOAD_BYTES {
         return Err(SvcsError::MalformedNote {
            commit: commit_hint.to_string(),
            reason: format!("payload exceeds {MAX_PAYLOAD_BYTES} bytes"),
         });
      }
      let payload: Self = serde_json::from_str(raw).map_err(|e| SvcsError::MalformedNote {
         commit: commit_hint.to_string(),
         reason: e.to_string(),
      })?;
      if payload.schema_version == 0 || payload.schema_version > PAYLOAD_SCHEMA_VERSION {
         return Err(SvcsError::MalformedNote {
            commit: commit_hint.to_string(),
            reason: format!("unsupported schema_version {}", payload.schema_version),
         });
      }
      if payload.commit_hash.is_empty() {
         return Err(SvcsError::MalformedNote {
            commit: commit_hint.to_string(),
            reason: "missing commit_hash".to_string(),
         });
      }
      Ok(payload)
   }

   /// Commit metadata reconstructed from the event set (message is not part
   /// of the payload).
   pub fn commit_info(&self) -> CommitInfo {
      let first = self.semantic_events.first();
      CommitInfo {
         commit_hash: self.commit_hash.clone(),
         branch:      first.map(|e| e.branch.clone()).unwrap_or_default(),
         author:      first.map(|e| e.author.clone()).unwrap_or_default(),
         timestamp:   first.map_or(0, |e| e.timestamp),
         message:     String::new(),
      }
   }
}

/// Union of two payloads for the same commit, de-duplicated by `event_id`.
pub fn merge_payloads(local: &NotePayload, incoming: &NotePayload) -> NotePayload {
   let mut merged: Vec<SemanticEvent> = local.semantic_events.clone();
   for event in &incoming.semantic_events {
      if !merged.iter().any(|e| e.event_id == event.event_id) {
         merged.push(event.clone());
      }
   }
   let mut payload = NotePayload::new(&local.commit_hash, merged);
   payload.extra = local.extra.clone();
   for (key, value) in &incoming.extra {
      payload.extra.entry(key.clone()).or_insert_with(|| value.clone());
   }
   payload
}

/// Render and attach the note for one commit, replacing any existing note,
/// then flag the commit as synced. Commits without events get no note.
pub fn write_note(git: &Git, store: &SemanticStore, commit_hash: &str) -> Result<()> {
   let events = store.events_for_commit(commit_hash)?;
   if events.is_empty() {
      return Ok(());
   }
   let payload = NotePayload::new(commit_hash, events);
   git.notes_add(NOTES_REF, commit_hash, &payload.encode()?)?;
   store.mark_notes_synced(commit_hash)?;
   tracing::debug!(commit = commit_hash, "note written");
   Ok(())
}

/// Fetch the remote notes ref onto a staging ref and merge it into the
/// local tree, unioning payloads per commit. Returns the number of commits
/// whose events were imported into the store.
pub fn fetch_notes(git: &Git, store: &SemanticStore, remote: &str) -> Result<usize> {
   let refspec = format!("+{NOTES_REF}:{INCOMING_REF}");
   git.fetch_ref(remote, &refspec)?;

   let incoming = git.notes_list(INCOMING_REF)?;
   let mut imported = 0;

   for (_, commit) in incoming {
      let Some(raw) = git.notes_show(INCOMING_REF, &commit)? else { continue };
      let payload = match NotePayload::decode(&raw, &commit) {
         Ok(payload) => payload,
         Err(e) => {
            tracing::warn!(commit = %commit, error = %e, "skipping malformed incoming note");
            continue;
         },
      };

      let merged = match git.notes_show(NOTES_REF, &commit)? {
         Some(local_raw) => match NotePayload::decode(&local_raw, &commit) {
            Ok(local) if payloads_equal(&local, &payload) => local,
            Ok(local) => {
               let merged = merge_payloads(&local, &payload);
               git.notes_add(NOTES_REF, &commit, &merged.encode()?)?;
               merged
            },
            // A malformed local note loses to the incoming one.
            Err(_) => {
               git.notes_add(NOTES_REF, &commit, &raw)?;
               payload
            },
         },
         None => {
            git.notes_add(NOTES_REF, &commit, &raw)?;
            payload
         },
      };

      import_payload(store, &merged)?;
      imported += 1;
   }

   if git.ref_exists(INCOMING_REF) {
      git.delete_ref(INCOMING_REF)?;
   }
   Ok(imported)
}

fn payloads_equal(a: &NotePayload, b: &NotePayload) -> bool {
   let ids = |p: &NotePayload| -> Vec<String> {
      p.semantic_events.iter().map(|e| e.event_id.clone()).collect()
   };
   ids(a) == ids(b)
}

/// Insert a payload's events into the local store (idempotent on event_id).
pub fn import_payload(store: &SemanticStore, payload: &NotePayload) -> Result<()> {
   store.insert_events(&payload.commit_info(), &payload.semantic_events, true)?;
   Ok(())
}

/// Push the local notes ref; callers treat failure as non-fatal.
pub fn push_notes(git: &Git, remote: &str) -> Result<()> {
   git.push_ref(remote, NOTES_REF)?;
   Ok(())
}

#[cfg(test)]
mod tests {
   use std::path::Path;
   use std::process::Command;

   use super::*;
   use crate::events::{Layer, kind};
   use crate::store::Filters;

   fn event(id: &str, event_type: &str, node_id: &str) -> SemanticEvent {
      let mut event = SemanticEvent::core(event_type, node_id, "a.py", "details".to_string());
      event.event_id = id.to_string();
      event.branch = "main".to_string();
      event.author = "Alice <alice@example.com>".to_string();
      event.timestamp = 1_700_000_000;
      event
   }

   #[test]
   fn test_encode_sorts_keys_and_events() {
      let payload = NotePayload::new(
         "abc123",
         vec![
            event("e2", kind::SIGNATURE_CHANGED, "func:z"),
            event("e1", kind::NODE_ADDED, "func:a"),
         ],
      );
      let text = payload.encode().unwrap();

      let commit_pos = text.find("\"commit_hash\"").unwrap();
      let created_pos = text.find("\"created_at\"").unwrap();
      let schema_pos = text.find("\"schema_version\"").unwrap();
      let events_pos = text.find("\"semantic_events\"").unwrap();
      assert!(commit_pos < created_pos && created_pos < schema_pos && schema_pos < events_pos);

      let decoded = NotePayload::decode(&text, "abc123").unwrap();
      assert_eq!(decoded.semantic_events[0].node_id, "func:a");
      assert_eq!(decoded.semantic_events[1].node_id, "func:z");
   }

   #[test]
   fn test_decode_round_trip_preserves_unknown_keys() {
      let payload = NotePayload::new("abc", vec![event("e1", kind::NODE_ADDED, "func:f")]);
      let mut text = payload.encode().unwrap();
      text = text.replacen("{", "{\n  \"zz_future\": 7,", 1);
      let decoded = NotePayload::decode(&text, "abc").unwrap();
      assert_eq!(decoded.extra.get("zz_future"), Some(&Value::from(7)));
      let re_encoded = decoded.encode().unwrap();
      assert!(re_encoded.contains("zz_future"));
   }

   #[test]
   fn test_decode_rejects_bad_schema_and_garbage() {
      assert!(matches!(
         NotePayload::decode("not json at all", "c"),
         Err(SvcsError::MalformedNote { .. })
      ));
      let wrong_version =
         r#"{"schema_version": 99, "commit_hash": "c", "created_at": "t", "semantic_events": []}"#;
      assert!(matches!(
         NotePayload::decode(wrong_version, "c"),
         Err(SvcsError::MalformedNote { .. })
      ));
   }

   #[test]
   fn test_merge_payloads_unions_by_event_id() {
      let local = NotePayload::new(
         "c",
         vec![event("e1", kind::NODE_ADDED, "func:a"), event("e2", kind::NODE_REMOVED, "func:b")],
      );
      let incoming = NotePayload::new(
         "c",
         vec![event("e2", kind::NODE_REMOVED, "func:b"), event("e3", kind::NODE_ADDED, "func:c")],
      );
      let merged = merge_payloads(&local, &incoming);
      let mut ids: Vec<&str> = merged.semantic_events.iter().map(|e| e.event_id.as_str()).collect();
      ids.sort_unstable();
      assert_eq!(ids, vec!["e1", "e2", "e3"]);
   }

   fn scratch_repo() -> (tempfile::TempDir, Git) {
      let dir = tempfile::tempdir().unwrap();
      run_git(dir.path(), &["init", "-q", "-b", "main"]);
      run_git(dir.path(), &["config", "user.email", "test@example.com"]);
      run_git(dir.path(), &["config", "user.name", "Test"]);
      std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
      run_git(dir.path(), &["add", "."]);
      run_git(dir.path(), &["commit", "-q", "-m", "first"]);
      let git = Git::open(dir.path(), 30).unwrap();
      (dir, git)
   }

   fn run_git(dir: &Path, args: &[&str]) {
      let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
      assert!(status.success(), "git {args:?} failed");
   }

   #[test]
   fn test_note_round_trip_through_store() {
      let (_dir, git) = scratch_repo();
      let head = git.head_hash().unwrap();
      let store = SemanticStore::open_in_memory().unwrap();

      let commit = CommitInfo {
         commit_hash: head.clone(),
         branch:      "main".to_string(),
         author:      "Alice <alice@example.com>".to_string(),
         timestamp:   1_700_000_000,
         message:     "first".to_string(),
      };
      let events =
         vec![event("aaaa000011112222", kind::NODE_ADDED, "func:f"), event("bbbb000011112222", kind::FILE_ADDED, "module:a.py")];
      store.insert_events(&commit, &events, false).unwrap();

      write_note(&git, &store, &head).unwrap();
      assert!(store.unsynced_commits().unwrap().is_empty());

      // Wipe the store, then re-import from the note alone.
      store.purge().unwrap();
      assert_eq!(store.event_count().unwrap(), 0);

      let raw = git.notes_show(NOTES_REF, &head).unwrap().unwrap();
      let payload = NotePayload::decode(&raw, &head).unwrap();
      import_payload(&store, &payload).unwrap();

      let restored = store.query_events(&Filters::default()).unwrap();
      let mut restored_ids: Vec<&str> = restored.iter().map(|e| e.event_id.as_str()).collect();
      restored_ids.sort_unstable();
      assert_eq!(restored_ids, vec!["aaaa000011112222", "bbbb000011112222"]);

      // Importing again must not duplicate.
      import_payload(&store, &payload).unwrap();
      assert_eq!(store.event_count().unwrap(), 2);
   }

   #[test]
   fn test_commit_without_events_gets_no_note() {
      let (_dir, git) = scratch_repo();
      let head = git.head_hash().unwrap();
      let store = SemanticStore::open_in_memory().unwrap();
      write_note(&git, &store, &head).unwrap();
      assert!(git.notes_show(NOTES_REF, &head).unwrap().is_none());
   }

   #[test]
   fn test_fetch_notes_from_clone() {
      let (origin_dir, origin_git) = scratch_repo();
      let head = origin_git.head_hash().unwrap();

      // Attach a note in the origin.
      let store = SemanticStore::open_in_memory().unwrap();
      let commit = CommitInfo {
         commit_hash: head.clone(),
         branch:      "main".to_string(),
         author:      "Alice <alice@example.com>".to_string(),
         timestamp:   1_700_000_000,
         message:     "first".to_string(),
      };
      store.insert_events(&commit, &[event("e1", kind::NODE_ADDED, "func:f")], false).unwrap();
      write_note(&origin_git, &store, &head).unwrap();

      // Clone and fetch notes into a fresh store.
      let clone_parent = tempfile::tempdir().unwrap();
      let clone_path = clone_parent.path().join("clone");
      let status = Command::new("git")
         .args(["clone", "-q", origin_dir.path().to_str().unwrap(), clone_path.to_str().unwrap()])
         .status()
         .unwrap();
      assert!(status.success());

      let clone_git = Git::open(&clone_path, 30).unwrap();
      let clone_store = SemanticStore::open_in_memory().unwrap();
      let imported = fetch_notes(&clone_git, &clone_store, "origin").unwrap();
      assert_eq!(imported, 1);

      let events = clone_store.query_events(&Filters::default()).unwrap();
      assert_eq!(events.len(), 1);
      assert_eq!(events[0].event_id, "e1");

      // Local divergent note for the same commit union-merges on next fetch.
      let local_payload = NotePayload::new(&head, vec![event("e9", kind::SIGNATURE_CHANGED, "func:g")]);
      clone_git.notes_add(NOTES_REF, &head, &local_payload.encode().unwrap()).unwrap();
      let imported = fetch_notes(&clone_git, &clone_store, "origin").unwrap();
      assert_eq!(imported, 1);
      let merged_raw = clone_git.notes_show(NOTES_REF, &head).unwrap().unwrap();
      let merged = NotePayload::decode(&merged_raw, &head).unwrap();
      let mut ids: Vec<&str> = merged.semantic_events.iter().map(|e| e.event_id.as_str()).collect();
      ids.sort_unstable();
      assert_eq!(ids, vec!["e1", "e9"]);
   }
}
