//! Commit processor: turns a git commit into (file, before, after) triples
//! read from the object database (never the working tree) and drives the
//! analysis orchestrator over them.

use rayon::prelude::*;

use crate::analyzer;
use crate::config::SvcsConfig;
use crate::error::Result;
use crate::events::{CommitInfo, SemanticEvent, kind};
use crate::git::{ChangeKind, Git};
use crate::llm::LlmTransport;

/// Result of analyzing one commit.
#[derive(Debug)]
pub struct CommitAnalysis {
   pub commit: CommitInfo,
   pub events: Vec<SemanticEvent>,

   pub files_analyzed: usize,
   pub binary_files_skipped: usize,
}

/// One materialized file change ready for analysis.
struct FileInput {
   path:     String,
   old_path: Option<String>,
   before:   Vec<u8>,
   after:    Vec<u8>,
   kind:     ChangeKind,
}

/// Analyze every file changed by `commit_hash` against its first parent.
pub fn process_commit(
   git: &Git,
   commit_hash: &str,
   branch: &str,
   config: &SvcsConfig,
   transport: Option<&dyn LlmTransport>,
) -> Result<CommitAnalysis> {
   let commit = git.commit_info(commit_hash, branch)?;
   let parent = git.parent_of(commit_hash)?;
   let changes = git.changed_files(commit_hash, parent.as_deref())?;

   let mut inputs = Vec::with_capacity(changes.len());
   for change in changes {
      let before = match (&change.kind, &parent) {
         (ChangeKind::Added, _) => Vec::new(),
         (ChangeKind::Renamed { old_path }, Some(parent)) => {
            git.show_blob(parent, old_path)?.unwrap_or_default()
         },
         (_, Some(parent)) => git.show_blob(parent, &change.path)?.unwrap_or_default(),
         (_, None) => Vec::new(),
      };
      let after = if change.kind == ChangeKind::Deleted {
         Vec::new()
      } else {
         git.show_blob(commit_hash, &change.path)?.unwrap_or_default()
      };
      let old_path = match &change.kind {
         ChangeKind::Renamed { old_path } => Some(old_path.clone()),
         _ => None,
      };
      inputs.push(FileInput { path: change.path, old_path, before, after, kind: change.kind });
   }

   let mut binary_files_skipped = 0;
   let mut files_analyzed = 0;
   let mut file_events: Vec<SemanticEvent> = Vec::new();
   let mut to_analyze: Vec<&FileInput> = Vec::new();

   for input in &inputs {
      let binary = is_binary(&input.before) || is_binary(&input.after);
      let module_id = format!("module:{}", input.path);

      match &input.kind {
         ChangeKind::Added => {
            file_events.push(SemanticEvent::core(
               kind::FILE_ADDED,
               &module_id,
               &input.path,
               format!("File '{}' added", input.path),
            ));
         },
         ChangeKind::Deleted => {
            file_events.push(SemanticEvent::core(
               kind::FILE_REMOVED,
               &module_id,
               &input.path,
               format!("File '{}' removed", input.path),
            ));
         },
         ChangeKind::Renamed { old_path } => {
            file_events.push(SemanticEvent::core(
               kind::FILE_RENAMED,
               &module_id,
               &input.path,
               format!("File renamed: {} -> {}", old_path, input.path),
            ));
         },
         ChangeKind::Modified => {},
      }

      if binary {
         binary_files_skipped += 1;
         tracing::debug!(file = %input.path, "binary file skipped");
         continue;
      }
      // A pure rename carries no content delta to analyze.
      if input.old_path.is_some() && input.before == input.after {
         continue;
      }
      files_analyzed += 1;
      to_analyze.push(input);
   }

   // Analysis is pure CPU once blobs are materialized; fan out per file.
   let analyzed: Vec<Vec<SemanticEvent>> = to_analyze
      .par_iter()
      .map(|input| analyzer::analyze_file(&input.path, &input.before, &input.after, config, transport))
      .collect();

   let mut events = file_events;
   for file_events in analyzed {
      events.extend(file_events);
   }

   analyzer::finalize_events(&commit, &mut events);

   Ok(CommitAnalysis { commit, events, files_analyzed, binary_files_skipped })
}

/// NUL byte in the leading window marks a binary blob.
pub fn is_binary(bytes: &[u8]) -> bool {
   bytes.iter().take(8000).any(|&b| b == 0)
}
