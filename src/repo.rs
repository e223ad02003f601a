//! Repository context: the `.svcs/` layout, configuration, store handle,
//! and the high-level operations the CLI and hooks drive.

use std::path::{Path, PathBuf};

use crate::commit::{self, CommitAnalysis};
use crate::config::SvcsConfig;
use crate::error::{Result, SvcsError};
use crate::git::Git;
use crate::hooks;
use crate::llm::{HttpTransport, LlmTransport};
use crate::notes;
use crate::store::SemanticStore;

pub const SVCS_DIR: &str = ".svcs";
pub const DB_FILE: &str = "semantic.db";
pub const LOG_DIR: &str = "logs";

/// Everything needed to operate on one repository. No hidden globals: every
/// call site receives this context explicitly.
pub struct RepositoryContext {
   root:     PathBuf,
   svcs_dir: PathBuf,
   git:      Git,
   config:   SvcsConfig,
   store:    SemanticStore,
}

/// Snapshot returned by `status`.
#[derive(Debug)]
pub struct StatusReport {
   pub name:             String,
   pub path:             PathBuf,
   pub branch:           String,
   pub bare:             bool,
   pub commit_count:     u64,
   pub event_count:      u64,
   pub unsynced_commits: usize,
   pub hooks:            Vec<(String, hooks::HookState)>,
}

impl RepositoryContext {
   /// Open an initialized repository; errors when `.svcs/` is missing.
   pub fn open(path: &Path) -> Result<Self> {
      let config_probe = SvcsConfig::default();
      let git = Git::open(path, config_probe.git_timeout_secs)?;
      let root = context_root(&git);
      let svcs_dir = root.join(SVCS_DIR);
      if !svcs_dir.exists() {
         return Err(SvcsError::NotInitialized(root.display().to_string()));
      }
      let config = SvcsConfig::load(&svcs_dir)?;
      // Reopen with the configured subprocess timeout.
      let git = Git::open(&root, config.git_timeout_secs)?;
      let store = SemanticStore::open(&svcs_dir.join(DB_FILE))?;
      Ok(Self { root, svcs_dir, git, config, store })
   }

   /// Initialize SVCS for a repository: `.svcs/` layout, config, store
   /// schema, and git hooks.
   pub fn init(path: &Path) -> Result<Self> {
      let config_probe = SvcsConfig::default();
      let git = Git::open(path, config_probe.git_timeout_secs)?;
      let root = context_root(&git);
      let svcs_dir = root.join(SVCS_DIR);
      std::fs::create_dir_all(svcs_dir.join(LOG_DIR))?;

      let mut config = SvcsConfig::load(&svcs_dir)?;
      if config.repository_name.is_empty() {
         config.repository_name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repository".to_string());
      }
      config.save(&svcs_dir)?;

      let store = SemanticStore::open(&svcs_dir.join(DB_FILE))?;
      let branch = git.current_branch().unwrap_or_else(|_| "HEAD".to_string());
      store.set_repository_info(&config.repository_name, &root.display().to_string(), &branch)?;

      hooks::install(&git)?;
      tracing::info!(repo = %root.display(), "svcs initialized");
      Ok(Self { root, svcs_dir, git, config, store })
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   pub fn svcs_dir(&self) -> &Path {
      &self.svcs_dir
   }

   pub const fn git(&self) -> &Git {
      &self.git
   }

   pub const fn config(&self) -> &SvcsConfig {
      &self.config
   }

   pub const fn store(&self) -> &SemanticStore {
      &self.store
   }

   /// Analyze one commit, persist its events, and attach the note. The
   /// store write happens before the notes write; a crash in between is
   /// healed by the next `reconcile_notes` (idempotent on event_id).
   pub fn analyze_commit(&self, commit_hash: &str) -> Result<CommitAnalysis> {
      let branch = self.git.current_branch().unwrap_or_else(|_| "HEAD".to_string());
      self.analyze_commit_on_branch(commit_hash, &branch)
   }

   pub fn analyze_commit_on_branch(&self, commit_hash: &str, branch: &str) -> Result<CommitAnalysis> {
      let commit_hash = self.git.rev_parse(commit_hash)?;

      let transport: Option<Box<dyn LlmTransport>> = if self.config.layer_5b_enabled() {
         match HttpTransport::new(&self.config) {
            Ok(transport) => Some(Box::new(transport)),
            Err(e) => {
               tracing::warn!(error = %e, "layer 5b transport unavailable; continuing without it");
               None
            },
         }
      } else {
         None
      };

      let analysis =
         commit::process_commit(&self.git, &commit_hash, branch, &self.config, transport.as_deref())?;

      self.store.insert_events(&analysis.commit, &analysis.events, false)?;
      notes::write_note(&self.git, &self.store, &commit_hash)?;

      tracing::info!(
         commit = %commit_hash,
         events = analysis.events.len(),
         files = analysis.files_analyzed,
         "commit analyzed"
      );
      Ok(analysis)
   }

   /// Re-attach notes for commits whose store write succeeded but whose
   /// notes write did not.
   pub fn reconcile_notes(&self) -> Result<usize> {
      let mut healed = 0;
      for commit_hash in self.store.unsynced_commits()? {
         notes::write_note(&self.git, &self.store, &commit_hash)?;
         healed += 1;
      }
      Ok(healed)
   }

   /// Fetch and import the remote's notes; `None` remote means the first
   /// configured one.
   pub fn sync_notes_fetch(&self, remote: Option<&str>) -> Result<usize> {
      let remote = self.resolve_remote(remote)?;
      notes::fetch_notes(&self.git, &self.store, &remote)
   }

   /// Push the local notes ref.
   pub fn sync_notes_push(&self, remote: Option<&str>) -> Result<()> {
      let remote = self.resolve_remote(remote)?;
      notes::push_notes(&self.git, &remote)
   }

   fn resolve_remote(&self, remote: Option<&str>) -> Result<String> {
      if let Some(remote) = remote {
         return Ok(remote.to_string());
      }
      self
         .git
         .default_remote()?
         .ok_or_else(|| SvcsError::ValidationError("no git remote configured".to_string()))
   }

   /// Drop commits no longer reachable in the object graph; cascades to
   /// their events. Returns (removed commits, removed events).
   pub fn prune(&self) -> Result<(usize, usize)> {
      let reachable = self.git.reachable_hashes()?;
      let removed = self.store.prune_orphans(&reachable)?;
      tracing::info!(commits = removed.0, events = removed.1, "pruned orphaned commits");
      Ok(removed)
   }

   /// Remove all SVCS state for this repository: store rows, hooks, and the
   /// `.svcs/` directory itself.
   pub fn purge(self) -> Result<()> {
      self.store.purge()?;
      hooks::uninstall(&self.git)?;
      drop(self.store);
      std::fs::remove_dir_all(&self.svcs_dir)?;
      Ok(())
   }

   /// Remove hooks but keep the store and configuration.
   pub fn uninstall(&self) -> Result<()> {
      hooks::uninstall(&self.git)
   }

   pub fn status(&self) -> Result<StatusReport> {
      let branch = self.git.current_branch().unwrap_or_else(|_| "HEAD".to_string());
      Ok(StatusReport {
         name:             self.config.repository_name.clone(),
         path:             self.root.clone(),
         branch,
         bare:             self.git.is_bare(),
         commit_count:     self.store.commit_count()?,
         event_count:      self.store.event_count()?,
         unsynced_commits: self.store.unsynced_commits()?.len(),
         hooks:            hooks::status(&self.git)?,
      })
   }

   /// Record a branch switch (post-checkout).
   pub fn record_branch_switch(&self) -> Result<()> {
      let branch = self.git.current_branch().unwrap_or_else(|_| "HEAD".to_string());
      self.store.update_current_branch(&branch)
   }
}

/// Bare repositories keep `.svcs/` at the repository root; working clones
/// keep it in the working tree.
fn context_root(git: &Git) -> PathBuf {
   if git.is_bare() { git.git_dir().to_path_buf() } else { git.work_dir().to_path_buf() }
}

/// Install the tracing subscriber: level from config/env, human output on
/// stderr only for errors, full detail into the daily-rotated log file.
/// The returned guard must stay alive for the process duration.
pub fn init_logging(svcs_dir: &Path, level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
   use tracing_subscriber::EnvFilter;

   let log_dir = svcs_dir.join(LOG_DIR);
   if std::fs::create_dir_all(&log_dir).is_err() {
      return None;
   }
   let appender = tracing_appender::rolling::daily(log_dir, "svcs.log");
   let (writer, guard) = tracing_appender::non_blocking(appender);

   let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
   let subscriber = tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(writer)
      .with_ansi(false)
      .finish();

   // A second init (tests, nested calls) is harmless.
   if tracing::subscriber::set_global_default(subscriber).is_err() {
      return None;
   }
   Some(guard)
}

#[cfg(test)]
mod tests {
   use std::path::Path;
   use std::process::Command;

   use super::*;
   use crate::events::kind;
   use crate::store::Filters;

   fn scratch_repo() -> tempfile::TempDir {
      let dir = tempfile::tempdir().unwrap();
      run_git(dir.path(), &["init", "-q", "-b", "main"]);
      run_git(dir.path(), &["config", "user.email", "test@example.com"]);
      run_git(dir.path(), &["config", "user.name", "Test"]);
      dir
   }

   fn run_git(dir: &Path, args: &[&str]) {
      // Installed shims must not re-enter the test binary.
      let status = Command::new("git")
         .args(args)
         .current_dir(dir)
         .env("SVCS_SKIP_HOOKS", "1")
         .status()
         .unwrap();
      assert!(status.success(), "git {args:?} failed");
   }

   fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
      std::fs::write(dir.join(name), content).unwrap();
      run_git(dir, &["add", "."]);
      run_git(dir, &["commit", "-q", "-m", message]);
   }

   #[test]
   fn test_open_requires_init() {
      let dir = scratch_repo();
      assert!(matches!(
         RepositoryContext::open(dir.path()),
         Err(SvcsError::NotInitialized(_))
      ));
      RepositoryContext::init(dir.path()).unwrap();
      assert!(RepositoryContext::open(dir.path()).is_ok());
   }

   #[test]
   fn test_analyze_commit_end_to_end() {
      let dir = scratch_repo();
      let ctx = RepositoryContext::init(dir.path()).unwrap();
      commit_file(dir.path(), "a.py", "def f(x):\n    return x+1\n", "add f");

      let analysis = ctx.analyze_commit("HEAD").unwrap();
      assert!(analysis.events.iter().any(|e| e.event_type == kind::NODE_ADDED));

      // Events landed in the store...
      let stored = ctx.store().query_events(&Filters::default()).unwrap();
      assert_eq!(stored.len(), analysis.events.len());

      // ...and the note exists with the same event ids.
      let head = ctx.git().head_hash().unwrap();
      let raw = ctx.git().notes_show(crate::notes::NOTES_REF, &head).unwrap().unwrap();
      let payload = crate::notes::NotePayload::decode(&raw, &head).unwrap();
      let mut note_ids: Vec<&str> =
         payload.semantic_events.iter().map(|e| e.event_id.as_str()).collect();
      note_ids.sort_unstable();
      let mut store_ids: Vec<&str> = stored.iter().map(|e| e.event_id.as_str()).collect();
      store_ids.sort_unstable();
      assert_eq!(note_ids, store_ids);
   }

   #[test]
   fn test_reanalysis_is_idempotent() {
      let dir = scratch_repo();
      let ctx = RepositoryContext::init(dir.path()).unwrap();
      commit_file(dir.path(), "a.py", "def f(x):\n    return x\n", "add f");

      ctx.analyze_commit("HEAD").unwrap();
      let first = ctx.store().event_count().unwrap();
      ctx.analyze_commit("HEAD").unwrap();
      assert_eq!(ctx.store().event_count().unwrap(), first);
   }

   #[test]
   fn test_prune_removes_unreachable_commit() {
      let dir = scratch_repo();
      let ctx = RepositoryContext::init(dir.path()).unwrap();
      commit_file(dir.path(), "a.py", "def f(x):\n    return x\n", "keep");
      ctx.analyze_commit("HEAD").unwrap();

      // A commit on a deleted branch becomes unreachable.
      run_git(dir.path(), &["checkout", "-q", "-b", "doomed"]);
      commit_file(dir.path(), "b.py", "def g():\n    return 1\n", "doomed work");
      ctx.analyze_commit("HEAD").unwrap();
      let doomed_hash = ctx.git().head_hash().unwrap();
      run_git(dir.path(), &["checkout", "-q", "main"]);
      run_git(dir.path(), &["branch", "-q", "-D", "doomed"]);
      // Notes also keep commits alive; drop the doomed note before GC.
      ctx.git().notes_remove(crate::notes::NOTES_REF, &doomed_hash).unwrap();
      run_git(dir.path(), &["reflog", "expire", "--expire=now", "--all"]);
      run_git(dir.path(), &["gc", "-q", "--prune=now"]);

      assert!(ctx.store().commit_exists(&doomed_hash).unwrap());
      let (removed_commits, removed_events) = ctx.prune().unwrap();
      assert_eq!(removed_commits, 1);
      assert!(removed_events > 0);
      assert!(!ctx.store().commit_exists(&doomed_hash).unwrap());
   }

   #[test]
   fn test_purge_removes_svcs_dir() {
      let dir = scratch_repo();
      let ctx = RepositoryContext::init(dir.path()).unwrap();
      let svcs_dir = ctx.svcs_dir().to_path_buf();
      assert!(svcs_dir.exists());
      ctx.purge().unwrap();
      assert!(!svcs_dir.exists());
   }
}
