//! Git hook installation and the hook entry points.
//!
//! Installed hooks are small POSIX shims that locate the svcs executable
//! and dispatch to `svcs hook <name>`. Pre-existing non-SVCS hooks are
//! backed up with a `.svcs-backup` suffix and restored on uninstall.
//! Setting `SVCS_SKIP_HOOKS` disables every shim.

use std::io::BufRead;
use std::path::Path;

use crate::error::{Result, SvcsError};
use crate::git::Git;
use crate::notes::{self, NOTES_REF, NotePayload};
use crate::repo::RepositoryContext;

pub const CLIENT_HOOKS: &[&str] = &["post-commit", "post-merge", "post-checkout", "pre-push"];
pub const SERVER_HOOKS: &[&str] = &["post-receive", "update"];

const MARKER: &str = "# SVCS-managed hook";
const BACKUP_SUFFIX: &str = ".svcs-backup";

/// Installation state of one hook file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
   Installed,
   NotInstalled,
   Foreign,
}

fn shim_script(exe: &Path, hook_name: &str) -> String {
   format!(
      "#!/bin/sh\n{MARKER}\n# Removed by `svcs uninstall`; any {BACKUP_SUFFIX} file is restored.\n\
       [ -n \"$SVCS_SKIP_HOOKS\" ] && exit 0\n\
       SVCS_BIN=\"{}\"\n\
       [ -x \"$SVCS_BIN\" ] || exit 0\n\
       exec \"$SVCS_BIN\" hook {hook_name} \"$@\"\n",
      exe.display()
   )
}

fn hook_names(git: &Git) -> &'static [&'static str] {
   if git.is_bare() { SERVER_HOOKS } else { CLIENT_HOOKS }
}

/// Install the hook set appropriate for this repository (client hooks in a
/// working clone, receive-side hooks in a bare repo).
pub fn install(git: &Git) -> Result<Vec<String>> {
   let hooks_dir = git.hooks_dir();
   std::fs::create_dir_all(&hooks_dir)?;
   let exe = std::env::current_exe()?;

   let mut installed = Vec::new();
   for name in hook_names(git) {
      let path = hooks_dir.join(name);
      if path.exists() && !is_svcs_hook(&path) {
         let backup = hooks_dir.join(format!("{name}{BACKUP_SUFFIX}"));
         std::fs::rename(&path, &backup)?;
         tracing::info!(hook = name, "existing hook backed up");
      }
      std::fs::write(&path, shim_script(&exe, name))?;
      set_executable(&path)?;
      installed.push((*name).to_string());
   }
   Ok(installed)
}

/// Remove SVCS shims and restore any backups.
pub fn uninstall(git: &Git) -> Result<()> {
   let hooks_dir = git.hooks_dir();
   if !hooks_dir.exists() {
      return Ok(());
   }
   for name in hook_names(git) {
      let path = hooks_dir.join(name);
      if path.exists() && is_svcs_hook(&path) {
         std::fs::remove_file(&path)?;
         let backup = hooks_dir.join(format!("{name}{BACKUP_SUFFIX}"));
         if backup.exists() {
            std::fs::rename(&backup, &path)?;
            tracing::info!(hook = name, "backup hook restored");
         }
      }
   }
   Ok(())
}

/// Per-hook installation state.
pub fn status(git: &Git) -> Result<Vec<(String, HookState)>> {
   let hooks_dir = git.hooks_dir();
   let mut out = Vec::new();
   for name in hook_names(git) {
      let path = hooks_dir.join(name);
      let state = if !path.exists() {
         HookState::NotInstalled
      } else if is_svcs_hook(&path) {
         HookState::Installed
      } else {
         HookState::Foreign
      };
      out.push(((*name).to_string(), state));
   }
   Ok(out)
}

fn is_svcs_hook(path: &Path) -> bool {
   std::fs::read_to_string(path).is_ok_and(|content| content.contains(MARKER))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
   use std::os::unix::fs::PermissionsExt;
   let mut permissions = std::fs::metadata(path)?.permissions();
   permissions.set_mode(0o755);
   std::fs::set_permissions(path, permissions)?;
   Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
   Ok(())
}

// === Hook entry points ===

/// post-commit: analyze HEAD, persist, attach the note.
pub fn run_post_commit(ctx: &RepositoryContext) -> Result<()> {
   let head = ctx.git().head_hash()?;
   let analysis = ctx.analyze_commit(&head)?;
   println!(
      "SVCS: {} semantic event(s) recorded for {}",
      analysis.events.len(),
      short(&head)
   );
   Ok(())
}

/// post-merge: fetch remote notes (best effort), then analyze the merge
/// commit itself.
pub fn run_post_merge(ctx: &RepositoryContext) -> Result<()> {
   let fetched = match ctx.sync_notes_fetch(None) {
      Ok(count) => count,
      Err(e) => {
         tracing::warn!(error = %e, "notes fetch failed during post-merge");
         0
      },
   };
   let head = ctx.git().head_hash()?;
   let analysis = ctx.analyze_commit(&head)?;
   println!(
      "SVCS: merge analyzed ({} event(s), {fetched} note(s) imported)",
      analysis.events.len()
   );
   Ok(())
}

/// post-checkout: fetch notes (best effort) and record the branch switch.
pub fn run_post_checkout(ctx: &RepositoryContext) -> Result<()> {
   let fetched = match ctx.sync_notes_fetch(None) {
      Ok(count) => count,
      Err(e) => {
         tracing::debug!(error = %e, "notes fetch skipped during post-checkout");
         0
      },
   };
   ctx.record_branch_switch()?;
   println!("SVCS: checkout recorded ({fetched} note(s) imported)");
   Ok(())
}

/// pre-push: heal unwritten notes, then push the notes ref. Failure here
/// must never block the code push.
pub fn run_pre_push(ctx: &RepositoryContext) -> Result<()> {
   if let Err(e) = ctx.reconcile_notes() {
      tracing::warn!(error = %e, "note reconciliation failed during pre-push");
   }
   match ctx.sync_notes_push(None) {
      Ok(()) => println!("SVCS: notes pushed"),
      Err(e) => {
         tracing::warn!(error = %e, "notes push failed (continuing)");
         eprintln!("SVCS: warning: notes push failed ({e})");
      },
   }
   Ok(())
}

/// post-receive (bare repo): analyze every commit introduced by the pushed
/// refs and attach notes locally so clones can fetch them.
pub fn run_post_receive(ctx: &RepositoryContext, input: &mut dyn BufRead) -> Result<()> {
   let mut analyzed = 0usize;
   let mut events = 0usize;

   let mut line = String::new();
   loop {
      line.clear();
      if input.read_line(&mut line)? == 0 {
         break;
      }
      let fields: Vec<&str> = line.split_whitespace().collect();
      if fields.len() != 3 {
         continue;
      }
      let (old, new, reference) = (fields[0], fields[1], fields[2]);
      if !reference.starts_with("refs/heads/") {
         continue;
      }
      let branch = reference.trim_start_matches("refs/heads/");

      for commit_hash in ctx.git().new_commits(old, new)? {
         match ctx.analyze_commit_on_branch(&commit_hash, branch) {
            Ok(analysis) => {
               analyzed += 1;
               events += analysis.events.len();
            },
            Err(e) => {
               tracing::error!(commit = %commit_hash, error = %e, "server-side analysis failed");
            },
         }
      }
   }

   println!("SVCS: analyzed {analyzed} received commit(s), {events} event(s)");
   Ok(())
}

/// update (bare repo): validate incoming payloads when the notes ref is
/// being updated. A malformed payload rejects the push.
pub fn run_update(ctx: &RepositoryContext, reference: &str, _old: &str, new: &str) -> Result<()> {
   if reference != NOTES_REF {
      return Ok(());
   }
   for (blob_sha, path) in ctx.git().ls_tree(new)? {
      let raw = ctx.git().cat_blob(&blob_sha)?;
      if raw.len() > notes::MAX_PAYLOAD_BYTES {
         return Err(SvcsError::MalformedNote {
            commit: path,
            reason: "payload too large".to_string(),
         });
      }
      let text = String::from_utf8_lossy(&raw);
      // Fanout directories make the path the commit hash with slashes.
      let commit_hint = path.replace('/', "");
      NotePayload::decode(&text, &commit_hint)?;
   }
   Ok(())
}

fn short(hash: &str) -> &str {
   &hash[..hash.len().min(8)]
}

#[cfg(test)]
mod tests {
   use std::path::Path;
   use std::process::Command;

   use super::*;
   use crate::store::Filters;

   fn run_git(dir: &Path, args: &[&str]) {
      let status = Command::new("git")
         .args(args)
         .current_dir(dir)
         .env("SVCS_SKIP_HOOKS", "1")
         .status()
         .unwrap();
      assert!(status.success(), "git {args:?} failed");
   }

   fn scratch_repo() -> (tempfile::TempDir, Git) {
      let dir = tempfile::tempdir().unwrap();
      run_git(dir.path(), &["init", "-q", "-b", "main"]);
      run_git(dir.path(), &["config", "user.email", "test@example.com"]);
      run_git(dir.path(), &["config", "user.name", "Test"]);
      let git = Git::open(dir.path(), 30).unwrap();
      (dir, git)
   }

   fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
      std::fs::write(dir.join(name), content).unwrap();
      run_git(dir, &["add", "."]);
      run_git(dir, &["commit", "-q", "-m", message]);
   }

   #[test]
   fn test_install_and_uninstall_with_backup() {
      let (_dir, git) = scratch_repo();
      let hooks_dir = git.hooks_dir();
      std::fs::create_dir_all(&hooks_dir).unwrap();

      // A user hook already exists.
      let existing = hooks_dir.join("post-commit");
      std::fs::write(&existing, "#!/bin/sh\necho mine\n").unwrap();

      install(&git).unwrap();
      assert!(is_svcs_hook(&existing));
      let backup = hooks_dir.join("post-commit.svcs-backup");
      assert!(backup.exists());

      for (name, state) in status(&git).unwrap() {
         assert_eq!(state, HookState::Installed, "{name} not installed");
      }

      uninstall(&git).unwrap();
      assert!(!backup.exists());
      let restored = std::fs::read_to_string(&existing).unwrap();
      assert!(restored.contains("echo mine"));
      // Hooks without a backup are plainly removed.
      assert!(!hooks_dir.join("pre-push").exists());
   }

   #[test]
   fn test_reinstall_does_not_clobber_backup() {
      let (dir, git) = scratch_repo();
      let hooks_dir = git.hooks_dir();
      std::fs::create_dir_all(&hooks_dir).unwrap();
      std::fs::write(hooks_dir.join("pre-push"), "#!/bin/sh\necho original\n").unwrap();

      install(&git).unwrap();
      install(&git).unwrap();

      let backup = std::fs::read_to_string(hooks_dir.join("pre-push.svcs-backup")).unwrap();
      assert!(backup.contains("echo original"));
      let _ = dir;
   }

   #[test]
   fn test_bare_repo_gets_server_hooks() {
      let dir = tempfile::tempdir().unwrap();
      let status_ok = Command::new("git")
         .args(["init", "-q", "--bare", "-b", "main"])
         .current_dir(dir.path())
         .status()
         .unwrap();
      assert!(status_ok.success());
      let git = Git::open(dir.path(), 30).unwrap();

      let installed = install(&git).unwrap();
      assert_eq!(installed, vec!["post-receive".to_string(), "update".to_string()]);
      assert!(git.hooks_dir().join("post-receive").exists());
      assert!(!git.hooks_dir().join("post-commit").exists());
   }

   #[test]
   fn test_post_receive_analyzes_pushed_commits() {
      // Bare origin with SVCS initialized.
      let origin_dir = tempfile::tempdir().unwrap();
      let status_ok = Command::new("git")
         .args(["init", "-q", "--bare", "-b", "main"])
         .current_dir(origin_dir.path())
         .status()
         .unwrap();
      assert!(status_ok.success());
      let origin_ctx = RepositoryContext::init(origin_dir.path()).unwrap();

      // A clone pushes one commit.
      let clone_parent = tempfile::tempdir().unwrap();
      let clone_path = clone_parent.path().join("clone");
      let status_ok = Command::new("git")
         .args(["clone", "-q", origin_dir.path().to_str().unwrap(), clone_path.to_str().unwrap()])
         .env("SVCS_SKIP_HOOKS", "1")
         .status()
         .unwrap();
      assert!(status_ok.success());
      run_git(&clone_path, &["config", "user.email", "test@example.com"]);
      run_git(&clone_path, &["config", "user.name", "Test"]);
      commit_file(&clone_path, "a.py", "def f(x):\n    return x+1\n", "add f");
      run_git(&clone_path, &["push", "-q", "origin", "main"]);

      let clone_git = Git::open(&clone_path, 30).unwrap();
      let pushed = clone_git.head_hash().unwrap();

      // Drive the hook the way git would.
      let zero = "0".repeat(40);
      let input = format!("{zero} {pushed} refs/heads/main\n");
      run_post_receive(&origin_ctx, &mut input.as_bytes()).unwrap();

      let events = origin_ctx.store().query_events(&Filters::default()).unwrap();
      assert!(!events.is_empty());
      assert!(events.iter().all(|e| e.branch == "main"));
      // The note is attached in the bare repo for later clones.
      assert!(origin_ctx.git().notes_show(NOTES_REF, &pushed).unwrap().is_some());
   }

   #[test]
   fn test_update_hook_rejects_malformed_note() {
      let (dir, git) = scratch_repo();
      commit_file(dir.path(), "a.py", "x = 1\n", "first");
      RepositoryContext::init(dir.path()).unwrap();
      let ctx = RepositoryContext::open(dir.path()).unwrap();

      let head = git.head_hash().unwrap();
      git.notes_add(NOTES_REF, &head, "this is not a payload").unwrap();
      let notes_tip = git.rev_parse(NOTES_REF).unwrap();

      let result = run_update(&ctx, NOTES_REF, &"0".repeat(40), &notes_tip);
      assert!(matches!(result, Err(SvcsError::MalformedNote { .. })));

      // Non-notes refs are never rejected.
      assert!(run_update(&ctx, "refs/heads/main", &"0".repeat(40), &head).is_ok());
   }
}
