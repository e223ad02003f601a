use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Result, SvcsError};
use crate::events::CommitInfo;

/// Status of one path in a commit diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
   Added,
   Modified,
   Deleted,
   Renamed { old_path: String },
}

#[derive(Debug, Clone)]
pub struct FileChange {
   pub kind: ChangeKind,
   pub path: String,
}

/// Subprocess-backed git access for one repository.
///
/// Every invocation runs with a closed stdin and a deadline; all results are
/// typed. This is the only module that talks to the git binary.
#[derive(Debug, Clone)]
pub struct Git {
   dir:     PathBuf,
   git_dir: PathBuf,
   bare:    bool,
   timeout: Duration,
}

impl Git {
   /// Open an existing repository (working tree or bare).
   pub fn open(dir: &Path, timeout_secs: u64) -> Result<Self> {
      let mut git = Self {
         dir:     dir.to_path_buf(),
         git_dir: PathBuf::new(),
         bare:    false,
         timeout: Duration::from_secs(timeout_secs),
      };

      let git_dir = git
         .run(&["rev-parse", "--git-dir"])
         .map_err(|_| SvcsError::NotARepository(dir.display().to_string()))?;
      let git_dir = PathBuf::from(git_dir.trim());
      git.git_dir = if git_dir.is_absolute() { git_dir } else { dir.join(git_dir) };

      let bare = git.run(&["rev-parse", "--is-bare-repository"])?;
      git.bare = bare.trim() == "true";
      Ok(git)
   }

   pub fn work_dir(&self) -> &Path {
      &self.dir
   }

   pub fn git_dir(&self) -> &Path {
      &self.git_dir
   }

   pub const fn is_bare(&self) -> bool {
      self.bare
   }

   pub fn hooks_dir(&self) -> PathBuf {
      self.git_dir.join("hooks")
   }

   /// Run git with the given args; error on non-zero exit.
   pub fn run(&self, args: &[&str]) -> Result<String> {
      let output = self.run_raw(args, None)?;
      Ok(String::from_utf8_lossy(&output).to_string())
   }

   /// Run git feeding `stdin` and capturing raw stdout bytes.
   pub fn run_raw(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
      let mut cmd = Command::new("git");
      cmd.args(args)
         .current_dir(&self.dir)
         .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
         .stdout(Stdio::piped())
         .stderr(Stdio::piped());

      let mut child = cmd
         .spawn()
         .map_err(|e| SvcsError::GitError(format!("Failed to spawn git {}: {e}", args.join(" "))))?;

      // Feed stdin off-thread so a large payload cannot deadlock against a
      // filling output pipe. A failed write just means git exited early; the
      // status check below reports the real error.
      let stdin_handle = stdin.map(|data| {
         let data = data.to_vec();
         let mut pipe = child.stdin.take();
         std::thread::spawn(move || {
            if let Some(pipe) = pipe.as_mut() {
               let _ = pipe.write_all(&data);
            }
         })
      });

      let (stdout, stderr, status) = self.wait_with_deadline(&mut child, args)?;
      if let Some(handle) = stdin_handle {
         let _ = handle.join();
      }

      if !status_success(status) {
         let stderr = String::from_utf8_lossy(&stderr);
         return Err(SvcsError::GitError(format!("git {} failed: {}", args.join(" "), stderr.trim())));
      }

      Ok(stdout)
   }

   fn wait_with_deadline(
      &self,
      child: &mut Child,
      args: &[&str],
   ) -> Result<(Vec<u8>, Vec<u8>, Option<i32>)> {
      let mut out_pipe = child.stdout.take();
      let mut err_pipe = child.stderr.take();

      let out_handle = std::thread::spawn(move || {
         let mut buf = Vec::new();
         if let Some(pipe) = out_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
         }
         buf
      });
      let err_handle = std::thread::spawn(move || {
         let mut buf = Vec::new();
         if let Some(pipe) = err_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
         }
         buf
      });

      let deadline = Instant::now() + self.timeout;
      let status = loop {
         match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
               if Instant::now() >= deadline {
                  let _ = child.kill();
                  let _ = child.wait();
                  return Err(SvcsError::GitError(format!(
                     "git {} timed out after {}s",
                     args.join(" "),
                     self.timeout.as_secs()
                  )));
               }
               std::thread::sleep(Duration::from_millis(10));
            },
            Err(e) => {
               return Err(SvcsError::GitError(format!("Failed to wait for git: {e}")));
            },
         }
      };

      let stdout = out_handle.join().unwrap_or_default();
      let stderr = err_handle.join().unwrap_or_default();
      Ok((stdout, stderr, status.code()))
   }

   pub fn rev_parse(&self, rev: &str) -> Result<String> {
      Ok(self.run(&["rev-parse", rev])?.trim().to_string())
   }

   pub fn head_hash(&self) -> Result<String> {
      self.rev_parse("HEAD")
   }

   /// First parent of a commit, or `None` for a root commit.
   pub fn parent_of(&self, hash: &str) -> Result<Option<String>> {
      let line = self.run(&["rev-list", "--parents", "-n", "1", hash])?;
      Ok(line.split_whitespace().nth(1).map(ToString::to_string))
   }

   /// Current branch name; `HEAD` when detached.
   pub fn current_branch(&self) -> Result<String> {
      Ok(self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?.trim().to_string())
   }

   /// Author, timestamp, and message for a commit.
   pub fn commit_info(&self, hash: &str, branch: &str) -> Result<CommitInfo> {
      let raw = self.run(&["show", "-s", "--format=%an <%ae>%x00%ct%x00%B", hash])?;
      let parts: Vec<&str> = raw.splitn(3, '\0').collect();
      if parts.len() < 3 {
         return Err(SvcsError::GitError(format!("Failed to parse commit metadata for {hash}")));
      }
      let timestamp: i64 = parts[1]
         .trim()
         .parse()
         .map_err(|_| SvcsError::GitError(format!("Bad commit timestamp for {hash}: {}", parts[1])))?;
      Ok(CommitInfo {
         commit_hash: hash.to_string(),
         branch:      branch.to_string(),
         author:      parts[0].trim().to_string(),
         timestamp,
         message:     parts[2].trim().to_string(),
      })
   }

   /// Paths changed by a commit relative to its first parent, with rename
   /// detection. Root commits diff against the empty tree; merge commits
   /// must pass their first parent explicitly.
   pub fn changed_files(&self, hash: &str, parent: Option<&str>) -> Result<Vec<FileChange>> {
      let raw = match parent {
         Some(parent) => self.run(&[
            "diff-tree",
            "-r",
            "-M",
            "--no-commit-id",
            "--name-status",
            parent,
            hash,
         ])?,
         None => self.run(&[
            "diff-tree",
            "-r",
            "-M",
            "--root",
            "--no-commit-id",
            "--name-status",
            hash,
         ])?,
      };
      let mut changes = Vec::new();
      for line in raw.lines() {
         let mut fields = line.split('\t');
         let Some(status) = fields.next() else { continue };
         match status.chars().next() {
            Some('A') => {
               if let Some(path) = fields.next() {
                  changes.push(FileChange { kind: ChangeKind::Added, path: path.to_string() });
               }
            },
            Some('M') | Some('T') => {
               if let Some(path) = fields.next() {
                  changes.push(FileChange { kind: ChangeKind::Modified, path: path.to_string() });
               }
            },
            Some('D') => {
               if let Some(path) = fields.next() {
                  changes.push(FileChange { kind: ChangeKind::Deleted, path: path.to_string() });
               }
            },
            Some('R') => {
               if let (Some(old_path), Some(new_path)) = (fields.next(), fields.next()) {
                  changes.push(FileChange {
                     kind: ChangeKind::Renamed { old_path: old_path.to_string() },
                     path: new_path.to_string(),
                  });
               }
            },
            _ => {},
         }
      }
      Ok(changes)
   }

   /// Blob contents of `path` at `rev`; `None` when the path is absent there.
   pub fn show_blob(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>> {
      let object = format!("{rev}:{path}");
      match self.run_raw(&["cat-file", "blob", &object], None) {
         Ok(bytes) => Ok(Some(bytes)),
         Err(SvcsError::GitError(_)) => Ok(None),
         Err(e) => Err(e),
      }
   }

   /// All commit hashes reachable from any ref.
   pub fn reachable_hashes(&self) -> Result<HashSet<String>> {
      let raw = self.run(&["rev-list", "--all"])?;
      Ok(raw.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
   }

   /// Commits introduced by a ref update, oldest first, excluding commits
   /// already reachable elsewhere (post-receive walk).
   pub fn new_commits(&self, old: &str, new: &str) -> Result<Vec<String>> {
      const ZERO: &str = "0000000000000000000000000000000000000000";
      if new == ZERO {
         return Ok(Vec::new());
      }
      let raw = if old == ZERO {
         self.run(&["rev-list", "--reverse", new, "--not", "--all"])?
      } else {
         let range = format!("{old}..{new}");
         self.run(&["rev-list", "--reverse", &range])?
      };
      Ok(raw.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
   }

   /// First configured remote, if any.
   pub fn default_remote(&self) -> Result<Option<String>> {
      let raw = self.run(&["remote"])?;
      Ok(raw.lines().next().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()))
   }

   // === Notes plumbing ===

   pub fn notes_add(&self, notes_ref: &str, commit: &str, content: &str) -> Result<()> {
      let reference = format!("--ref={notes_ref}");
      self.run_raw(
         &["notes", &reference, "add", "-f", "-F", "-", commit],
         Some(content.as_bytes()),
      )?;
      Ok(())
   }

   /// Pairs of (note object, annotated commit) on a notes ref.
   pub fn notes_list(&self, notes_ref: &str) -> Result<Vec<(String, String)>> {
      let reference = format!("--ref={notes_ref}");
      let raw = match self.run(&["notes", &reference, "list"]) {
         Ok(raw) => raw,
         // Missing notes ref means no notes yet.
         Err(SvcsError::GitError(_)) => return Ok(Vec::new()),
         Err(e) => return Err(e),
      };
      let mut notes = Vec::new();
      for line in raw.lines() {
         let mut fields = line.split_whitespace();
         if let (Some(note), Some(commit)) = (fields.next(), fields.next()) {
            notes.push((note.to_string(), commit.to_string()));
         }
      }
      Ok(notes)
   }

   pub fn notes_show(&self, notes_ref: &str, commit: &str) -> Result<Option<String>> {
      let reference = format!("--ref={notes_ref}");
      match self.run(&["notes", &reference, "show", commit]) {
         Ok(content) => Ok(Some(content)),
         Err(SvcsError::GitError(_)) => Ok(None),
         Err(e) => Err(e),
      }
   }

   pub fn notes_remove(&self, notes_ref: &str, commit: &str) -> Result<()> {
      let reference = format!("--ref={notes_ref}");
      self.run(&["notes", &reference, "remove", "--ignore-missing", commit])?;
      Ok(())
   }

   pub fn fetch_ref(&self, remote: &str, refspec: &str) -> Result<()> {
      self.run(&["fetch", remote, refspec])?;
      Ok(())
   }

   pub fn push_ref(&self, remote: &str, refspec: &str) -> Result<()> {
      self.run(&["push", remote, refspec])?;
      Ok(())
   }

   pub fn ref_exists(&self, reference: &str) -> bool {
      self.run(&["show-ref", "--verify", "--quiet", reference]).is_ok()
   }

   pub fn delete_ref(&self, reference: &str) -> Result<()> {
      self.run(&["update-ref", "-d", reference])?;
      Ok(())
   }

   /// (blob sha, path) entries of a tree-ish, recursive.
   pub fn ls_tree(&self, rev: &str) -> Result<Vec<(String, String)>> {
      let raw = self.run(&["ls-tree", "-r", rev])?;
      let mut entries = Vec::new();
      for line in raw.lines() {
         // <mode> SP <type> SP <sha> TAB <path>
         let Some((meta, path)) = line.split_once('\t') else { continue };
         if let Some(sha) = meta.split_whitespace().nth(2) {
            entries.push((sha.to_string(), path.to_string()));
         }
      }
      Ok(entries)
   }

   pub fn cat_blob(&self, sha: &str) -> Result<Vec<u8>> {
      self.run_raw(&["cat-file", "blob", sha], None)
   }
}

const fn status_success(code: Option<i32>) -> bool {
   matches!(code, Some(0))
}

#[cfg(test)]
mod tests {
   use super::*;

   fn scratch_repo() -> (tempfile::TempDir, Git) {
      let dir = tempfile::tempdir().unwrap();
      run_git(dir.path(), &["init", "-q", "-b", "main"]);
      run_git(dir.path(), &["config", "user.email", "test@example.com"]);
      run_git(dir.path(), &["config", "user.name", "Test"]);
      let git = Git::open(dir.path(), 30).unwrap();
      (dir, git)
   }

   fn run_git(dir: &Path, args: &[&str]) {
      let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
      assert!(status.success(), "git {args:?} failed");
   }

   fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
      std::fs::write(dir.join(name), content).unwrap();
      run_git(dir, &["add", "."]);
      run_git(dir, &["commit", "-q", "-m", message]);
   }

   #[test]
   fn test_open_rejects_non_repo() {
      let dir = tempfile::tempdir().unwrap();
      assert!(matches!(Git::open(dir.path(), 30), Err(SvcsError::NotARepository(_))));
   }

   #[test]
   fn test_changed_files_and_blobs() {
      let (dir, git) = scratch_repo();
      commit_file(dir.path(), "a.py", "x = 1\n", "first");
      let head = git.head_hash().unwrap();

      let changes = git.changed_files(&head, None).unwrap();
      assert_eq!(changes.len(), 1);
      assert_eq!(changes[0].kind, ChangeKind::Added);
      assert_eq!(changes[0].path, "a.py");

      let blob = git.show_blob(&head, "a.py").unwrap().unwrap();
      assert_eq!(blob, b"x = 1\n");
      assert!(git.show_blob(&head, "missing.py").unwrap().is_none());

      // Root commit has no parent.
      assert_eq!(git.parent_of(&head).unwrap(), None);
   }

   #[test]
   fn test_commit_info() {
      let (dir, git) = scratch_repo();
      commit_file(dir.path(), "a.py", "x = 1\n", "add module");
      let head = git.head_hash().unwrap();
      let info = git.commit_info(&head, "main").unwrap();
      assert_eq!(info.author, "Test <test@example.com>");
      assert_eq!(info.message, "add module");
      assert!(info.timestamp > 0);
   }

   #[test]
   fn test_notes_round_trip() {
      let (dir, git) = scratch_repo();
      commit_file(dir.path(), "a.py", "x = 1\n", "first");
      let head = git.head_hash().unwrap();

      let notes_ref = "refs/notes/svcs-semantic";
      git.notes_add(notes_ref, &head, "{\"k\": 1}\n").unwrap();
      let shown = git.notes_show(notes_ref, &head).unwrap().unwrap();
      assert!(shown.contains("\"k\""));

      let listed = git.notes_list(notes_ref).unwrap();
      assert_eq!(listed.len(), 1);
      assert_eq!(listed[0].1, head);

      // Replace, not append.
      git.notes_add(notes_ref, &head, "{\"k\": 2}\n").unwrap();
      let shown = git.notes_show(notes_ref, &head).unwrap().unwrap();
      assert!(shown.contains('2'));
   }
}
