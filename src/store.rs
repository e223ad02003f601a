//! Repository-local semantic store.
//!
//! One SQLite database per repository under `.svcs/semantic.db`, holding
//! commits, branches, and semantic events. Writers are serialized by a
//! repository-level mutex; every multi-row write happens inside one
//! transaction so readers never observe a partial commit.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use serde_json::{Map, Value};

use crate::dates::{date_to_timestamp, parse_relative_date};
use crate::error::{Result, SvcsError};
use crate::events::{CommitInfo, Layer, SemanticEvent};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS repository_info (
   id             INTEGER PRIMARY KEY CHECK (id = 1),
   name           TEXT NOT NULL,
   path           TEXT NOT NULL,
   created_at     INTEGER NOT NULL,
   current_branch TEXT,
   status         TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS branches (
   name             TEXT PRIMARY KEY,
   created_at       INTEGER NOT NULL,
   last_analyzed_at INTEGER,
   parent_branch    TEXT,
   event_count      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS commits (
   commit_hash  TEXT PRIMARY KEY,
   branch       TEXT NOT NULL,
   author       TEXT NOT NULL,
   timestamp    INTEGER NOT NULL,
   message      TEXT,
   created_at   INTEGER NOT NULL,
   notes_synced INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS semantic_events (
   event_id          TEXT PRIMARY KEY,
   commit_hash       TEXT NOT NULL REFERENCES commits(commit_hash) ON DELETE CASCADE,
   branch            TEXT NOT NULL,
   event_type        TEXT NOT NULL,
   node_id           TEXT NOT NULL,
   location          TEXT NOT NULL,
   details           TEXT NOT NULL,
   layer             TEXT NOT NULL,
   layer_description TEXT NOT NULL,
   confidence        REAL,
   reasoning         TEXT,
   impact            TEXT,
   created_at        INTEGER NOT NULL,
   notes_synced      INTEGER NOT NULL DEFAULT 0,
   extra             TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_commit     ON semantic_events(commit_hash);
CREATE INDEX IF NOT EXISTS idx_events_event_type ON semantic_events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_branch     ON semantic_events(branch);
CREATE INDEX IF NOT EXISTS idx_events_node       ON semantic_events(node_id);
CREATE INDEX IF NOT EXISTS idx_commits_timestamp ON commits(timestamp);
";

/// Recognized sort fields for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
   Timestamp,
   Confidence,
   EventType,
   Author,
}

impl OrderBy {
   /// Strict parse; unknown fields are rejected at the interface boundary.
   pub fn parse(s: &str) -> Result<Self> {
      match s {
         "timestamp" => Ok(Self::Timestamp),
         "confidence" => Ok(Self::Confidence),
         "event_type" => Ok(Self::EventType),
         "author" => Ok(Self::Author),
         other => Err(SvcsError::ValidationError(format!("unknown order_by field: {other}"))),
      }
   }

   const fn sql(self) -> &'static str {
      match self {
         Self::Timestamp => "c.timestamp",
         Self::Confidence => "e.confidence",
         Self::EventType => "e.event_type",
         Self::Author => "c.author",
      }
   }
}

/// Optional-field filter set; exactly the fields `query_events` recognizes.
#[derive(Debug, Clone)]
pub struct Filters {
   pub author:           Option<String>,
   pub event_types:      Vec<String>,
   pub layers:           Vec<String>,
   pub location_pattern: Option<String>,
   pub details_pattern:  Option<String>,
   pub min_confidence:   Option<f64>,
   pub max_confidence:   Option<f64>,
   pub since:            Option<String>,
   pub until:            Option<String>,
   pub node_id:          Option<String>,
   pub branch:           Option<String>,
   pub order_by:         OrderBy,
   pub order_desc:       bool,
   pub limit:            Option<usize>,
   pub offset:           usize,
}

impl Default for Filters {
   fn default() -> Self {
      Self {
         author:           None,
         event_types:      Vec::new(),
         layers:           Vec::new(),
         location_pattern: None,
         details_pattern:  None,
         min_confidence:   None,
         max_confidence:   None,
         since:            None,
         until:            None,
         node_id:          None,
         branch:           None,
         order_by:         OrderBy::Timestamp,
         order_desc:       true,
         limit:            Some(100),
         offset:           0,
      }
   }
}

/// One row of `stats` output.
#[derive(Debug, Clone)]
pub struct StatsRow {
   pub group:            String,
   pub count:            u64,
   pub avg_confidence:   f64,
   pub latest_timestamp: i64,
}

/// Result of a branch comparison, grouped by (node_id, event_type).
#[derive(Debug, Default)]
pub struct BranchComparison {
   pub only_in_a:        Vec<(String, String)>,
   pub only_in_b:        Vec<(String, String)>,
   pub common_with_diff: Vec<(String, String)>,
}

/// The embedded relational store for one repository.
pub struct SemanticStore {
   conn: Mutex<Connection>,
}

impl SemanticStore {
   /// Open (creating if needed) the store at `path`.
   pub fn open(path: &Path) -> Result<Self> {
      let conn = Connection::open(path)?;
      Self::init(conn)
   }

   /// In-memory store for tests.
   pub fn open_in_memory() -> Result<Self> {
      Self::init(Connection::open_in_memory()?)
   }

   fn init(conn: Connection) -> Result<Self> {
      // Concurrent processes wait on the database lock instead of failing.
      conn.busy_timeout(std::time::Duration::from_secs(10))?;
      conn.execute_batch(SCHEMA)?;
      Ok(Self { conn: Mutex::new(conn) })
   }

   /// Record repository identity on init.
   pub fn set_repository_info(&self, name: &str, path: &str, branch: &str) -> Result<()> {
      let conn = self.conn.lock();
      conn.execute(
         "INSERT INTO repository_info (id, name, path, created_at, current_branch)
          VALUES (1, ?1, ?2, ?3, ?4)
          ON CONFLICT(id) DO UPDATE SET name = ?1, path = ?2, current_branch = ?4",
         params![name, path, Utc::now().timestamp(), branch],
      )?;
      Ok(())
   }

   pub fn update_current_branch(&self, branch: &str) -> Result<()> {
      let conn = self.conn.lock();
      let now = Utc::now().timestamp();
      conn.execute(
         "UPDATE repository_info SET current_branch = ?1 WHERE id = 1",
         params![branch],
      )?;
      conn.execute(
         "INSERT INTO branches (name, created_at) VALUES (?1, ?2)
          ON CONFLICT(name) DO NOTHING",
         params![branch, now],
      )?;
      Ok(())
   }

   /// Idempotent insert of a commit row.
   pub fn ensure_commit(&self, commit: &CommitInfo) -> Result<()> {
      let conn = self.conn.lock();
      insert_commit_row(&conn, commit)?;
      Ok(())
   }

   /// Transactionally insert the commit row and its events; all-or-nothing.
   /// Re-inserting the same `event_id` is a no-op, so imports are idempotent.
   pub fn insert_events(
      &self,
      commit: &CommitInfo,
      events: &[SemanticEvent],
      notes_synced: bool,
   ) -> Result<()> {
      let mut conn = self.conn.lock();
      let tx = conn.transaction()?;
      insert_commit_row(&tx, commit)?;
      {
         let now = Utc::now().timestamp();
         let mut statement = tx.prepare(
            "INSERT INTO semantic_events
               (event_id, commit_hash, branch, event_type, node_id, location, details,
                layer, layer_description, confidence, reasoning, impact, created_at,
                notes_synced, extra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(event_id) DO NOTHING",
         )?;
         for event in events {
            let extra = if event.extra.is_empty() {
               None
            } else {
               Some(serde_json::to_string(&event.extra)?)
            };
            statement.execute(params![
               event.event_id,
               commit.commit_hash,
               event.branch,
               event.event_type,
               event.node_id,
               event.location,
               event.details,
               event.layer.as_str(),
               event.layer_description,
               event.confidence,
               event.reasoning,
               event.impact,
               now,
               i64::from(notes_synced),
               extra,
            ])?;
         }
         let mut branch_statement = tx.prepare(
            "INSERT INTO branches (name, created_at, last_analyzed_at, event_count)
             VALUES (?1, ?2, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
               last_analyzed_at = ?2,
               event_count = event_count + ?3",
         )?;
         branch_statement.execute(params![commit.branch, Utc::now().timestamp(), events.len() as i64])?;
      }
      tx.commit()?;
      Ok(())
   }

   /// Flag a commit once its full event set is on the notes ref.
   pub fn mark_notes_synced(&self, commit_hash: &str) -> Result<()> {
      let conn = self.conn.lock();
      conn.execute(
         "UPDATE commits SET notes_synced = 1 WHERE commit_hash = ?1",
         params![commit_hash],
      )?;
      conn.execute(
         "UPDATE semantic_events SET notes_synced = 1 WHERE commit_hash = ?1",
         params![commit_hash],
      )?;
      Ok(())
   }

   pub fn commit_exists(&self, commit_hash: &str) -> Result<bool> {
      let conn = self.conn.lock();
      let found: Option<i64> = conn
         .query_row(
            "SELECT 1 FROM commits WHERE commit_hash = ?1",
            params![commit_hash],
            |row| row.get(0),
         )
         .optional()?;
      Ok(found.is_some())
   }

   /// All events of one commit in canonical (node_id, event_type, event_id)
   /// order, as encoded into its note payload.
   pub fn events_for_commit(&self, commit_hash: &str) -> Result<Vec<SemanticEvent>> {
      let conn = self.conn.lock();
      let mut statement = conn.prepare(
         "SELECT e.event_id, e.event_type, e.node_id, e.location, e.details, e.layer,
                 e.layer_description, e.confidence, e.reasoning, e.impact, e.branch,
                 c.author, c.timestamp, e.extra
          FROM semantic_events e
          JOIN commits c ON e.commit_hash = c.commit_hash
          WHERE e.commit_hash = ?1
          ORDER BY e.node_id ASC, e.event_type ASC, e.event_id ASC",
      )?;
      let rows = statement.query_map(params![commit_hash], row_to_event)?;
      let mut events = Vec::new();
      for row in rows {
         events.push(row?);
      }
      Ok(events)
   }

   /// Filtered, paginated event query joined with commit metadata.
   pub fn query_events(&self, filters: &Filters) -> Result<Vec<SemanticEvent>> {
      let mut sql = String::from(
         "SELECT e.event_id, e.event_type, e.node_id, e.location, e.details, e.layer,
                 e.layer_description, e.confidence, e.reasoning, e.impact, e.branch,
                 c.author, c.timestamp, e.extra
          FROM semantic_events e
          JOIN commits c ON e.commit_hash = c.commit_hash
          WHERE 1=1",
      );
      let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

      if let Some(author) = &filters.author {
         sql.push_str(" AND c.author LIKE ?");
         params_vec.push(Box::new(format!("%{author}%")));
      }
      if !filters.event_types.is_empty() {
         sql.push_str(&format!(
            " AND e.event_type IN ({})",
            placeholders(filters.event_types.len())
         ));
         for event_type in &filters.event_types {
            params_vec.push(Box::new(event_type.clone()));
         }
      }
      if !filters.layers.is_empty() {
         sql.push_str(&format!(" AND e.layer IN ({})", placeholders(filters.layers.len())));
         for layer in &filters.layers {
            params_vec.push(Box::new(layer.clone()));
         }
      }
      if let Some(pattern) = &filters.location_pattern {
         sql.push_str(" AND e.location LIKE ?");
         params_vec.push(Box::new(format!("%{pattern}%")));
      }
      if let Some(pattern) = &filters.details_pattern {
         sql.push_str(" AND e.details LIKE ?");
         params_vec.push(Box::new(format!("%{pattern}%")));
      }
      if let Some(min) = filters.min_confidence {
         sql.push_str(" AND e.confidence IS NOT NULL AND e.confidence >= ?");
         params_vec.push(Box::new(min));
      }
      if let Some(max) = filters.max_confidence {
         sql.push_str(" AND e.confidence IS NOT NULL AND e.confidence <= ?");
         params_vec.push(Box::new(max));
      }
      if let Some(since) = &filters.since {
         if let Some(date) = parse_relative_date(since) {
            sql.push_str(" AND c.timestamp >= ?");
            params_vec.push(Box::new(date_to_timestamp(date)));
         }
      }
      if let Some(until) = &filters.until {
         if let Some(date) = parse_relative_date(until) {
            sql.push_str(" AND c.timestamp <= ?");
            params_vec.push(Box::new(date_to_timestamp(date)));
         }
      }
      if let Some(node_id) = &filters.node_id {
         sql.push_str(" AND e.node_id = ?");
         params_vec.push(Box::new(node_id.clone()));
      }
      if let Some(branch) = &filters.branch {
         sql.push_str(" AND e.branch = ?");
         params_vec.push(Box::new(branch.clone()));
      }

      let direction = if filters.order_desc { "DESC" } else { "ASC" };
      // Ties break by (event_type asc, event_id asc) so ordering is total.
      sql.push_str(&format!(
         " ORDER BY {} {direction}, e.event_type ASC, e.event_id ASC",
         filters.order_by.sql()
      ));

      if let Some(limit) = filters.limit {
         sql.push_str(" LIMIT ?");
         params_vec.push(Box::new(limit as i64));
         sql.push_str(" OFFSET ?");
         params_vec.push(Box::new(filters.offset as i64));
      }

      let conn = self.conn.lock();
      let mut statement = conn.prepare(&sql)?;
      let rows = statement
         .query_map(rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())), row_to_event)?;
      let mut events = Vec::new();
      for row in rows {
         events.push(row?);
      }
      Ok(events)
   }

   /// Full ordered history of one node, oldest first.
   pub fn node_evolution(&self, node_id: &str, filters: &Filters) -> Result<Vec<SemanticEvent>> {
      let mut narrowed = filters.clone();
      narrowed.node_id = Some(node_id.to_string());
      narrowed.order_by = OrderBy::Timestamp;
      narrowed.order_desc = false;
      narrowed.limit = None;
      self.query_events(&narrowed)
   }

   /// Grouped statistics: (group, count, avg confidence, latest timestamp).
   pub fn stats(&self, group_by: &str, since: Option<&str>, until: Option<&str>) -> Result<Vec<StatsRow>> {
      let group_field = match group_by {
         "event_type" => "e.event_type",
         "layer" => "e.layer",
         "author" => "c.author",
         "location" => "e.location",
         other => {
            return Err(SvcsError::ValidationError(format!("unknown group_by field: {other}")));
         },
      };

      let mut sql = format!(
         "SELECT {group_field} AS grp,
                 COUNT(*) AS cnt,
                 AVG(COALESCE(e.confidence, 0)) AS avg_conf,
                 MAX(c.timestamp) AS latest
          FROM semantic_events e
          JOIN commits c ON e.commit_hash = c.commit_hash
          WHERE 1=1"
      );
      let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
      if let Some(date) = since.and_then(parse_relative_date) {
         sql.push_str(" AND c.timestamp >= ?");
         params_vec.push(Box::new(date_to_timestamp(date)));
      }
      if let Some(date) = until.and_then(parse_relative_date) {
         sql.push_str(" AND c.timestamp <= ?");
         params_vec.push(Box::new(date_to_timestamp(date)));
      }
      sql.push_str(&format!(" GROUP BY {group_field} ORDER BY cnt DESC, grp ASC"));

      let conn = self.conn.lock();
      let mut statement = conn.prepare(&sql)?;
      let rows = statement.query_map(
         rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
         |row| {
            Ok(StatsRow {
               group:            row.get(0)?,
               count:            row.get::<_, i64>(1)? as u64,
               avg_confidence:   row.get(2)?,
               latest_timestamp: row.get(3)?,
            })
         },
      )?;
      let mut out = Vec::new();
      for row in rows {
         out.push(row?);
      }
      Ok(out)
   }

   /// Delete commits (and cascade their events) that are no longer reachable
   /// in the git object graph. Returns (removed commits, removed events).
   pub fn prune_orphans(&self, reachable: &HashSet<String>) -> Result<(usize, usize)> {
      let mut conn = self.conn.lock();
      let tx = conn.transaction()?;

      let stored: Vec<String> = {
         let mut statement = tx.prepare("SELECT commit_hash FROM commits")?;
         let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
         let mut hashes = Vec::new();
         for row in rows {
            hashes.push(row?);
         }
         hashes
      };

      let mut removed_commits = 0;
      let mut removed_events = 0;
      for hash in stored {
         if reachable.contains(&hash) {
            continue;
         }
         removed_events +=
            tx.execute("DELETE FROM semantic_events WHERE commit_hash = ?1", params![hash])?;
         removed_commits += tx.execute("DELETE FROM commits WHERE commit_hash = ?1", params![hash])?;
      }
      tx.commit()?;
      Ok((removed_commits, removed_events))
   }

   /// Partition events of two branches by (node_id, event_type).
   pub fn compare_branches(&self, branch_a: &str, branch_b: &str) -> Result<BranchComparison> {
      let group = |branch: &str| -> Result<BTreeMap<(String, String), usize>> {
         let conn = self.conn.lock();
         let mut statement = conn.prepare(
            "SELECT node_id, event_type, COUNT(*) FROM semantic_events
             WHERE branch = ?1 GROUP BY node_id, event_type",
         )?;
         let rows = statement.query_map(params![branch], |row| {
            Ok(((row.get::<_, String>(0)?, row.get::<_, String>(1)?), row.get::<_, i64>(2)? as usize))
         })?;
         let mut out = BTreeMap::new();
         for row in rows {
            let (key, count) = row?;
            out.insert(key, count);
         }
         Ok(out)
      };

      let groups_a = group(branch_a)?;
      let groups_b = group(branch_b)?;
      let keys_a: BTreeSet<&(String, String)> = groups_a.keys().collect();
      let keys_b: BTreeSet<&(String, String)> = groups_b.keys().collect();

      let mut comparison = BranchComparison::default();
      for key in keys_a.difference(&keys_b) {
         comparison.only_in_a.push((*key).clone());
      }
      for key in keys_b.difference(&keys_a) {
         comparison.only_in_b.push((*key).clone());
      }
      for key in keys_a.intersection(&keys_b) {
         if groups_a[*key] != groups_b[*key] {
            comparison.common_with_diff.push((*key).clone());
         }
      }
      Ok(comparison)
   }

   /// Remove every row belonging to this repository.
   pub fn purge(&self) -> Result<()> {
      let mut conn = self.conn.lock();
      let tx = conn.transaction()?;
      tx.execute("DELETE FROM semantic_events", [])?;
      tx.execute("DELETE FROM commits", [])?;
      tx.execute("DELETE FROM branches", [])?;
      tx.execute("DELETE FROM repository_info", [])?;
      tx.commit()?;
      Ok(())
   }

   pub fn event_count(&self) -> Result<u64> {
      let conn = self.conn.lock();
      let count: i64 = conn.query_row("SELECT COUNT(*) FROM semantic_events", [], |row| row.get(0))?;
      Ok(count as u64)
   }

   pub fn commit_count(&self) -> Result<u64> {
      let conn = self.conn.lock();
      let count: i64 = conn.query_row("SELECT COUNT(*) FROM commits", [], |row| row.get(0))?;
      Ok(count as u64)
   }

   /// Commits whose notes have not been written yet (crash reconciliation).
   pub fn unsynced_commits(&self) -> Result<Vec<String>> {
      let conn = self.conn.lock();
      let mut statement =
         conn.prepare("SELECT commit_hash FROM commits WHERE notes_synced = 0")?;
      let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
      let mut out = Vec::new();
      for row in rows {
         out.push(row?);
      }
      Ok(out)
   }
}

fn insert_commit_row(conn: &Connection, commit: &CommitInfo) -> rusqlite::Result<()> {
   conn.execute(
      "INSERT INTO commits (commit_hash, branch, author, timestamp, message, created_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)
       ON CONFLICT(commit_hash) DO NOTHING",
      params![
         commit.commit_hash,
         commit.branch,
         commit.author,
         commit.timestamp,
         commit.message,
         Utc::now().timestamp(),
      ],
   )?;
   Ok(())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<SemanticEvent> {
   let layer_tag: String = row.get(5)?;
   let extra_raw: Option<String> = row.get(13)?;
   let extra: Map<String, Value> = extra_raw
      .as_deref()
      .and_then(|raw| serde_json::from_str(raw).ok())
      .unwrap_or_default();
   Ok(SemanticEvent {
      event_id: row.get(0)?,
      event_type: row.get(1)?,
      node_id: row.get(2)?,
      location: row.get(3)?,
      details: row.get(4)?,
      layer: Layer::parse(&layer_tag).unwrap_or(Layer::Core),
      layer_description: row.get(6)?,
      confidence: row.get(7)?,
      reasoning: row.get(8)?,
      impact: row.get(9)?,
      branch: row.get(10)?,
      author: row.get(11)?,
      timestamp: row.get(12)?,
      extra,
   })
}

fn placeholders(count: usize) -> String {
   vec!["?"; count].join(",")
}
