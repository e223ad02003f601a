use std::io::BufReader;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use svcs::error::{Result, SvcsError};
use svcs::events::SemanticEvent;
use svcs::repo::{RepositoryContext, init_logging};
use svcs::store::{Filters, OrderBy};
use svcs::{hooks, style};

#[derive(Parser)]
#[command(name = "svcs", version, about = "Semantic version control on top of git")]
struct Args {
   /// Repository path (defaults to the current directory)
   #[arg(long, global = true, default_value = ".")]
   path: PathBuf,

   #[command(subcommand)]
   command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
   /// Initialize SVCS for a repository: store, config, and git hooks
   Init,

   /// Remove SVCS hooks (keeps the store and configuration)
   Uninstall,

   /// Show repository, store, and hook state
   Status,

   /// Analyze a commit and record its semantic events
   Analyze {
      /// Commit to analyze
      #[arg(default_value = "HEAD")]
      commit: String,
   },

   /// List semantic events with filters
   Events(EventFilterArgs),

   /// Ordered history of one node (e.g. func:calc.add)
   Evolution {
      node_id: String,
      #[command(flatten)]
      filters: EventFilterArgs,
   },

   /// Compare semantic events between two branches
   Compare { branch_a: String, branch_b: String },

   /// Grouped statistics over semantic events
   Stats {
      /// Group by event_type, layer, author, or location
      #[arg(long, default_value = "event_type")]
      group_by: String,
      #[arg(long)]
      since:    Option<String>,
      #[arg(long)]
      until:    Option<String>,
   },

   /// Fetch or push the semantic notes ref
   Sync {
      #[command(subcommand)]
      direction: SyncDirection,
   },

   /// Remove commits no longer reachable in the git object graph
   Prune,

   /// Remove all SVCS state for this repository
   Purge {
      /// Skip the confirmation prompt
      #[arg(long)]
      yes: bool,
   },

   /// Git hook entry point (invoked by the installed shims)
   #[command(hide = true)]
   Hook {
      name: String,
      args: Vec<String>,
   },
}

#[derive(Subcommand)]
enum SyncDirection {
   /// Fetch the remote notes ref and import its events
   Fetch {
      #[arg(long)]
      remote: Option<String>,
   },
   /// Push the local notes ref
   Push {
      #[arg(long)]
      remote: Option<String>,
   },
}

#[derive(clap::Args, Default)]
struct EventFilterArgs {
   /// Author substring
   #[arg(long)]
   author: Option<String>,

   /// Event types to include (repeatable)
   #[arg(long = "type")]
   event_types: Vec<String>,

   /// Layers to include: core, 5a, 5b (repeatable)
   #[arg(long = "layer")]
   layers: Vec<String>,

   /// Location (file path) substring
   #[arg(long)]
   location: Option<String>,

   /// Details substring (e.g. a dependency name)
   #[arg(long)]
   details: Option<String>,

   #[arg(long)]
   min_confidence: Option<f64>,

   #[arg(long)]
   max_confidence: Option<f64>,

   /// ISO date or relative expression ("7 days ago", "last sprint")
   #[arg(long)]
   since: Option<String>,

   #[arg(long)]
   until: Option<String>,

   #[arg(long)]
   node_id: Option<String>,

   #[arg(long)]
   branch: Option<String>,

   /// Sort field: timestamp, confidence, event_type, author
   #[arg(long, default_value = "timestamp")]
   order_by: String,

   /// Sort ascending instead of descending
   #[arg(long)]
   asc: bool,

   #[arg(long, default_value_t = 50)]
   limit: usize,

   #[arg(long, default_value_t = 0)]
   offset: usize,
}

impl EventFilterArgs {
   fn into_filters(self) -> Result<Filters> {
      for layer in &self.layers {
         if svcs::Layer::parse(layer).is_none() {
            return Err(SvcsError::ValidationError(format!("unknown layer tag: {layer}")));
         }
      }
      Ok(Filters {
         author:           self.author,
         event_types:      self.event_types,
         layers:           self.layers,
         location_pattern: self.location,
         details_pattern:  self.details,
         min_confidence:   self.min_confidence,
         max_confidence:   self.max_confidence,
         since:            self.since,
         until:            self.until,
         node_id:          self.node_id,
         branch:           self.branch,
         order_by:         OrderBy::parse(&self.order_by)?,
         order_desc:       !self.asc,
         limit:            Some(self.limit),
         offset:           self.offset,
      })
   }
}

fn main() {
   let args = Args::parse();
   match run(args) {
      Ok(()) => {},
      Err(e) => {
         eprintln!("{}", style::error(&format!("svcs: {e}")));
         std::process::exit(e.exit_code());
      },
   }
}

fn run(args: Args) -> Result<()> {
   match args.command {
      CliCommand::Init => {
         let ctx = RepositoryContext::init(&args.path)?;
         let _guard = init_logging(ctx.svcs_dir(), &ctx.config().log_level);
         println!(
            "{} Initialized SVCS for '{}' at {}",
            style::success("✓"),
            ctx.config().repository_name,
            ctx.root().display()
         );
         Ok(())
      },
      CliCommand::Uninstall => {
         let ctx = RepositoryContext::open(&args.path)?;
         ctx.uninstall()?;
         println!("{} SVCS hooks removed", style::success("✓"));
         Ok(())
      },
      CliCommand::Status => {
         let ctx = RepositoryContext::open(&args.path)?;
         let report = ctx.status()?;
         println!("{}", style::bold(&format!("Repository: {}", report.name)));
         println!("  path:     {}", report.path.display());
         println!("  branch:   {}{}", report.branch, if report.bare { " (bare)" } else { "" });
         println!("  commits:  {}", report.commit_count);
         println!("  events:   {}", report.event_count);
         println!("  unsynced: {}", report.unsynced_commits);
         for (name, state) in report.hooks {
            let label = match state {
               hooks::HookState::Installed => style::success("installed"),
               hooks::HookState::NotInstalled => style::warning("missing"),
               hooks::HookState::Foreign => style::warning("foreign"),
            };
            println!("  hook {name}: {label}");
         }
         Ok(())
      },
      CliCommand::Analyze { commit } => {
         let ctx = RepositoryContext::open(&args.path)?;
         let _guard = init_logging(ctx.svcs_dir(), &ctx.config().log_level);
         let analysis = ctx.analyze_commit(&commit)?;
         println!(
            "Analyzed {} ({} file(s), {} binary skipped): {} event(s)",
            &analysis.commit.commit_hash[..8],
            analysis.files_analyzed,
            analysis.binary_files_skipped,
            analysis.events.len()
         );
         for event in &analysis.events {
            print_event(event);
         }
         Ok(())
      },
      CliCommand::Events(filter_args) => {
         let ctx = RepositoryContext::open(&args.path)?;
         let filters = filter_args.into_filters()?;
         let events = ctx.store().query_events(&filters)?;
         if events.is_empty() {
            println!("No semantic events found");
         }
         for event in &events {
            print_event(event);
         }
         Ok(())
      },
      CliCommand::Evolution { node_id, filters } => {
         let ctx = RepositoryContext::open(&args.path)?;
         let filters = filters.into_filters()?;
         let events = ctx.store().node_evolution(&node_id, &filters)?;
         if events.is_empty() {
            println!("No history recorded for {node_id}");
         }
         for event in &events {
            print_event(event);
         }
         Ok(())
      },
      CliCommand::Compare { branch_a, branch_b } => {
         let ctx = RepositoryContext::open(&args.path)?;
         let comparison = ctx.store().compare_branches(&branch_a, &branch_b)?;
         println!("{}", style::bold(&format!("Only in {branch_a}:")));
         for (node_id, event_type) in &comparison.only_in_a {
            println!("  {node_id} {}", style::dim(event_type));
         }
         println!("{}", style::bold(&format!("Only in {branch_b}:")));
         for (node_id, event_type) in &comparison.only_in_b {
            println!("  {node_id} {}", style::dim(event_type));
         }
         println!("{}", style::bold("Common with differences:"));
         for (node_id, event_type) in &comparison.common_with_diff {
            println!("  {node_id} {}", style::dim(event_type));
         }
         Ok(())
      },
      CliCommand::Stats { group_by, since, until } => {
         let ctx = RepositoryContext::open(&args.path)?;
         let rows = ctx.store().stats(&group_by, since.as_deref(), until.as_deref())?;
         for row in rows {
            println!(
               "{:>6}  {}  (avg confidence {:.2})",
               row.count,
               style::bold(&row.group),
               row.avg_confidence
            );
         }
         Ok(())
      },
      CliCommand::Sync { direction } => {
         let ctx = RepositoryContext::open(&args.path)?;
         let _guard = init_logging(ctx.svcs_dir(), &ctx.config().log_level);
         match direction {
            SyncDirection::Fetch { remote } => {
               let imported = ctx.sync_notes_fetch(remote.as_deref())?;
               println!("{} Imported notes for {imported} commit(s)", style::success("✓"));
            },
            SyncDirection::Push { remote } => {
               ctx.reconcile_notes()?;
               ctx.sync_notes_push(remote.as_deref())?;
               println!("{} Notes pushed", style::success("✓"));
            },
         }
         Ok(())
      },
      CliCommand::Prune => {
         let ctx = RepositoryContext::open(&args.path)?;
         let (commits, events) = ctx.prune()?;
         println!("Pruned {commits} commit(s) and {events} event(s)");
         Ok(())
      },
      CliCommand::Purge { yes } => {
         if !yes {
            return Err(SvcsError::ValidationError(
               "purge is destructive; pass --yes to confirm".to_string(),
            ));
         }
         let ctx = RepositoryContext::open(&args.path)?;
         ctx.purge()?;
         println!("{} SVCS state removed", style::success("✓"));
         Ok(())
      },
      CliCommand::Hook { name, args: hook_args } => run_hook(&args.path, &name, &hook_args),
   }
}

/// Hook dispatch. The orchestrator never aborts the user's git command on
/// its own errors: failures are logged and swallowed unless strict mode is
/// on. The `update` hook is the exception, since rejecting a malformed
/// notes push is its whole purpose.
fn run_hook(path: &std::path::Path, name: &str, hook_args: &[String]) -> Result<()> {
   let ctx = match RepositoryContext::open(path) {
      Ok(ctx) => ctx,
      // An uninitialized repository silently skips analysis.
      Err(SvcsError::NotInitialized(_)) => return Ok(()),
      Err(e) => return Err(e),
   };
   let _guard = init_logging(ctx.svcs_dir(), &ctx.config().log_level);

   let result = match name {
      "post-commit" => hooks::run_post_commit(&ctx),
      "post-merge" => hooks::run_post_merge(&ctx),
      "post-checkout" => hooks::run_post_checkout(&ctx),
      "pre-push" => hooks::run_pre_push(&ctx),
      "post-receive" => hooks::run_post_receive(&ctx, &mut BufReader::new(std::io::stdin())),
      "update" => {
         let [reference, old, new] = hook_args else {
            return Err(SvcsError::ValidationError(
               "update hook expects <ref> <old> <new>".to_string(),
            ));
         };
         return hooks::run_update(&ctx, reference, old, new);
      },
      other => {
         return Err(SvcsError::ValidationError(format!("unknown hook: {other}")));
      },
   };

   match result {
      Ok(()) => Ok(()),
      Err(e) if ctx.config().strict_hooks => Err(e),
      Err(e) => {
         tracing::error!(hook = name, error = %e, "hook failed (non-strict; continuing)");
         eprintln!("SVCS: warning: {name} hook failed ({e})");
         Ok(())
      },
   }
}

fn print_event(event: &SemanticEvent) {
   let confidence = event
      .confidence
      .map(|c| format!(" ({c:.0}%)", c = c * 100.0))
      .unwrap_or_default();
   println!(
      "• {} {} {}{}",
      style::bold(&event.event_type),
      event.node_id,
      style::dim(&event.location),
      style::dim(&confidence)
   );
   println!("  {}", event.details);
}
