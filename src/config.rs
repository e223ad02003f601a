use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const CONFIG_FILE: &str = "config.json";
pub const SCHEMA_VERSION: u32 = 1;

/// Per-repository configuration, persisted as `.svcs/config.json`.
///
/// Environment variables override file values:
/// - `SVCS_LLM_API_KEY` overrides `llm_api_key` (absence disables layer 5b)
/// - `SVCS_LOG_LEVEL` overrides `log_level`
/// - `SVCS_DISABLE_LAYER_5B` forces layer 5b off regardless of key presence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SvcsConfig {
   /// Display name for this repository.
   pub repository_name: String,

   pub schema_version: u32,

   /// Base URL of an Anthropic-compatible messages endpoint.
   pub llm_api_url: String,

   pub llm_model: String,

   /// API key enabling layer 5b; never written back to disk.
   #[serde(skip_serializing)]
   pub llm_api_key: Option<String>,

   pub disable_layer_5b: bool,

   /// Per-call LLM timeout in seconds.
   pub llm_timeout_secs: u64,

   pub llm_connect_timeout_secs: u64,
   pub llm_max_retries:          u32,
   pub llm_initial_backoff_ms:   u64,

   /// Smart-truncation limit for each side of the LLM prompt, in characters.
   pub llm_max_code_chars: usize,

   /// Confidence cut-off applied to layer 5a and 5b events.
   pub min_confidence: f64,

   /// `function_complexity_changed` fires on absolute delta >= this...
   pub complexity_abs_threshold: u32,

   /// ...or relative delta >= this fraction of the before score.
   pub complexity_rel_threshold: f64,

   /// Lambda + comprehension + higher-order-call population change that
   /// counts as a functional-programming shift.
   pub functional_usage_threshold: usize,

   /// Timeout for git subprocess invocations in seconds.
   pub git_timeout_secs: u64,

   pub log_level: String,

   /// When true, hook entry points propagate store failures with a non-zero
   /// exit instead of logging and exiting clean.
   pub strict_hooks: bool,
}

impl Default for SvcsConfig {
   fn default() -> Self {
      Self {
         repository_name:            String::new(),
         schema_version:             SCHEMA_VERSION,
         llm_api_url:                "https://api.anthropic.com".to_string(),
         llm_model:                  "claude-haiku-4-5".to_string(),
         llm_api_key:                None,
         disable_layer_5b:           false,
         llm_timeout_secs:           30,
         llm_connect_timeout_secs:   10,
         llm_max_retries:            3,
         llm_initial_backoff_ms:     500,
         llm_max_code_chars:         2000,
         min_confidence:             0.6,
         complexity_abs_threshold:   2,
         complexity_rel_threshold:   0.2,
         functional_usage_threshold: 3,
         git_timeout_secs:           30,
         log_level:                  "info".to_string(),
         strict_hooks:               false,
      }
   }
}

impl SvcsConfig {
   /// Load from `<svcs_dir>/config.json`, falling back to defaults when the
   /// file is absent, then apply environment overrides.
   pub fn load(svcs_dir: &Path) -> Result<Self> {
      let path = svcs_dir.join(CONFIG_FILE);
      let mut config = if path.exists() {
         let raw = std::fs::read_to_string(&path)?;
         serde_json::from_str(&raw)?
      } else {
         Self::default()
      };
      config.apply_env_overrides();
      Ok(config)
   }

   /// Write the current configuration to `<svcs_dir>/config.json`.
   pub fn save(&self, svcs_dir: &Path) -> Result<()> {
      let path = svcs_dir.join(CONFIG_FILE);
      let raw = serde_json::to_string_pretty(self)?;
      std::fs::write(path, raw)?;
      Ok(())
   }

   fn apply_env_overrides(&mut self) {
      if let Ok(key) = std::env::var("SVCS_LLM_API_KEY") {
         if !key.is_empty() {
            self.llm_api_key = Some(key);
         }
      }
      if let Ok(level) = std::env::var("SVCS_LOG_LEVEL") {
         if !level.is_empty() {
            self.log_level = level;
         }
      }
      if std::env::var("SVCS_DISABLE_LAYER_5B").is_ok() {
         self.disable_layer_5b = true;
      }
   }

   /// Layer 5b runs only with a key configured and no explicit disable.
   pub fn layer_5b_enabled(&self) -> bool {
      !self.disable_layer_5b && self.llm_api_key.as_deref().is_some_and(|k| !k.is_empty())
   }
}
