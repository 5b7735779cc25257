//! Run configuration, loaded from a TOML file.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FixupError, Result};
use crate::executor::ObClientExecutor;
use crate::objects::ObjectType;
use crate::scheduler::{OrderMode, ScanOptions};

/// Connection settings for the target's command-line client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Client binary, e.g. `obclient`.
    pub client: String,
    pub host: String,
    pub port: u16,
    /// `user@tenant#cluster` for OceanBase.
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    /// Appended after the generated arguments.
    pub extra_args: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            client: "obclient".to_string(),
            host: "127.0.0.1".to_string(),
            port: 2881,
            user: "SYS@oracle".to_string(),
            password: String::new(),
            database: None,
            extra_args: vec![],
        }
    }
}

impl TargetConfig {
    pub fn client_args(&self) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            self.host.clone(),
            "-P".to_string(),
            self.port.to_string(),
            "-u".to_string(),
            self.user.clone(),
        ];
        if !self.password.is_empty() {
            args.push(format!("-p{}", self.password));
        }
        if let Some(database) = &self.database {
            args.push("-D".to_string());
            args.push(database.clone());
        }
        // tab-separated rows without a header line
        args.push("-N".to_string());
        args.push("-s".to_string());
        args.extend(self.extra_args.iter().cloned());
        args
    }

    pub fn executor(&self) -> ObClientExecutor {
        ObClientExecutor::new(self.client.clone(), self.client_args())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FixupSettings {
    pub root: PathBuf,
    /// Archive for applied scripts, relative to `root`.
    pub done_dir: String,
    pub smart_order: bool,
    pub only_dirs: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub file_globs: Vec<String>,
    pub max_rounds: usize,
    /// Fewer newly applied scripts than this in a round ends the run.
    pub min_progress: usize,
    pub statement_timeout_secs: u64,
    pub max_sql_file_bytes: u64,
    /// Take the `CURRENT_SCHEMA` of a script from a `SCHEMA.NAME.sql` file name.
    pub schema_from_filename: bool,
}

impl Default for FixupSettings {
    fn default() -> Self {
        FixupSettings {
            root: PathBuf::from("fixup_scripts"),
            done_dir: "done".to_string(),
            smart_order: false,
            only_dirs: vec![],
            exclude_dirs: vec!["grants_all".to_string()],
            file_globs: vec!["*.sql".to_string()],
            max_rounds: 3,
            min_progress: 1,
            statement_timeout_secs: 60,
            max_sql_file_bytes: 50 * 1024 * 1024,
            schema_from_filename: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrantSettings {
    /// Grant directories in priority order.
    pub tiers: Vec<String>,
    pub auto_grant: bool,
    pub auto_grant_types: Vec<String>,
}

impl Default for GrantSettings {
    fn default() -> Self {
        GrantSettings {
            tiers: vec!["grants_miss".to_string(), "grants_all".to_string()],
            auto_grant: true,
            auto_grant_types: [
                "TABLE",
                "VIEW",
                "MATERIALIZED VIEW",
                "SEQUENCE",
                "SYNONYM",
                "PROCEDURE",
                "FUNCTION",
                "PACKAGE",
                "TYPE",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecompileSettings {
    pub enabled: bool,
    pub max_retries: usize,
    /// Empty means every non-builtin owner.
    pub owners: Vec<String>,
}

impl Default for RecompileSettings {
    fn default() -> Self {
        RecompileSettings {
            enabled: true,
            max_retries: 5,
            owners: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewChainSettings {
    /// Where comparator run directories live.
    pub report_dir: PathBuf,
    pub report_prefix: String,
    /// Output directory for plans, relative to the fixup root.
    pub plan_dir: String,
    pub cache_capacity: usize,
}

impl Default for ViewChainSettings {
    fn default() -> Self {
        ViewChainSettings {
            report_dir: PathBuf::from("main_reports"),
            report_prefix: "VIEWs_chain".to_string(),
            plan_dir: "view_chain_plans".to_string(),
            cache_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FixupConfig {
    pub target: TargetConfig,
    pub fixup: FixupSettings,
    pub grants: GrantSettings,
    pub recompile: RecompileSettings,
    pub view_chain: ViewChainSettings,
}

impl FixupConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| FixupError::io(path, e))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.fixup.statement_timeout_secs.max(1))
    }

    pub fn order_mode(&self) -> OrderMode {
        if self.fixup.smart_order {
            OrderMode::Smart
        } else {
            OrderMode::Standard
        }
    }

    /// Scan options for the fixup root. The view-chain plan directory is never
    /// executed as a layer of its own.
    pub fn scan_options(&self) -> ScanOptions {
        let mut exclude_dirs = self.fixup.exclude_dirs.clone();
        if !exclude_dirs.contains(&self.view_chain.plan_dir) {
            exclude_dirs.push(self.view_chain.plan_dir.clone());
        }
        ScanOptions {
            mode: self.order_mode(),
            done_dir: self.fixup.done_dir.clone(),
            only_dirs: self.fixup.only_dirs.clone(),
            exclude_dirs,
            file_globs: self.fixup.file_globs.clone(),
        }
    }

    pub fn done_root(&self) -> PathBuf {
        self.fixup.root.join(&self.fixup.done_dir)
    }

    pub fn grant_tiers(&self) -> Vec<&str> {
        self.grants.tiers.iter().map(String::as_str).collect()
    }

    pub fn auto_grant_types(&self) -> HashSet<ObjectType> {
        self.grants.auto_grant_types.iter().map(|t| ObjectType::parse(t)).collect()
    }
}
