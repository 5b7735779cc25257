//! Index of GRANT statements found in the grant-script tiers.
//!
//! A tier is one directory of grant scripts under the fixup root, e.g.
//! `grants_miss` (only the grants the comparator found missing) and
//! `grants_all` (every grant known on the source). Tiers are searched in
//! priority order and the first tier with a match wins.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{FixupError, Result};
use crate::objects::{normalize_identifier, QualifiedName};
use crate::statements::split_sql_statements;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    Object,
    System,
}

/// One grantee's share of a parsed GRANT statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantEntry {
    pub grantee: String,
    pub privileges: BTreeSet<String>,
    /// `SCHEMA.NAME` for object grants, `None` for system privileges.
    pub object_name: Option<String>,
    pub statement: String,
    pub source_path: PathBuf,
    pub grant_type: GrantType,
}

impl GrantEntry {
    pub fn covers(&self, privilege: &str) -> bool {
        let privilege = privilege.trim().to_uppercase();
        privilege.is_empty() || self.privileges.contains("ALL") || self.privileges.contains(&privilege)
    }
}

fn object_grant_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)^\s*grant\s+(.+?)\s+on\s+(?:directory\s+|java\s+source\s+)?("?[\w$#]+"?(?:\s*\.\s*"?[\w$#]+"?)?)\s+to\s+(.+?)\s*(with\s+grant\s+option)?\s*;?\s*$"#,
        )
        .unwrap()
    })
}

fn system_grant_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*grant\s+(.+?)\s+to\s+(.+?)\s*(with\s+admin\s+option)?\s*;?\s*$"#).unwrap()
    })
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn normalize_privilege(raw: &str) -> String {
    let privilege = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if privilege == "ALL PRIVILEGES" {
        "ALL".to_string()
    } else {
        privilege
    }
}

/// Parses `GRANT <priv[,...]> ON <object> TO <grantee[,...]> [WITH GRANT OPTION];`
/// (or a system grant without `ON`) into one entry per grantee.
pub fn parse_grant_statement(statement: &str, source_path: &Path) -> Vec<GrantEntry> {
    let trimmed = statement.trim();
    if let Some(caps) = object_grant_regex().captures(trimmed) {
        let privileges: BTreeSet<String> = split_list(&caps[1]).map(normalize_privilege).collect();
        let object = QualifiedName::parse(&caps[2].replace(char::is_whitespace, "")).to_string();
        return split_list(&caps[3])
            .map(|grantee| GrantEntry {
                grantee: normalize_identifier(grantee),
                privileges: privileges.clone(),
                object_name: Some(object.clone()),
                statement: trimmed.to_string(),
                source_path: source_path.to_path_buf(),
                grant_type: GrantType::Object,
            })
            .collect();
    }
    if let Some(caps) = system_grant_regex().captures(trimmed) {
        let privileges: BTreeSet<String> = split_list(&caps[1]).map(normalize_privilege).collect();
        return split_list(&caps[2])
            .map(|grantee| GrantEntry {
                grantee: normalize_identifier(grantee),
                privileges: privileges.clone(),
                object_name: None,
                statement: trimmed.to_string(),
                source_path: source_path.to_path_buf(),
                grant_type: GrantType::System,
            })
            .collect();
    }
    vec![]
}

/// Grants loaded from one tier directory.
#[derive(Debug, Default)]
pub struct GrantTier {
    pub label: String,
    by_grantee_object: HashMap<(String, String), Vec<GrantEntry>>,
    by_object: HashMap<String, Vec<GrantEntry>>,
    system: Vec<GrantEntry>,
}

impl GrantTier {
    pub fn new(label: impl Into<String>) -> Self {
        GrantTier {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn insert(&mut self, entry: GrantEntry) {
        match (&entry.grant_type, &entry.object_name) {
            (GrantType::Object, Some(object)) => {
                self.by_grantee_object
                    .entry((entry.grantee.clone(), object.clone()))
                    .or_default()
                    .push(entry.clone());
                self.by_object.entry(object.clone()).or_default().push(entry);
            }
            _ => self.system.push(entry),
        }
    }

    pub fn grants_for(&self, grantee: &str, object: &str) -> &[GrantEntry] {
        self.by_grantee_object
            .get(&(grantee.to_string(), object.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn grants_on(&self, object: &str) -> &[GrantEntry] {
        self.by_object.get(object).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_object.values().map(Vec::len).sum::<usize>() + self.system.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All loaded tiers, in the order they were loaded.
#[derive(Debug, Default)]
pub struct GrantIndex {
    tiers: Vec<GrantTier>,
}

impl GrantIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans `<root>/<tier>/` and its archived twin `<root>/<done_dir>/<tier>/`
    /// once per tier label and indexes every grant statement found.
    pub fn load(root: &Path, done_dir: &str, tiers: &[String]) -> Result<Self> {
        let mut index = GrantIndex::new();
        for label in tiers {
            let mut tier = GrantTier::new(label.as_str());
            for dir in [root.join(label), root.join(done_dir).join(label)] {
                if !dir.is_dir() {
                    continue;
                }
                for path in sql_files(&dir)? {
                    let text = fs::read_to_string(&path).map_err(|e| FixupError::io(&path, e))?;
                    for statement in split_sql_statements(&text) {
                        for entry in parse_grant_statement(&statement, &path) {
                            tier.insert(entry);
                        }
                    }
                }
            }
            info!(tier = %label, grants = tier.len(), "loaded grant tier");
            index.tiers.push(tier);
        }
        Ok(index)
    }

    pub fn push_tier(&mut self, tier: GrantTier) {
        self.tiers.push(tier);
    }

    pub fn tier(&self, label: &str) -> Option<&GrantTier> {
        self.tiers.iter().find(|t| t.label == label)
    }

    /// Entries for `(grantee, object)` covering `privilege`, taken from the first
    /// tier in `priority` that has any. Returns the tier label alongside, or an
    /// empty list and `""` when no tier matches.
    pub fn find_grant_entries_by_priority(
        &self,
        grantee: &str,
        object: &str,
        privilege: &str,
        priority: &[&str],
    ) -> (Vec<&GrantEntry>, String) {
        let grantee = normalize_identifier(grantee);
        let object = QualifiedName::parse(object).to_string();
        for label in priority {
            let Some(tier) = self.tier(label) else {
                continue;
            };
            let found: Vec<&GrantEntry> = tier
                .grants_for(&grantee, &object)
                .iter()
                .filter(|e| e.covers(privilege))
                .collect();
            if !found.is_empty() {
                debug!(%grantee, %object, tier = %label, "grant found");
                return (found, label.to_string());
            }
        }
        (vec![], String::new())
    }

    /// Every grant on `object` from the first tier in `priority` that has any.
    pub fn find_object_grants_by_priority(&self, object: &str, priority: &[&str]) -> (Vec<&GrantEntry>, String) {
        let object = QualifiedName::parse(object).to_string();
        for label in priority {
            if let Some(tier) = self.tier(label) {
                let found = tier.grants_on(&object);
                if !found.is_empty() {
                    return (found.iter().collect(), label.to_string());
                }
            }
        }
        (vec![], String::new())
    }
}

fn sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let glob = OverrideBuilder::new(dir).add("*.sql")?.build()?;
    let mut files = vec![];
    for entry in WalkBuilder::new(dir).standard_filters(false).overrides(glob).build() {
        let entry = entry?;
        if entry.file_type().map_or(false, |t| t.is_file()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
