//! Parser for dependency-chain reports.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::error::{FixupError, Result};
use crate::objects::{ObjectNode, ObjectType, QualifiedName};

/// Objects read left to right as "depends on".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyChain {
    pub number: Option<u32>,
    pub nodes: Vec<ObjectNode>,
}

#[derive(Debug, Default, Clone)]
pub struct ChainReport {
    /// Source-side chains. Diagnostic only.
    pub source: Vec<DependencyChain>,
    /// Target/remapped chains; these drive execution order.
    pub target: Vec<DependencyChain>,
    /// Cycles listed by a master report.
    pub cycles: Vec<Vec<ObjectNode>>,
    /// Lines that looked like chains but could not be parsed.
    pub rejected: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Unsectioned,
    Source,
    Target,
    Cycles,
}

fn numbered_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\.\s+(.+?)\s*$").unwrap())
}

fn cycle_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s*\(CYCLE\)\s*$").unwrap())
}

/// Parses `SCHEMA.NAME(TYPE)`.
pub fn parse_node(raw: &str) -> Option<ObjectNode> {
    let raw = raw.trim();
    let open = raw.rfind('(')?;
    if !raw.ends_with(')') || open == 0 {
        return None;
    }
    let name = raw[..open].trim();
    let object_type = raw[open + 1..raw.len() - 1].trim();
    if name.is_empty() || object_type.is_empty() {
        return None;
    }
    Some(ObjectNode::new(QualifiedName::parse(name), ObjectType::parse(object_type)))
}

/// Parses the `A(TYPE) -> B(TYPE) -> ...` part of a chain line.
pub fn parse_chain(body: &str) -> Option<Vec<ObjectNode>> {
    body.split("->").map(parse_node).collect()
}

pub fn parse_chain_report(text: &str) -> ChainReport {
    let mut report = ChainReport::default();
    let mut section = Section::Unsectioned;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let upper = trimmed.to_uppercase();
        if upper.starts_with("[SOURCE") {
            section = Section::Source;
            continue;
        }
        if upper.starts_with("[TARGET") {
            section = Section::Target;
            continue;
        }
        if upper.starts_with("[CYCLES") {
            section = Section::Cycles;
            continue;
        }

        if section == Section::Cycles {
            let body = match numbered_line().captures(trimmed) {
                Some(caps) => caps[2].to_string(),
                None => trimmed.to_string(),
            };
            let body = cycle_suffix().replace(&body, "");
            match parse_chain(&body) {
                Some(nodes) if !nodes.is_empty() => report.cycles.push(nodes),
                _ => report.rejected.push(trimmed.to_string()),
            }
            continue;
        }

        let Some(caps) = numbered_line().captures(trimmed) else {
            continue;
        };
        let number = caps[1].parse::<u32>().ok();
        match parse_chain(&caps[2]) {
            Some(nodes) => {
                let chain = DependencyChain { number, nodes };
                match section {
                    Section::Source => report.source.push(chain),
                    _ => report.target.push(chain),
                }
            }
            None => {
                warn!(line = trimmed, "unparseable dependency chain");
                report.rejected.push(trimmed.to_string());
            }
        }
    }
    report
}

pub fn read_chain_report(path: &Path) -> Result<ChainReport> {
    let text = fs::read_to_string(path).map_err(|e| FixupError::io(path, e))?;
    let report = parse_chain_report(&text);
    if report.target.is_empty() && report.source.is_empty() && !report.rejected.is_empty() {
        return Err(FixupError::Report {
            path: path.to_path_buf(),
            reason: format!("no parseable chains ({} rejected lines)", report.rejected.len()),
        });
    }
    Ok(report)
}

/// Maps every node to its direct dependencies: node *i* of a chain depends on
/// node *i + 1*. Leaves map to an empty set.
pub fn build_dependency_map(chains: &[DependencyChain]) -> BTreeMap<ObjectNode, BTreeSet<ObjectNode>> {
    let mut map: BTreeMap<ObjectNode, BTreeSet<ObjectNode>> = BTreeMap::new();
    for chain in chains {
        for pair in chain.nodes.windows(2) {
            map.entry(pair[0].clone()).or_default().insert(pair[1].clone());
        }
        for node in &chain.nodes {
            map.entry(node.clone()).or_default();
        }
    }
    map
}
