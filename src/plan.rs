//! Per-view repair plans built from the view dependency graph.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use grep::matcher::LineTerminator;
use grep::regex::{RegexMatcher, RegexMatcherBuilder};
use grep::searcher::{sinks, SearcherBuilder};
use tracing::{debug, info};

use crate::cache::LimitedCache;
use crate::error::{FixupError, Result};
use crate::grants::GrantIndex;
use crate::graph::{DependencyGraph, TopoOrder};
use crate::objects::{ObjectNode, ObjectType};
use crate::parser::DependencyChain;
use crate::statements::{build_auto_grant_statement, join_statements, schema_directive, split_sql_statements};

/// Where a script for a plan step was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptSource {
    /// Still waiting in the fixup tree.
    Primary,
    /// Already applied once and archived.
    Done,
}

impl fmt::Display for ScriptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptSource::Primary => "primary",
            ScriptSource::Done => "done",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedScript {
    pub path: PathBuf,
    pub source: ScriptSource,
}

/// Finds the fixup script that creates an object.
///
/// Looks for `<type_dir>/<SCHEMA>.<NAME>.sql` in the fixup tree, then in the
/// archive, then searches both type directories for a `CREATE` line naming the
/// object. Answers, including misses, are memoized for the rest of the run.
pub struct ScriptLocator {
    root: PathBuf,
    done_root: PathBuf,
    cache: LimitedCache<ObjectNode, Option<LocatedScript>>,
}

impl ScriptLocator {
    pub fn new(root: impl Into<PathBuf>, done_dir: &str, capacity: usize) -> Self {
        let root = root.into();
        ScriptLocator {
            done_root: root.join(done_dir),
            root,
            cache: LimitedCache::new(capacity),
        }
    }

    pub fn locate(&mut self, node: &ObjectNode) -> Result<Option<LocatedScript>> {
        if let Some(found) = self.cache.get(node) {
            return Ok(found.clone());
        }
        let found = self.resolve(node)?;
        match &found {
            Some(script) => debug!(object = %node, path = %script.path.display(), source = %script.source, "script located"),
            None => debug!(object = %node, "no script found"),
        }
        self.cache.set(node.clone(), found.clone());
        Ok(found)
    }

    fn resolve(&self, node: &ObjectNode) -> Result<Option<LocatedScript>> {
        let type_dir = node.object_type.dir_name();
        let bases = [
            (self.root.join(&type_dir), ScriptSource::Primary),
            (self.done_root.join(&type_dir), ScriptSource::Done),
        ];
        let file_name = format!("{}.sql", node.name);
        for (dir, source) in &bases {
            let path = dir.join(&file_name);
            if path.is_file() {
                return Ok(Some(LocatedScript { path, source: *source }));
            }
        }

        let matcher = create_matcher(node)?;
        for (dir, source) in &bases {
            if let Some(path) = search_dir(dir, &matcher)? {
                return Ok(Some(LocatedScript { path, source: *source }));
            }
        }
        Ok(None)
    }
}

// Object-type keywords may be split over several blanks, names may be quoted.
fn create_matcher(node: &ObjectNode) -> Result<RegexMatcher> {
    let keyword = node
        .object_type
        .keyword()
        .split(' ')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"[ \t]+");
    let ident = |raw: &str| format!(r#""?{}"?"#, regex::escape(raw));
    let schema = node.owner().map(|s| format!(r"{}\.", ident(s))).unwrap_or_default();
    let pattern = format!(
        r"^[ \t]*create[ \t]+(?:or[ \t]+replace[ \t]+)?(?:(?:no[ \t]+)?force[ \t]+)?(?:(?:non)?editionable[ \t]+)?{}[ \t]+{}{}(?:[ \t(\r]|$)",
        keyword,
        schema,
        ident(&node.name.name)
    );
    Ok(RegexMatcherBuilder::new()
        .case_insensitive(true)
        .multi_line(true)
        .line_terminator(Some(b'\n'))
        .build(&pattern)?)
}

fn search_dir(dir: &Path, matcher: &RegexMatcher) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut files = vec![];
    for entry in fs::read_dir(dir).map_err(|e| FixupError::io(dir, e))? {
        let path = entry.map_err(|e| FixupError::io(dir, e))?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("sql")) {
            files.push(path);
        }
    }
    files.sort();

    let mut searcher = SearcherBuilder::new()
        .line_terminator(LineTerminator::byte(b'\n'))
        .line_number(false)
        .build();
    for path in files {
        let mut hit = false;
        searcher
            .search_path(
                matcher,
                &path,
                sinks::UTF8(|_, _| {
                    hit = true;
                    Ok(false)
                }),
            )
            .map_err(|e| FixupError::io(&path, e))?;
        if hit {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Inputs shared by every plan of one run.
pub struct PlanInputs<'a> {
    pub graph: &'a DependencyGraph,
    pub topo: &'a TopoOrder,
    /// Objects the target already has.
    pub existing: &'a HashSet<ObjectNode>,
    pub grants: &'a GrantIndex,
    pub tiers: &'a [&'a str],
    pub auto_grant: bool,
    pub auto_grant_types: &'a HashSet<ObjectType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub node: ObjectNode,
    pub script: LocatedScript,
    /// Grants, schema directive, the object's DDL and the grants on it, in order.
    pub statements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewChainPlan {
    pub target: ObjectNode,
    pub blocked: bool,
    pub skipped: Option<String>,
    pub steps: Vec<PlanStep>,
    /// Grants synthesized because no tier had them.
    pub auto_grants: usize,
    /// Human-readable description, one line per decision.
    pub lines: Vec<String>,
}

impl ViewChainPlan {
    pub fn render_text(&self) -> String {
        let mut text = self.lines.join("\n");
        text.push('\n');
        text
    }

    /// Every statement of the plan in execution order. Empty when the plan is
    /// blocked or skipped.
    pub fn statements(&self) -> Vec<String> {
        if self.blocked || self.skipped.is_some() {
            return vec![];
        }
        self.steps.iter().flat_map(|s| s.statements.iter().cloned()).collect()
    }

    pub fn sql(&self) -> String {
        join_statements(&self.statements())
    }
}

fn format_cycle(cycle: &[ObjectNode]) -> String {
    cycle.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

/// Builds the plan that creates `target` together with every missing object it
/// depends on, dependencies first.
///
/// A target that sits on a cycle, or depends on something that does, is
/// blocked. A target with a dependency no script can be found for is skipped.
pub fn build_view_chain_plan(
    target: &ObjectNode,
    inputs: &PlanInputs<'_>,
    locator: &mut ScriptLocator,
) -> Result<ViewChainPlan> {
    let mut plan = ViewChainPlan {
        target: target.clone(),
        blocked: false,
        skipped: None,
        steps: vec![],
        auto_grants: 0,
        lines: vec![format!("TARGET {}", target)],
    };

    let closure = inputs.graph.closure(target);
    let mut cycles: Vec<&Vec<ObjectNode>> = vec![];
    for cycle in &inputs.topo.cycles {
        if cycle.iter().any(|n| closure.contains(n)) {
            cycles.push(cycle);
        }
    }
    if !cycles.is_empty() {
        plan.blocked = true;
        for cycle in cycles {
            plan.lines.push(format!("CYCLE {}", format_cycle(cycle)));
        }
        plan.lines.push("BLOCKED: dependency cycle, no SQL generated".to_string());
        info!(target = %target, "view chain plan blocked by a cycle");
        return Ok(plan);
    }

    // closure members in dependency order; the target alone if no chain names it
    let ordered: Vec<&ObjectNode> = if closure.is_empty() {
        vec![target]
    } else {
        inputs.topo.order.iter().filter(|n| closure.contains(*n)).collect()
    };

    // grants repeat across steps; DDL runs under its own schema and is kept as is
    let mut emitted_grants: HashSet<String> = HashSet::new();
    let mut push_grant = |statements: &mut Vec<String>, statement: String| {
        if emitted_grants.insert(statement.clone()) {
            statements.push(statement);
        }
    };

    for (position, node) in ordered.into_iter().enumerate() {
        if inputs.existing.contains(node) {
            plan.lines.push(format!("{:>3}. {} EXISTS", position + 1, node));
            continue;
        }
        let Some(script) = locator.locate(node)? else {
            plan.lines.push(format!("{:>3}. {} MISSING: no fixup script", position + 1, node));
            if plan.skipped.is_none() {
                plan.skipped = Some(format!("no fixup script for {}", node));
            }
            continue;
        };
        plan.lines.push(format!(
            "{:>3}. {} <- {} [{}]",
            position + 1,
            node,
            script.path.display(),
            script.source
        ));

        let mut statements = vec![];
        for grant in required_grants(node, inputs, &mut plan) {
            push_grant(&mut statements, grant);
        }

        let text = fs::read_to_string(&script.path).map_err(|e| FixupError::io(&script.path, e))?;
        if let Some(owner) = node.owner() {
            statements.push(schema_directive(owner));
        }
        statements.extend(split_sql_statements(&text));

        let (object_grants, tier) = inputs
            .grants
            .find_object_grants_by_priority(&node.name.to_string(), inputs.tiers);
        if !object_grants.is_empty() {
            plan.lines.push(format!("     re-grant {} statement(s) from {}", object_grants.len(), tier));
        }
        for entry in object_grants {
            push_grant(&mut statements, entry.statement.clone());
        }

        plan.steps.push(PlanStep {
            node: node.clone(),
            script,
            statements,
        });
    }

    if let Some(reason) = &plan.skipped {
        plan.lines.push(format!("SKIPPED: {}", reason));
    }
    Ok(plan)
}

// Grants `node` needs on dependencies owned by other schemas.
fn required_grants(node: &ObjectNode, inputs: &PlanInputs<'_>, plan: &mut ViewChainPlan) -> Vec<String> {
    let Some(grantee) = node.owner() else {
        return vec![];
    };
    let mut grants = vec![];
    for dep in inputs.graph.dependencies(node) {
        if dep.owner().map_or(true, |owner| owner == grantee) {
            continue;
        }
        let Some(privilege) = dep.object_type.required_privilege() else {
            continue;
        };
        let object = dep.name.to_string();
        let (entries, tier) = inputs
            .grants
            .find_grant_entries_by_priority(grantee, &object, privilege, inputs.tiers);
        if !entries.is_empty() {
            plan.lines.push(format!("     grant {} ON {} TO {} from {}", privilege, object, grantee, tier));
            grants.extend(entries.into_iter().map(|e| e.statement.clone()));
        } else if inputs.auto_grant && inputs.auto_grant_types.contains(&dep.object_type) {
            let statement = build_auto_grant_statement(grantee, &object, privilege, node.object_type.is_view_like());
            plan.lines.push(format!("     auto-grant {}", statement));
            plan.auto_grants += 1;
            grants.push(statement);
        } else {
            plan.lines.push(format!("     grant {} ON {} TO {} not found", privilege, object, grantee));
        }
    }
    grants
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewChainStatus {
    Blocked,
    Skipped,
    Success,
    Partial,
    Failed,
}

impl fmt::Display for ViewChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViewChainStatus::Blocked => "BLOCKED",
            ViewChainStatus::Skipped => "SKIPPED",
            ViewChainStatus::Success => "SUCCESS",
            ViewChainStatus::Partial => "PARTIAL",
            ViewChainStatus::Failed => "FAILED",
        })
    }
}

pub fn classify_view_chain_status(
    blocked: bool,
    skipped: bool,
    view_exists: bool,
    failure_count: usize,
) -> ViewChainStatus {
    if blocked {
        ViewChainStatus::Blocked
    } else if skipped {
        ViewChainStatus::Skipped
    } else if !view_exists {
        ViewChainStatus::Failed
    } else if failure_count == 0 {
        ViewChainStatus::Success
    } else {
        ViewChainStatus::Partial
    }
}

/// `# VIEW fixup dependency chains` report: one numbered line per chain from
/// each view down to its deepest dependency, then the cycles.
pub fn render_master_report(graph: &DependencyGraph, roots: &[ObjectNode], cycles: &[Vec<ObjectNode>]) -> String {
    let mut out = String::from("# VIEW fixup dependency chains\n");
    let mut number = 0;
    for root in roots {
        for chain in chains_from(graph, root) {
            number += 1;
            out.push_str(&format!("{:05}. {}\n", number, format_cycle(&chain.nodes)));
        }
    }
    if !cycles.is_empty() {
        out.push_str("\n[CYCLES]\n");
        for cycle in cycles {
            out.push_str(&format!("{} (CYCLE)\n", format_cycle(cycle)));
        }
    }
    out
}

// Every maximal path from `root`, depth first; paths stop before revisiting a node.
fn chains_from(graph: &DependencyGraph, root: &ObjectNode) -> Vec<DependencyChain> {
    let mut chains = vec![];
    let mut stack = vec![vec![root.clone()]];
    while let Some(path) = stack.pop() {
        let Some(last) = path.last() else {
            continue;
        };
        let next: Vec<&ObjectNode> = graph
            .dependencies(last)
            .into_iter()
            .filter(|dep| !path.contains(dep))
            .collect();
        if next.is_empty() {
            chains.push(DependencyChain { number: None, nodes: path });
            continue;
        }
        for dep in next.into_iter().rev() {
            let mut extended = path.clone();
            extended.push(dep.clone());
            stack.push(extended);
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build_view_dependency_graph, topo_sort_nodes};
    use crate::parser::parse_node;

    fn node(raw: &str) -> ObjectNode {
        parse_node(raw).unwrap()
    }

    fn chain(raw: &[&str]) -> DependencyChain {
        DependencyChain {
            number: None,
            nodes: raw.iter().map(|r| node(r)).collect(),
        }
    }

    fn write(root: &Path, rel: &str, sql: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, sql).unwrap();
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_view_chain_status(true, true, true, 0), ViewChainStatus::Blocked);
        assert_eq!(classify_view_chain_status(false, true, false, 3), ViewChainStatus::Skipped);
        assert_eq!(classify_view_chain_status(false, false, true, 0), ViewChainStatus::Success);
        assert_eq!(classify_view_chain_status(false, false, true, 2), ViewChainStatus::Partial);
        assert_eq!(classify_view_chain_status(false, false, false, 2), ViewChainStatus::Failed);
    }

    #[test]
    fn test_locator_prefers_primary_then_done_then_content() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "view/APP.V1.sql", "CREATE VIEW app.v1 AS SELECT 1 x FROM dual;");
        write(dir.path(), "done/table/HR.EMP.sql", "CREATE TABLE hr.emp (id NUMBER);");
        write(
            dir.path(),
            "view/batch_01.sql",
            "-- generated\ncreate or replace force view \"APP\".\"V2\" as select 2 x from dual;\n",
        );

        let mut locator = ScriptLocator::new(dir.path(), "done", 8);
        let v1 = locator.locate(&node("APP.V1(VIEW)")).unwrap().unwrap();
        assert_eq!(v1.source, ScriptSource::Primary);
        let emp = locator.locate(&node("HR.EMP(TABLE)")).unwrap().unwrap();
        assert_eq!(emp.source, ScriptSource::Done);
        let v2 = locator.locate(&node("APP.V2(VIEW)")).unwrap().unwrap();
        assert_eq!(v2.path, dir.path().join("view/batch_01.sql"));
        assert!(locator.locate(&node("APP.V3(VIEW)")).unwrap().is_none());
        // a name that merely starts with another one is not a match
        assert!(locator.locate(&node("APP.V(VIEW)")).unwrap().is_none());
    }

    #[test]
    fn test_plan_orders_dependencies_and_injects_grants() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "table/HR.EMP.sql", "CREATE TABLE emp (id NUMBER);");
        write(dir.path(), "view/APP.V_EMP.sql", "CREATE OR REPLACE VIEW v_emp AS SELECT id FROM hr.emp;");
        write(dir.path(), "grants_miss/HR.sql", "GRANT SELECT ON HR.EMP TO REPORTING;");

        let chains = vec![chain(&["APP.V_EMP(VIEW)", "HR.EMP(TABLE)"])];
        let graph = build_view_dependency_graph(&chains);
        let topo = topo_sort_nodes(&graph);
        let grants = GrantIndex::load(dir.path(), "done", &["grants_miss".to_string()]).unwrap();
        let existing = HashSet::new();
        let auto_types: HashSet<ObjectType> = [ObjectType::Table].into_iter().collect();
        let inputs = PlanInputs {
            graph: &graph,
            topo: &topo,
            existing: &existing,
            grants: &grants,
            tiers: &["grants_miss"],
            auto_grant: true,
            auto_grant_types: &auto_types,
        };
        let mut locator = ScriptLocator::new(dir.path(), "done", 8);
        let plan = build_view_chain_plan(&node("APP.V_EMP(VIEW)"), &inputs, &mut locator).unwrap();

        assert!(!plan.blocked);
        assert_eq!(plan.skipped, None);
        assert_eq!(
            plan.statements(),
            vec![
                "ALTER SESSION SET CURRENT_SCHEMA = HR;",
                "CREATE TABLE emp (id NUMBER);",
                "GRANT SELECT ON HR.EMP TO REPORTING;",
                "GRANT SELECT ON HR.EMP TO APP WITH GRANT OPTION;",
                "ALTER SESSION SET CURRENT_SCHEMA = APP;",
                "CREATE OR REPLACE VIEW v_emp AS SELECT id FROM hr.emp;",
            ]
        );
    }

    #[test]
    fn test_plan_keeps_identical_ddl_of_objects_in_different_schemas() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "table/HR.T.sql", "CREATE TABLE t (id NUMBER);");
        write(dir.path(), "table/APP.T.sql", "CREATE TABLE t (id NUMBER);");
        write(dir.path(), "view/APP.V.sql", "CREATE VIEW v AS SELECT h.id FROM hr.t h JOIN t a ON a.id = h.id;");

        let graph = build_view_dependency_graph(&[
            chain(&["APP.V(VIEW)", "HR.T(TABLE)"]),
            chain(&["APP.V(VIEW)", "APP.T(TABLE)"]),
        ]);
        let topo = topo_sort_nodes(&graph);
        let grants = GrantIndex::new();
        let existing = HashSet::new();
        let auto_types = HashSet::new();
        let inputs = PlanInputs {
            graph: &graph,
            topo: &topo,
            existing: &existing,
            grants: &grants,
            tiers: &[],
            auto_grant: false,
            auto_grant_types: &auto_types,
        };
        let mut locator = ScriptLocator::new(dir.path(), "done", 8);
        let plan = build_view_chain_plan(&node("APP.V(VIEW)"), &inputs, &mut locator).unwrap();

        let statements = plan.statements();
        let creates = statements.iter().filter(|s| *s == "CREATE TABLE t (id NUMBER);").count();
        assert_eq!(creates, 2);
        assert_eq!(plan.steps.len(), 3);
        for step in &plan.steps {
            let owner = step.node.owner().unwrap();
            assert_eq!(step.statements[0], schema_directive(owner));
            assert!(step.statements.len() >= 2);
        }
    }

    #[test]
    fn test_plan_skips_when_a_dependency_has_no_script() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "view/APP.V1.sql", "CREATE VIEW v1 AS SELECT * FROM hr.gone;");
        let graph = build_view_dependency_graph(&[chain(&["APP.V1(VIEW)", "HR.GONE(TABLE)"])]);
        let topo = topo_sort_nodes(&graph);
        let grants = GrantIndex::new();
        let existing = HashSet::new();
        let auto_types = HashSet::new();
        let inputs = PlanInputs {
            graph: &graph,
            topo: &topo,
            existing: &existing,
            grants: &grants,
            tiers: &[],
            auto_grant: false,
            auto_grant_types: &auto_types,
        };
        let mut locator = ScriptLocator::new(dir.path(), "done", 8);
        let plan = build_view_chain_plan(&node("APP.V1(VIEW)"), &inputs, &mut locator).unwrap();
        assert_eq!(plan.skipped.as_deref(), Some("no fixup script for HR.GONE(TABLE)"));
        assert!(plan.sql().is_empty());
        assert!(plan.render_text().contains("MISSING"));
    }

    #[test]
    fn test_master_report_lists_chains_and_cycles() {
        let graph = build_view_dependency_graph(&[
            chain(&["APP.V1(VIEW)", "APP.V0(VIEW)", "HR.T(TABLE)"]),
            chain(&["APP.V1(VIEW)", "HR.U(TABLE)"]),
        ]);
        let cycle = vec![node("APP.A(VIEW)"), node("APP.B(VIEW)"), node("APP.A(VIEW)")];
        let report = render_master_report(&graph, &[node("APP.V1(VIEW)")], &[cycle]);
        assert_eq!(
            report,
            "# VIEW fixup dependency chains\n\
             00001. APP.V1(VIEW) -> APP.V0(VIEW) -> HR.T(TABLE)\n\
             00002. APP.V1(VIEW) -> HR.U(TABLE)\n\
             \n[CYCLES]\n\
             APP.A(VIEW) -> APP.B(VIEW) -> APP.A(VIEW) (CYCLE)\n"
        );
    }
}
