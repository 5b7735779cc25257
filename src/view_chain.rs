//! Dependency-aware repair of missing views, driven by the comparator's
//! latest view chain report.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::context::RunContext;
use crate::engine::{archive_script, execute_statements};
use crate::error::{FixupError, Result};
use crate::executor::{OutcomeKind, SqlExecutor};
use crate::grants::GrantIndex;
use crate::graph::{build_view_dependency_graph, topo_sort_nodes};
use crate::objects::ObjectNode;
use crate::parser::read_chain_report;
use crate::plan::{
    build_view_chain_plan, classify_view_chain_status, render_master_report, PlanInputs, ScriptLocator, ScriptSource,
    ViewChainStatus,
};
use crate::report::find_latest_report_file;
use crate::target::{fetch_existing_objects, object_exists};

pub const MASTER_REPORT_NAME: &str = "view_chain_master.txt";

#[derive(Debug, Clone)]
pub struct ViewChainOutcome {
    pub report: PathBuf,
    pub plan_dir: PathBuf,
    pub statuses: Vec<(ObjectNode, ViewChainStatus)>,
}

impl ViewChainOutcome {
    pub fn counts(&self) -> BTreeMap<ViewChainStatus, usize> {
        let mut counts = BTreeMap::new();
        for (_, status) in &self.statuses {
            *counts.entry(*status).or_default() += 1;
        }
        counts
    }

    pub fn exit_code(&self) -> i32 {
        if self.statuses.iter().all(|(_, s)| *s == ViewChainStatus::Success) {
            0
        } else {
            1
        }
    }
}

fn write_file(path: PathBuf, contents: &str) -> Result<()> {
    fs::write(&path, contents).map_err(|e| FixupError::io(path, e))
}

/// Finds the newest chain report, writes the master report and one plan per
/// view, then executes every plan that is neither blocked nor skipped.
pub fn run_view_chain<E: SqlExecutor>(ctx: &mut RunContext<E>) -> Result<ViewChainOutcome> {
    let settings = ctx.config.view_chain.clone();
    let root = ctx.config.fixup.root.clone();
    let timeout = ctx.config.statement_timeout();

    let report_path = find_latest_report_file(&settings.report_dir, &settings.report_prefix)?;
    let report = read_chain_report(&report_path)?;
    if !report.rejected.is_empty() {
        warn!(count = report.rejected.len(), "unparseable chain lines ignored");
    }
    info!(report = %report_path.display(), chains = report.target.len(), "loaded view chain report");

    let graph = build_view_dependency_graph(&report.target);
    let mut topo = topo_sort_nodes(&graph);
    for cycle in &report.cycles {
        if !topo.cycles.contains(cycle) {
            topo.cycles.push(cycle.clone());
        }
    }

    let mut views = vec![];
    let mut seen = HashSet::new();
    for chain in &report.target {
        if let Some(head) = chain.nodes.first() {
            if head.object_type.is_view_like() && seen.insert(head.clone()) {
                views.push(head.clone());
            }
        }
    }

    let owners: Vec<String> = graph
        .nodes()
        .iter()
        .filter_map(|n| n.owner().map(str::to_string))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut existing = fetch_existing_objects(&ctx.executor, &owners, timeout)?;
    let grants = GrantIndex::load(&root, &ctx.config.fixup.done_dir, &ctx.config.grants.tiers)?;
    let tiers = ctx.config.grant_tiers();
    let auto_grant_types = ctx.config.auto_grant_types();
    let mut locator = ScriptLocator::new(&root, &ctx.config.fixup.done_dir, settings.cache_capacity);

    let plan_dir = root.join(&settings.plan_dir);
    fs::create_dir_all(&plan_dir).map_err(|e| FixupError::io(&plan_dir, e))?;
    write_file(
        plan_dir.join(MASTER_REPORT_NAME),
        &render_master_report(&graph, &views, &topo.cycles),
    )?;

    let done_root = ctx.config.done_root();
    let mut statuses = vec![];
    for view in &views {
        let inputs = PlanInputs {
            graph: &graph,
            topo: &topo,
            existing: &existing,
            grants: &grants,
            tiers: &tiers,
            auto_grant: ctx.config.grants.auto_grant,
            auto_grant_types: &auto_grant_types,
        };
        let plan = build_view_chain_plan(view, &inputs, &mut locator)?;
        let stem = view.name.to_string();
        write_file(plan_dir.join(format!("{}.plan.txt", stem)), &plan.render_text())?;
        let statements = plan.statements();
        if !statements.is_empty() {
            write_file(plan_dir.join(format!("{}.sql", stem)), &plan.sql())?;
        }

        if plan.blocked || plan.skipped.is_some() {
            let status = classify_view_chain_status(plan.blocked, plan.skipped.is_some(), false, 0);
            info!(view = %view, %status, "view chain not executed");
            statuses.push((view.clone(), status));
            continue;
        }

        let summary = execute_statements(&ctx.executor, &statements, None, timeout);
        ctx.counters.statements_run += summary.statements_run;
        ctx.counters.statement_failures += summary.failures.len();
        ctx.counters.already_existing += summary.count(OutcomeKind::AlreadyExists);
        ctx.counters.grants_injected += plan.auto_grants;

        let view_exists = object_exists(&ctx.executor, view, timeout).unwrap_or_else(|e| {
            warn!(view = %view, error = %e, "existence check failed");
            false
        });
        let status = classify_view_chain_status(false, false, view_exists, summary.failures.len());
        info!(view = %view, %status, failures = summary.failures.len(), "view chain executed");

        if status == ViewChainStatus::Success {
            for step in &plan.steps {
                existing.insert(step.node.clone());
                if step.script.source != ScriptSource::Primary || !step.script.path.exists() {
                    continue;
                }
                let Ok(relative) = step.script.path.strip_prefix(&root) else {
                    continue;
                };
                match archive_script(&step.script.path, relative, &done_root) {
                    Ok(_) => ctx.counters.scripts_archived += 1,
                    Err(e) => warn!(path = %step.script.path.display(), error = %e, "archiving failed"),
                }
            }
        }
        statuses.push((view.clone(), status));
    }

    Ok(ViewChainOutcome {
        report: report_path,
        plan_dir,
        statuses,
    })
}
