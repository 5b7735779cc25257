mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{Fixture, ScriptedExecutor};
use ob_fixup_run::engine::{run_iterative_fixup, ScriptStatus, StopReason};
use ob_fixup_run::recompile::recompile_invalid_objects;
use ob_fixup_run::RunContext;

const MISSING_TABLE: &str = "ORA-00942: table or view does not exist";

#[test]
fn test_failures_accumulate_across_rounds() {
    let fx = Fixture::new();
    fx.write("table/HR.T1.sql", "CREATE TABLE t1 (id NUMBER);\n");
    fx.write("view/HR.V1.sql", "CREATE OR REPLACE VIEW v1 AS SELECT * FROM missing_t;\n");

    let mut config = fx.config();
    config.fixup.max_rounds = 2;
    let executor = ScriptedExecutor::new().answer("missing_t", MISSING_TABLE);
    let mut ctx = RunContext::new(config, executor);
    let outcome = run_iterative_fixup(&mut ctx).unwrap();

    assert_eq!(outcome.rounds.len(), 2);
    assert_eq!(outcome.rounds[0].succeeded, 1);
    assert_eq!(outcome.rounds[0].failed, 1);
    assert_eq!(outcome.rounds[1].failed, 1);
    assert_eq!(outcome.total_failures, 2);
    assert_eq!(outcome.remaining, vec![fx.root.join("view/HR.V1.sql")]);
    assert_ne!(outcome.exit_code(), 0);
    assert!(fx.root.join("done/table/HR.T1.sql").exists());
    assert_eq!(ctx.counters.scripts_archived, 1);
}

#[test]
fn test_clean_run_converges_with_zero_exit() {
    let fx = Fixture::new();
    fx.write("sequence/HR.S1.sql", "CREATE SEQUENCE s1;\n");
    fx.write("table/HR.T1.sql", "CREATE TABLE t1 (id NUMBER);\nCREATE INDEX i1 ON t1 (id);\n");
    fx.write("table/HR.EMPTY.sql", "-- nothing to do\n");

    let mut ctx = RunContext::new(fx.config(), ScriptedExecutor::new());
    let outcome = run_iterative_fixup(&mut ctx).unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Converged);
    assert_eq!(outcome.rounds.len(), 1);
    assert_eq!(outcome.total_failures, 0);
    assert_eq!(outcome.exit_code(), 0);
    // one schema check per script plus three statements
    assert_eq!(ctx.counters.statements_run, 5);
    // sequences come before tables
    let statements = ctx.executor.statements();
    assert_eq!(statements[0], "ALTER SESSION SET CURRENT_SCHEMA = HR;");
    assert!(statements[1].ends_with("CREATE SEQUENCE s1;"));
}

#[test]
fn test_non_retryable_failure_is_not_run_again() {
    let fx = Fixture::new();
    let bad = fx.write("view/HR.BAD.sql", "CREATE VIEW bad AS SELEC 1 FROM dual;\n");
    fx.write("table/HR.T1.sql", "CREATE TABLE t1 (id NUMBER);\n");

    let mut config = fx.config();
    config.fixup.max_rounds = 3;
    config.fixup.min_progress = 0;
    let executor = ScriptedExecutor::new().answer("SELEC 1", "ORA-00923: FROM keyword not found where expected");
    let mut ctx = RunContext::new(config, executor);
    let outcome = run_iterative_fixup(&mut ctx).unwrap();

    let attempts = ctx.executor.calls().iter().filter(|sql| sql.contains("SELEC 1")).count();
    assert_eq!(attempts, 1);
    assert_eq!(outcome.total_failures, 1);
    assert_eq!(outcome.remaining, vec![bad.clone()]);
    let last = outcome.last_results.iter().find(|r| r.path == bad).unwrap();
    assert_eq!(last.status, ScriptStatus::Skipped);
}

#[test]
fn test_smart_order_runs_grants_before_views() {
    let fx = Fixture::new();
    fx.write("view/APP.V1.sql", "CREATE VIEW v1 AS SELECT * FROM hr.t1;\n");
    fx.write("grants_miss/HR.sql", "GRANT SELECT ON HR.T1 TO APP;\n");
    fx.write("table/HR.T1.sql", "CREATE TABLE t1 (id NUMBER);\n");

    let mut config = fx.config();
    config.fixup.smart_order = true;
    let mut ctx = RunContext::new(config, ScriptedExecutor::new());
    run_iterative_fixup(&mut ctx).unwrap();

    let statements = ctx.executor.statements();
    let position = |needle: &str| statements.iter().position(|s| s.contains(needle)).unwrap();
    assert!(position("CREATE TABLE") < position("GRANT SELECT"));
    assert!(position("GRANT SELECT") < position("CREATE VIEW"));
    assert_eq!(
        statements[position("CREATE VIEW")],
        "ALTER SESSION SET CURRENT_SCHEMA = APP;\nCREATE VIEW v1 AS SELECT * FROM hr.t1;"
    );
}

#[test]
fn test_cancelled_run_stops_before_the_first_round() {
    let fx = Fixture::new();
    fx.write("table/HR.T1.sql", "CREATE TABLE t1 (id NUMBER);\n");

    let mut ctx = RunContext::new(fx.config(), ScriptedExecutor::new());
    ctx.cancel_handle().store(true, Ordering::SeqCst);
    let outcome = run_iterative_fixup(&mut ctx).unwrap();

    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert!(outcome.rounds.is_empty());
    assert_eq!(outcome.remaining.len(), 1);
    assert!(ctx.executor.calls().is_empty());
}

#[test]
fn test_excluded_directories_are_not_executed() {
    let fx = Fixture::new();
    fx.write("grants_all/HR.sql", "GRANT SELECT ON HR.T1 TO REPORTING;\n");
    fx.write("view_chain_plans/APP.V1.sql", "CREATE VIEW v1 AS SELECT 1 x FROM dual;\n");
    fx.write("done/table/HR.OLD.sql", "CREATE TABLE old (id NUMBER);\n");

    let mut ctx = RunContext::new(fx.config(), ScriptedExecutor::new());
    let outcome = run_iterative_fixup(&mut ctx).unwrap();

    assert!(outcome.rounds.is_empty());
    assert_eq!(outcome.exit_code(), 0);
    assert!(ctx.executor.calls().is_empty());
}

#[test]
fn test_recompile_skips_unsupported_types_and_stops_when_clean() {
    // the first dictionary query sees three invalid objects, the next one none
    let executor = ScriptedExecutor::new().answer_once(
        "STATUS = 'INVALID'",
        "HR\tPKG_A\tPACKAGE\nHR\tT_OBJ\tTYPE BODY\nHR\tP_LOAD\tPROCEDURE\n",
    );
    let (recompiled, remaining) = recompile_invalid_objects(&executor, &[], Duration::from_secs(5), 5).unwrap();

    assert_eq!((recompiled, remaining), (2, 0));
    let queries = executor.calls().iter().filter(|sql| sql.starts_with("SELECT")).count();
    assert_eq!(queries, 2);
    let compiles = executor.statements();
    assert_eq!(
        compiles,
        vec!["ALTER PACKAGE HR.PKG_A COMPILE;", "ALTER PROCEDURE HR.P_LOAD COMPILE;"]
    );
    assert!(compiles.iter().all(|c| !c.contains("T_OBJ")));
}
