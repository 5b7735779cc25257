//! Post-pass that recompiles objects the fixup rounds left `INVALID`.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::SqlExecutor;
use crate::objects::{ObjectNode, ObjectType};
use crate::target::fetch_invalid_objects;

/// Types that compile with a plain `ALTER <TYPE> <OWNER>.<NAME> COMPILE`.
/// Bodies and views need a different syntax and are left alone.
pub fn is_recompilable(object_type: &ObjectType) -> bool {
    matches!(
        object_type,
        ObjectType::Procedure | ObjectType::Function | ObjectType::Package | ObjectType::Trigger | ObjectType::Type
    )
}

pub fn compile_statement(node: &ObjectNode) -> String {
    format!("ALTER {} {} COMPILE;", node.object_type.keyword(), node.name)
}

/// Compiles invalid objects until none are left, a round does not shrink the
/// invalid set, or `max_retries` rounds have run. An object counts as
/// recompiled once it has left the invalid set, however many rounds that took.
/// Returns `(total_recompiled, remaining_invalid)`.
pub fn recompile_invalid_objects<E: SqlExecutor + ?Sized>(
    executor: &E,
    owners: &[String],
    timeout: Duration,
    max_retries: usize,
) -> Result<(usize, usize)> {
    let mut recovered: HashSet<ObjectNode> = HashSet::new();
    let mut invalid = fetch_invalid_objects(executor, owners, timeout)?;

    for attempt in 1..=max_retries.max(1) {
        if invalid.is_empty() {
            info!(attempt, total = recovered.len(), "no invalid objects left");
            return Ok((recovered.len(), 0));
        }

        let (supported, unsupported): (Vec<&ObjectNode>, Vec<&ObjectNode>) =
            invalid.iter().partition(|node| is_recompilable(&node.object_type));
        for node in &unsupported {
            debug!(object = %node, "skipping recompilation of unsupported type");
        }

        let mut accepted = 0;
        for node in &supported {
            let output = executor.execute(&compile_statement(node), timeout)?;
            match output.error_text() {
                None => accepted += 1,
                Some(message) => warn!(object = %node, %message, "recompilation failed"),
            }
        }
        if accepted == 0 {
            info!(attempt, invalid = invalid.len(), skipped = unsupported.len(), "nothing could be compiled");
            return Ok((recovered.len(), invalid.len()));
        }

        let after = fetch_invalid_objects(executor, owners, timeout)?;
        let still_invalid: HashSet<&ObjectNode> = after.iter().collect();
        let fixed: Vec<ObjectNode> = supported
            .iter()
            .filter(|node| !still_invalid.contains(*node))
            .map(|node| (*node).clone())
            .collect();
        info!(attempt, invalid = invalid.len(), accepted, fixed = fixed.len(), "recompilation round");
        recovered.extend(fixed);

        let shrank = after.len() < invalid.len();
        invalid = after;
        if !shrank {
            break;
        }
    }

    if !invalid.is_empty() {
        warn!(remaining = invalid.len(), "invalid objects remain after recompilation");
    }
    Ok((recovered.len(), invalid.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecOutput;
    use crate::objects::QualifiedName;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct Dictionary {
        answers: RefCell<VecDeque<&'static str>>,
        compiles: RefCell<Vec<String>>,
    }

    impl SqlExecutor for Dictionary {
        fn execute(&self, sql: &str, _timeout: Duration) -> Result<ExecOutput> {
            if sql.starts_with("SELECT") {
                let rows = self.answers.borrow_mut().pop_front().unwrap_or("");
                return Ok(ExecOutput::success(rows));
            }
            self.compiles.borrow_mut().push(sql.to_string());
            Ok(ExecOutput::success(""))
        }
    }

    #[test]
    fn test_compile_statement() {
        let node = ObjectNode::new(QualifiedName::new("HR", "PKG_A"), ObjectType::Package);
        assert_eq!(compile_statement(&node), "ALTER PACKAGE HR.PKG_A COMPILE;");
        assert!(!is_recompilable(&ObjectType::View));
        assert!(!is_recompilable(&ObjectType::PackageBody));
    }

    fn dictionary(answers: Vec<&'static str>) -> Dictionary {
        Dictionary {
            answers: RefCell::new(VecDeque::from(answers)),
            compiles: RefCell::new(vec![]),
        }
    }

    #[test]
    fn test_object_that_stays_invalid_is_not_counted() {
        // every compile is accepted but the procedure never becomes valid
        let stuck = "HR\tP\tPROCEDURE\n";
        let exec = dictionary(vec![stuck; 6]);
        let (total, remaining) = recompile_invalid_objects(&exec, &[], Duration::from_secs(1), 5).unwrap();
        assert_eq!((total, remaining), (0, 1));
        assert_eq!(exec.compiles.borrow().len(), 1);
    }

    #[test]
    fn test_counts_each_recovered_object_once() {
        let exec = dictionary(vec![
            "HR\tP1\tPROCEDURE\nHR\tP2\tPROCEDURE\n",
            "HR\tP2\tPROCEDURE\n",
            "HR\tP2\tPROCEDURE\n",
        ]);
        let (total, remaining) = recompile_invalid_objects(&exec, &[], Duration::from_secs(1), 5).unwrap();
        assert_eq!((total, remaining), (1, 1));
        assert_eq!(
            *exec.compiles.borrow(),
            vec![
                "ALTER PROCEDURE HR.P1 COMPILE;",
                "ALTER PROCEDURE HR.P2 COMPILE;",
                "ALTER PROCEDURE HR.P2 COMPILE;",
            ]
        );
    }

    #[test]
    fn test_stops_when_nothing_is_compiled() {
        let exec = dictionary(vec!["HR\tT_BODY\tTYPE BODY\n"]);
        let (total, remaining) = recompile_invalid_objects(&exec, &[], Duration::from_secs(1), 5).unwrap();
        assert_eq!((total, remaining), (0, 1));
        assert!(exec.compiles.borrow().is_empty());
    }
}
