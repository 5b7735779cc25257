use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::executor::{query_rows, SqlExecutor};
use crate::objects::{ObjectNode, ObjectType, QualifiedName};

/// Owners never touched by fixups.
const BUILTIN_OWNERS: &[&str] = &["SYS", "SYSTEM", "PUBLIC", "ORAAUDITOR", "LBACSYS", "OCEANBASE"];

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn owner_predicate(owners: &[String]) -> String {
    if owners.is_empty() {
        let builtin: Vec<String> = BUILTIN_OWNERS.iter().map(|o| quote_literal(o)).collect();
        format!("OWNER NOT IN ({})", builtin.join(", "))
    } else {
        let listed: Vec<String> = owners.iter().map(|o| quote_literal(&o.to_uppercase())).collect();
        format!("OWNER IN ({})", listed.join(", "))
    }
}

fn row_to_node(row: &[String]) -> Option<ObjectNode> {
    match row {
        [owner, name, object_type, ..] => Some(ObjectNode::new(
            QualifiedName {
                schema_name: Some(owner.clone()),
                name: name.clone(),
            },
            ObjectType::parse(object_type),
        )),
        _ => None,
    }
}

pub fn existing_objects_sql(owners: &[String]) -> String {
    format!(
        "SELECT OWNER, OBJECT_NAME, OBJECT_TYPE FROM DBA_OBJECTS WHERE {}",
        owner_predicate(owners)
    )
}

/// Every object the target has for `owners` (all non-builtin owners if empty).
pub fn fetch_existing_objects<E: SqlExecutor + ?Sized>(
    executor: &E,
    owners: &[String],
    timeout: Duration,
) -> Result<HashSet<ObjectNode>> {
    let rows = query_rows(executor, &existing_objects_sql(owners), timeout)?;
    let objects: HashSet<ObjectNode> = rows.iter().filter_map(|r| row_to_node(r)).collect();
    debug!(count = objects.len(), "fetched existing target objects");
    Ok(objects)
}

pub fn object_exists<E: SqlExecutor + ?Sized>(executor: &E, node: &ObjectNode, timeout: Duration) -> Result<bool> {
    let owner = node.owner().unwrap_or_default();
    let sql = format!(
        "SELECT OWNER, OBJECT_NAME, OBJECT_TYPE FROM DBA_OBJECTS WHERE OWNER = {} AND OBJECT_NAME = {} AND OBJECT_TYPE = {}",
        quote_literal(owner),
        quote_literal(&node.name.name),
        quote_literal(node.object_type.keyword())
    );
    Ok(!query_rows(executor, &sql, timeout)?.is_empty())
}

pub fn invalid_objects_sql(owners: &[String]) -> String {
    format!(
        "SELECT OWNER, OBJECT_NAME, OBJECT_TYPE FROM DBA_OBJECTS WHERE STATUS = 'INVALID' AND {} ORDER BY OWNER, OBJECT_NAME",
        owner_predicate(owners)
    )
}

/// Objects whose status is `INVALID`, in owner/name order.
pub fn fetch_invalid_objects<E: SqlExecutor + ?Sized>(
    executor: &E,
    owners: &[String],
    timeout: Duration,
) -> Result<Vec<ObjectNode>> {
    let rows = query_rows(executor, &invalid_objects_sql(owners), timeout)?;
    Ok(rows.iter().filter_map(|r| row_to_node(r)).collect())
}
