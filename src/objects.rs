use std::fmt;

/// Database object kinds that fixup scripts create or alter.
///
/// Each kind owns a directory under the fixup root (`table/`, `package_body/`...)
/// and a keyword used in DDL (`TABLE`, `PACKAGE BODY`...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectType {
    Sequence,
    Table,
    View,
    MaterializedView,
    Synonym,
    Procedure,
    Function,
    Package,
    PackageBody,
    Type,
    TypeBody,
    Trigger,
    Index,
    Constraint,
    Job,
    Schedule,
    // Anything the comparator reports that we do not model
    Other(String),
}

impl ObjectType {
    /// Parses a type keyword as it appears in reports and dictionary views.
    pub fn parse(raw: &str) -> ObjectType {
        let normalized = raw
            .trim()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase()
            .replace('_', " ");
        match normalized.as_str() {
            "SEQUENCE" => ObjectType::Sequence,
            "TABLE" => ObjectType::Table,
            "VIEW" => ObjectType::View,
            "MATERIALIZED VIEW" | "MVIEW" => ObjectType::MaterializedView,
            "SYNONYM" | "PUBLIC SYNONYM" => ObjectType::Synonym,
            "PROCEDURE" => ObjectType::Procedure,
            "FUNCTION" => ObjectType::Function,
            "PACKAGE" => ObjectType::Package,
            "PACKAGE BODY" => ObjectType::PackageBody,
            "TYPE" => ObjectType::Type,
            "TYPE BODY" => ObjectType::TypeBody,
            "TRIGGER" => ObjectType::Trigger,
            "INDEX" => ObjectType::Index,
            "CONSTRAINT" => ObjectType::Constraint,
            "JOB" => ObjectType::Job,
            "SCHEDULE" => ObjectType::Schedule,
            _ => ObjectType::Other(normalized),
        }
    }

    /// Keyword used in DDL and in the data dictionary.
    pub fn keyword(&self) -> &str {
        match self {
            ObjectType::Sequence => "SEQUENCE",
            ObjectType::Table => "TABLE",
            ObjectType::View => "VIEW",
            ObjectType::MaterializedView => "MATERIALIZED VIEW",
            ObjectType::Synonym => "SYNONYM",
            ObjectType::Procedure => "PROCEDURE",
            ObjectType::Function => "FUNCTION",
            ObjectType::Package => "PACKAGE",
            ObjectType::PackageBody => "PACKAGE BODY",
            ObjectType::Type => "TYPE",
            ObjectType::TypeBody => "TYPE BODY",
            ObjectType::Trigger => "TRIGGER",
            ObjectType::Index => "INDEX",
            ObjectType::Constraint => "CONSTRAINT",
            ObjectType::Job => "JOB",
            ObjectType::Schedule => "SCHEDULE",
            ObjectType::Other(keyword) => keyword.as_str(),
        }
    }

    /// Directory under the fixup root holding scripts of this kind.
    pub fn dir_name(&self) -> String {
        self.keyword().to_lowercase().replace(' ', "_")
    }

    /// Privilege a dependent object in another schema needs on this one.
    pub fn required_privilege(&self) -> Option<&'static str> {
        match self {
            ObjectType::Table
            | ObjectType::View
            | ObjectType::MaterializedView
            | ObjectType::Sequence
            | ObjectType::Synonym => Some("SELECT"),
            ObjectType::Procedure
            | ObjectType::Function
            | ObjectType::Package
            | ObjectType::Type => Some("EXECUTE"),
            _ => None,
        }
    }

    pub fn is_view_like(&self) -> bool {
        matches!(self, ObjectType::View | ObjectType::MaterializedView)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// `SCHEMA.NAME`, uppercased. The schema is optional for unqualified references.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct QualifiedName {
    pub schema_name: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema_name: impl Into<String>, name: impl Into<String>) -> Self {
        QualifiedName {
            schema_name: Some(normalize_identifier(&schema_name.into())),
            name: normalize_identifier(&name.into()),
        }
    }

    /// Parses `SCHEMA.NAME`, `"Schema"."Name"` or a bare `NAME`.
    pub fn parse(raw: &str) -> QualifiedName {
        let raw = raw.trim();
        match split_qualified(raw) {
            Some((schema, name)) => QualifiedName::new(schema, name),
            None => QualifiedName {
                schema_name: None,
                name: normalize_identifier(raw),
            },
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema_name.as_deref()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema_name {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

// Splits on the first dot outside double quotes
fn split_qualified(raw: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => return Some((&raw[..idx], &raw[idx + 1..])),
            _ => {}
        }
    }
    None
}

/// Uppercases unquoted identifiers and strips quotes from quoted ones.
pub fn normalize_identifier(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_uppercase()
    }
}

/// A node of the dependency graph. Identity is the (name, type) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectNode {
    pub name: QualifiedName,
    pub object_type: ObjectType,
}

impl ObjectNode {
    pub fn new(name: QualifiedName, object_type: ObjectType) -> Self {
        ObjectNode { name, object_type }
    }

    pub fn owner(&self) -> Option<&str> {
        self.name.schema()
    }
}

impl fmt::Display for ObjectNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.object_type)
    }
}
