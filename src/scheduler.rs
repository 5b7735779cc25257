use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use tracing::debug;

use crate::error::{FixupError, Result};
use crate::objects::ObjectType;

/// Directory order used by [`OrderMode::Standard`]. Unknown directories sort last.
pub const STANDARD_ORDER: &[&str] = &[
    "sequence",
    "table",
    "table_alter",
    "constraint",
    "index",
    "view",
    "materialized_view",
    "synonym",
    "procedure",
    "function",
    "package",
    "package_body",
    "type",
    "type_body",
    "trigger",
    "job",
    "schedule",
    "grants",
];

/// Layers used by [`OrderMode::Smart`]: grants run before the code objects
/// that need them, constraints and indexes after everything compiles.
pub const SMART_LAYERS: &[&[&str]] = &[
    &["sequence"],
    &["table"],
    &["table_alter"],
    &["grants"],
    &["view", "synonym"],
    &["materialized_view"],
    &["procedure", "function"],
    &["package", "type"],
    &["package_body", "type_body"],
    &["constraint", "index"],
    &["trigger"],
    &["job", "schedule"],
];

/// Layer given to directories that no known object type claims.
pub const UNKNOWN_LAYER: usize = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderMode {
    #[default]
    Standard,
    Smart,
}

/// Grant tiers share one ordering slot.
fn dir_category(dir: &str) -> &str {
    if dir == "grants" || dir.starts_with("grants_") {
        "grants"
    } else {
        dir
    }
}

pub fn layer_for_dir(dir: &str, mode: OrderMode) -> usize {
    let dir = dir_category(dir);
    let found = match mode {
        OrderMode::Standard => STANDARD_ORDER.iter().position(|d| *d == dir),
        OrderMode::Smart => SMART_LAYERS.iter().position(|layer| layer.contains(&dir)),
    };
    match (found, mode) {
        (Some(layer), _) => layer,
        (None, OrderMode::Standard) => STANDARD_ORDER.len(),
        (None, OrderMode::Smart) => UNKNOWN_LAYER,
    }
}

pub fn object_type_for_dir(dir: &str) -> ObjectType {
    match dir_category(dir) {
        "table_alter" => ObjectType::Table,
        "grants" => ObjectType::Other("GRANT".to_string()),
        other => ObjectType::parse(other),
    }
}

/// A script discovered under the fixup root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixupScript {
    pub path: PathBuf,
    /// Path relative to the fixup root; preserved when archiving.
    pub relative: PathBuf,
    /// First directory component of `relative`, empty for files at the root.
    pub dir: String,
    pub layer: usize,
    pub object_type: ObjectType,
}

impl FixupScript {
    pub fn read_sql(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| FixupError::io(&self.path, e))
    }

    /// File stem, e.g. `HR.EMP_V` for `view/HR.EMP_V.sql`.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Which scripts a scan picks up.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub mode: OrderMode,
    pub done_dir: String,
    /// When non-empty, only these top-level directories are scanned.
    pub only_dirs: Vec<String>,
    pub exclude_dirs: Vec<String>,
    /// File-name globs, e.g. `*.sql` or `HR.*.sql`.
    pub file_globs: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            mode: OrderMode::Standard,
            done_dir: "done".to_string(),
            only_dirs: vec![],
            exclude_dirs: vec![],
            file_globs: vec!["*.sql".to_string()],
        }
    }
}

impl ScanOptions {
    fn accepts_dir(&self, dir: &str) -> bool {
        if dir == self.done_dir || self.exclude_dirs.iter().any(|d| d == dir) {
            return false;
        }
        self.only_dirs.is_empty() || self.only_dirs.iter().any(|d| d == dir)
    }
}

/// Enumerates every script under `root` accepted by `options`, in execution order.
pub fn collect_scripts(root: &Path, options: &ScanOptions) -> Result<Vec<FixupScript>> {
    let mut overrides = OverrideBuilder::new(root);
    for glob in &options.file_globs {
        overrides.add(glob)?;
    }
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .overrides(overrides.build()?)
        .build();

    let mut scripts = vec![];
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().map_or(false, |t| t.is_file()) {
            continue;
        }
        let path = entry.into_path();
        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let dir = if relative.components().count() > 1 {
            relative
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };
        if !options.accepts_dir(&dir) {
            continue;
        }
        scripts.push(FixupScript {
            layer: layer_for_dir(&dir, options.mode),
            object_type: object_type_for_dir(&dir),
            path,
            relative,
            dir,
        });
    }

    scripts.sort_by(compare_scripts);
    debug!(count = scripts.len(), root = %root.display(), "collected fixup scripts");
    Ok(scripts)
}

fn compare_scripts(a: &FixupScript, b: &FixupScript) -> Ordering {
    a.layer.cmp(&b.layer).then_with(|| a.relative.cmp(&b.relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "SELECT 1 FROM dual;\n").unwrap();
    }

    fn names(scripts: &[FixupScript]) -> Vec<String> {
        scripts
            .iter()
            .map(|s| s.relative.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for rel in [
            "view/HR.V2.sql",
            "view/HR.V1.sql",
            "table/HR.T1.sql",
            "grants_miss/HR.sql",
            "index/HR.IDX1.sql",
            "custom/extra.sql",
            "done/table/HR.T0.sql",
            "table/notes.txt",
        ] {
            touch(dir.path(), rel);
        }
        dir
    }

    #[test]
    fn test_standard_order() {
        let dir = fixture();
        let scripts = collect_scripts(dir.path(), &ScanOptions::default()).unwrap();
        assert_eq!(
            names(&scripts),
            vec![
                "table/HR.T1.sql",
                "index/HR.IDX1.sql",
                "view/HR.V1.sql",
                "view/HR.V2.sql",
                "grants_miss/HR.sql",
                "custom/extra.sql",
            ]
        );
    }

    #[test]
    fn test_smart_order_runs_grants_before_views() {
        let dir = fixture();
        let options = ScanOptions {
            mode: OrderMode::Smart,
            ..Default::default()
        };
        let scripts = collect_scripts(dir.path(), &options).unwrap();
        assert_eq!(
            names(&scripts),
            vec![
                "table/HR.T1.sql",
                "grants_miss/HR.sql",
                "view/HR.V1.sql",
                "view/HR.V2.sql",
                "index/HR.IDX1.sql",
                "custom/extra.sql",
            ]
        );
        assert_eq!(scripts.last().unwrap().layer, UNKNOWN_LAYER);
    }

    #[test]
    fn test_include_exclude_and_globs() {
        let dir = fixture();
        let options = ScanOptions {
            only_dirs: vec!["view".to_string(), "table".to_string()],
            exclude_dirs: vec!["table".to_string()],
            file_globs: vec!["*V1.sql".to_string()],
            ..Default::default()
        };
        let scripts = collect_scripts(dir.path(), &options).unwrap();
        assert_eq!(names(&scripts), vec!["view/HR.V1.sql"]);
        assert_eq!(scripts[0].object_type, ObjectType::View);
        assert_eq!(scripts[0].stem(), "HR.V1");
    }

    #[test]
    fn test_layers() {
        assert_eq!(layer_for_dir("sequence", OrderMode::Smart), 0);
        assert_eq!(layer_for_dir("grants_all", OrderMode::Smart), 3);
        assert_eq!(layer_for_dir("synonym", OrderMode::Smart), layer_for_dir("view", OrderMode::Smart));
        assert_eq!(layer_for_dir("mystery", OrderMode::Standard), STANDARD_ORDER.len());
        assert_eq!(object_type_for_dir("package_body"), ObjectType::PackageBody);
        assert_eq!(object_type_for_dir("table_alter"), ObjectType::Table);
    }
}
