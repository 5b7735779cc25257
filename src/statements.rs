//! Statement-level handling of fixup scripts: splitting script text into
//! executable statements and rendering the few statements we synthesize.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    LineComment,
    BlockComment,
    SingleQuoted,
    DoubleQuoted,
    // q'[...]' literal, holding the closing delimiter
    AltQuoted(char),
}

/// Splits script text into individually executable statements.
///
/// Statements end at a `;` outside comments and literals. Block comments nest:
/// `/* a /* b */ c */` is a single comment. PL/SQL units (`CREATE PROCEDURE`,
/// `PACKAGE`, `TRIGGER`, `TYPE`, anonymous blocks) contain semicolons of their
/// own and only end at a line holding a lone `/` or at the end of the text.
/// Comment-only fragments are dropped, so a blank script yields no statements.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    // Same text without comments, used to decide what kind of statement we are in
    let mut code = String::new();
    let mut state = ScanState::Normal;
    let mut depth = 0usize;
    let mut line_start = true;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        match state {
            ScanState::Normal => {
                if ch == '/' && next == Some('*') {
                    state = ScanState::BlockComment;
                    depth = 1;
                    current.push_str("/*");
                    line_start = false;
                    i += 2;
                    continue;
                }
                if ch == '-' && next == Some('-') {
                    state = ScanState::LineComment;
                    current.push_str("--");
                    i += 2;
                    continue;
                }
                if let Some(close) = alt_quote_close(&chars, i) {
                    let open: String = chars[i..i + 3].iter().collect();
                    current.push_str(&open);
                    code.push_str(&open);
                    state = ScanState::AltQuoted(close);
                    line_start = false;
                    i += 3;
                    continue;
                }
                if ch == '/' && line_start && rest_of_line_is_blank(&chars, i + 1) {
                    flush(&mut statements, &mut current, &mut code);
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                    continue;
                }
                current.push(ch);
                code.push(ch);
                match ch {
                    '\'' => state = ScanState::SingleQuoted,
                    '"' => state = ScanState::DoubleQuoted,
                    ';' if !is_plsql_unit(&code) => {
                        flush(&mut statements, &mut current, &mut code);
                    }
                    _ => {}
                }
            }
            ScanState::LineComment => {
                current.push(ch);
                if ch == '\n' {
                    state = ScanState::Normal;
                }
            }
            ScanState::BlockComment => {
                if ch == '/' && next == Some('*') {
                    depth += 1;
                    current.push_str("/*");
                    i += 2;
                    continue;
                }
                if ch == '*' && next == Some('/') {
                    depth -= 1;
                    current.push_str("*/");
                    if depth == 0 {
                        state = ScanState::Normal;
                    }
                    i += 2;
                    continue;
                }
                current.push(ch);
            }
            ScanState::AltQuoted(close) => {
                current.push(ch);
                code.push(ch);
                if ch == close && next == Some('\'') {
                    current.push('\'');
                    code.push('\'');
                    state = ScanState::Normal;
                    line_start = false;
                    i += 2;
                    continue;
                }
            }
            ScanState::SingleQuoted | ScanState::DoubleQuoted => {
                current.push(ch);
                code.push(ch);
                let quote = if state == ScanState::SingleQuoted { '\'' } else { '"' };
                if ch == quote {
                    state = ScanState::Normal;
                }
            }
        }

        if ch == '\n' {
            line_start = true;
        } else if !ch.is_whitespace() {
            line_start = false;
        }
        i += 1;
    }

    flush(&mut statements, &mut current, &mut code);
    statements
}

fn flush(statements: &mut Vec<String>, current: &mut String, code: &mut String) {
    if !code.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    current.clear();
    code.clear();
}

// Closing delimiter when an Oracle q-quote (`q'[`, `Q'!`, `nq'<`) starts at `i`.
fn alt_quote_close(chars: &[char], i: usize) -> Option<char> {
    if !matches!(chars[i], 'q' | 'Q') || chars.get(i + 1) != Some(&'\'') {
        return None;
    }
    let is_ident = |c: &char| c.is_alphanumeric() || matches!(c, '_' | '$' | '#');
    let standalone = match i.checked_sub(1).map(|p| chars[p]) {
        None => true,
        Some('n' | 'N') => i < 2 || !is_ident(&chars[i - 2]),
        Some(prev) => !is_ident(&prev),
    };
    if !standalone {
        return None;
    }
    match *chars.get(i + 2)? {
        '[' => Some(']'),
        '(' => Some(')'),
        '{' => Some('}'),
        '<' => Some('>'),
        c if c.is_whitespace() || c == '\'' => None,
        c => Some(c),
    }
}

fn rest_of_line_is_blank(chars: &[char], from: usize) -> bool {
    chars[from.min(chars.len())..]
        .iter()
        .take_while(|&&c| c != '\n')
        .all(|c| c.is_whitespace())
}

fn is_plsql_unit(code: &str) -> bool {
    static HEAD: OnceLock<Regex> = OnceLock::new();
    HEAD.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:create\s+(?:or\s+replace\s+)?(?:(?:non)?editionable\s+)?(?:procedure|function|package|trigger|type)\b|declare\b|begin\b)",
        )
        .unwrap()
    })
    .is_match(code)
}

fn schema_directive_regex() -> &'static Regex {
    static DIRECTIVE: OnceLock<Regex> = OnceLock::new();
    DIRECTIVE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*alter\s+session\s+set\s+current_schema\s*=\s*("[^"]+"|[A-Za-z0-9_$#]+)\s*;?\s*$"#)
            .unwrap()
    })
}

/// Returns the schema named by an `ALTER SESSION SET CURRENT_SCHEMA` statement.
pub fn parse_schema_directive(statement: &str) -> Option<String> {
    schema_directive_regex()
        .captures(statement)
        .map(|caps| crate::objects::normalize_identifier(&caps[1]))
}

pub fn is_schema_directive(statement: &str) -> bool {
    schema_directive_regex().is_match(statement)
}

/// `ALTER SESSION SET CURRENT_SCHEMA = <SCHEMA>;`
pub fn schema_directive(schema: &str) -> String {
    format!("ALTER SESSION SET CURRENT_SCHEMA = {};", schema.trim().to_uppercase())
}

/// Renders the canonical grant text used when a required grant is absent from
/// every grant tier.
pub fn build_auto_grant_statement(
    grantee: &str,
    object: &str,
    privilege: &str,
    with_grant_option: bool,
) -> String {
    let mut statement = format!(
        "GRANT {} ON {} TO {}",
        privilege.trim().to_uppercase(),
        object.trim().to_uppercase(),
        grantee.trim().to_uppercase()
    );
    if with_grant_option {
        statement.push_str(" WITH GRANT OPTION");
    }
    statement.push(';');
    statement
}

/// First line of a statement, shortened for log output.
pub fn preview(statement: &str, max_chars: usize) -> String {
    let line = statement
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("--"))
        .unwrap_or("");
    if line.chars().count() > max_chars {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// Joins statements back into script text. PL/SQL units are closed with a
/// lone `/` line so the text splits into the same statements again.
pub fn join_statements(statements: &[String]) -> String {
    let mut script = String::new();
    for statement in statements {
        script.push_str(statement.trim_end());
        if is_plsql_unit(skip_leading_comments(statement)) {
            script.push_str("\n/");
        }
        script.push('\n');
    }
    script
}

fn skip_leading_comments(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        if let Some(rest) = text.strip_prefix("--") {
            text = rest.split_once('\n').map_or("", |(_, after)| after);
        } else if text.starts_with("/*") {
            let mut depth = 0usize;
            let mut end = text.len();
            let bytes = text.as_bytes();
            let mut i = 0;
            while i + 1 < bytes.len() {
                match (bytes[i], bytes[i + 1]) {
                    (b'/', b'*') => {
                        depth += 1;
                        i += 2;
                    }
                    (b'*', b'/') => {
                        depth -= 1;
                        i += 2;
                        if depth == 0 {
                            end = i;
                            break;
                        }
                    }
                    _ => i += 1,
                }
            }
            text = &text[end..];
        } else {
            return text;
        }
    }
}
