// Query validator - a light statement scan, not a SQL parser. It needs to
// answer two questions reliably: which tables does this statement touch,
// and does it constrain the sharded ones by their tenant column.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Strictness;
use crate::error::{RouterError, RouterResult};
use crate::infrastructure::context;
use crate::infrastructure::entity_registry::EntityClassifier;
use crate::infrastructure::monitoring::RouterMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

/// What the scan saw: statement kind, referenced tables, and the sharded
/// tables among them that carry no tenant predicate.
#[derive(Debug, Clone)]
pub struct StatementReport {
    pub kind: StatementKind,
    pub tables: Vec<String>,
    pub missing: Vec<String>,
}

impl StatementReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }
}

static TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN|INTO|UPDATE)\s+[`"]?([A-Za-z_][A-Za-z0-9_$]*)[`"]?"#)
        .expect("table regex")
});

static INSERT_COLUMNS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)INSERT\s+INTO\s+[`"]?[A-Za-z_][A-Za-z0-9_$]*[`"]?\s*\(([^)]*)\)"#)
        .expect("insert columns regex")
});

static INSERT_TARGET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)INSERT\s+INTO\s+[`"]?([A-Za-z_][A-Za-z0-9_$]*)"#)
        .expect("insert target regex")
});

static WHERE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where regex"));
static FROM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bFROM\b").expect("from regex"));
static VALUES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bVALUES\b").expect("values regex"));

pub struct QueryValidator {
    classifier: Arc<EntityClassifier>,
    strictness: Strictness,
    metrics: Arc<RouterMetrics>,
    /// Predicate matchers, one per known tenant column. The column set is
    /// fixed at startup, so these compile once.
    predicate_res: HashMap<String, Regex>,
}

impl QueryValidator {
    pub fn new(
        classifier: Arc<EntityClassifier>,
        strictness: Strictness,
        tenant_columns: &[String],
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        let mut columns: Vec<String> = tenant_columns.to_vec();
        for table in classifier.sharded_tables() {
            if let Some(column) = classifier.tenant_column(table) {
                if !columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                    columns.push(column.to_string());
                }
            }
        }

        let predicate_res = columns
            .into_iter()
            .map(|column| {
                let pattern = format!(
                    r#"(?i)(?:\b[A-Za-z_][A-Za-z0-9_$]*\.)?\b{}\s*(?:=\s*(?:\?|\$\d+|:\w+|@\w+|'[^']*'|\d+)|IN\s*\()"#,
                    regex::escape(&column)
                );
                let re = Regex::new(&pattern).expect("tenant predicate regex");
                (column.to_lowercase(), re)
            })
            .collect();

        Self {
            classifier,
            strictness,
            metrics,
            predicate_res,
        }
    }

    pub fn strictness(&self) -> Strictness {
        self.strictness
    }

    /// Scan a statement without applying policy.
    pub fn inspect(&self, sql: &str) -> StatementReport {
        let normalized = normalize(sql);
        let kind = statement_kind(&normalized);
        let tables = referenced_tables(&normalized);
        let insert_target = INSERT_TARGET_RE
            .captures(&normalized)
            .map(|caps| caps[1].to_lowercase());

        let mut missing = Vec::new();
        for table in &tables {
            if !self.classifier.is_sharded(table) {
                continue;
            }
            let Some(column) = self.classifier.tenant_column(table) else {
                continue;
            };
            // The column-set rule applies to the INSERT target; source
            // tables of INSERT ... SELECT are checked like reads.
            let satisfied = if insert_target.as_deref() == Some(table.as_str()) {
                self.insert_carries_tenant(&normalized, column)
            } else if kind == StatementKind::Insert {
                self.predicate_present(&normalized, StatementKind::Select, column)
            } else {
                self.predicate_present(&normalized, kind, column)
            };
            if !satisfied {
                missing.push(table.clone());
            }
        }

        StatementReport {
            kind,
            tables,
            missing,
        }
    }

    /// Apply the configured policy to a statement. `Strict` violations
    /// fail; `Warn` and `Log` let the statement through with telemetry.
    pub fn validate(&self, sql: &str) -> RouterResult<()> {
        if self.strictness == Strictness::Disabled {
            return Ok(());
        }
        if let Some(ctx) = context::current() {
            ctx.check_deadline()?;
        }

        let report = self.inspect(sql);
        if report.is_clean() {
            return Ok(());
        }

        let table = report.missing[0].clone();
        match self.strictness {
            Strictness::Strict => {
                self.metrics.validation_violations.fetch_add(1, Ordering::Relaxed);
                Err(RouterError::TenantFilterMissing {
                    table,
                    statement: kind_name(report.kind).to_string(),
                })
            }
            Strictness::Warn => {
                self.metrics.validation_warnings.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} against sharded table '{}' has no tenant predicate",
                    kind_name(report.kind),
                    table
                );
                Ok(())
            }
            Strictness::Log => {
                info!(
                    "{} against sharded table '{}' has no tenant predicate",
                    kind_name(report.kind),
                    table
                );
                Ok(())
            }
            Strictness::Disabled => Ok(()),
        }
    }

    /// Predicate detection for SELECT/UPDATE/DELETE. UPDATE is only
    /// checked after WHERE so `SET account_id = ...` assignments don't
    /// count as filters.
    fn predicate_present(&self, sql: &str, kind: StatementKind, column: &str) -> bool {
        let Some(re) = self.predicate_res.get(&column.to_lowercase()) else {
            return false;
        };
        let region = match kind {
            StatementKind::Update | StatementKind::Delete => match WHERE_RE.find(sql) {
                Some(m) => &sql[m.end()..],
                None => return false,
            },
            StatementKind::Select => match FROM_RE.find(sql) {
                Some(m) => &sql[m.end()..],
                None => sql,
            },
            _ => sql,
        };
        re.is_match(region)
    }

    /// INSERT rule: the tenant column must be listed with a non-NULL value
    /// in every tuple. INSERT ... SELECT falls back to predicate scanning
    /// of the source query.
    fn insert_carries_tenant(&self, sql: &str, column: &str) -> bool {
        let Some(caps) = INSERT_COLUMNS_RE.captures(sql) else {
            return false;
        };
        let columns: Vec<String> = caps[1]
            .split(',')
            .map(|c| c.trim().trim_matches(['`', '"']).to_lowercase())
            .collect();
        let Some(position) = columns.iter().position(|c| c == &column.to_lowercase()) else {
            return false;
        };

        let Some(values_at) = VALUES_RE.find(sql) else {
            // INSERT INTO t (...) SELECT ...
            return self.predicate_present(sql, StatementKind::Select, column);
        };

        let tuples = parse_tuples(&sql[values_at.end()..]);
        if tuples.is_empty() {
            return false;
        }
        tuples.iter().all(|tuple| {
            tuple
                .get(position)
                .map(|value| {
                    let v = value.trim();
                    !v.eq_ignore_ascii_case("NULL") && !v.eq_ignore_ascii_case("DEFAULT")
                })
                .unwrap_or(false)
        })
    }
}

fn kind_name(kind: StatementKind) -> &'static str {
    match kind {
        StatementKind::Select => "SELECT",
        StatementKind::Insert => "INSERT",
        StatementKind::Update => "UPDATE",
        StatementKind::Delete => "DELETE",
        StatementKind::Other => "Statement",
    }
}

fn statement_kind(sql: &str) -> StatementKind {
    let trimmed = sql.trim_start();
    let word: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    match word.to_ascii_uppercase().as_str() {
        "SELECT" => StatementKind::Select,
        "INSERT" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        _ => StatementKind::Other,
    }
}

fn referenced_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for caps in TABLE_RE.captures_iter(sql) {
        let table = caps[1].to_lowercase();
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}

/// Strip string literals (keeping empty quotes so value shapes survive)
/// and comments, so table and predicate scans cannot match inside them.
fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push_str("''");
                while let Some(inner) = chars.next() {
                    if inner == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Split the VALUES clause into tuples of top-level comma-separated
/// expressions.
fn parse_tuples(rest: &str) -> Vec<Vec<String>> {
    let mut tuples = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    let mut tuple: Vec<String> = Vec::new();
    let mut in_tuple = false;

    for c in rest.chars() {
        match c {
            '(' => {
                if depth == 0 {
                    in_tuple = true;
                    tuple = Vec::new();
                    current.clear();
                } else {
                    current.push(c);
                }
                depth += 1;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && in_tuple {
                    tuple.push(current.trim().to_string());
                    tuples.push(tuple.clone());
                    in_tuple = false;
                } else {
                    current.push(c);
                }
            }
            ',' if depth == 1 => {
                tuple.push(current.trim().to_string());
                current.clear();
            }
            _ if depth >= 1 => current.push(c),
            // Between tuples: stop at anything that is not separator
            // whitespace or a comma, e.g. ON CONFLICT / RETURNING.
            _ if !c.is_whitespace() && c != ',' => break,
            _ => {}
        }
    }
    tuples
}
