//! Pooled, read-only Postgres access plus Pgpool-II introspection (spec
//! §4.3 point 3, §8 "read-only query gate").

use crate::error::CoreError;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row};
use std::time::Instant;

#[derive(Clone)]
pub struct PostgresClient {
    pool: sqlx::PgPool,
}

impl PostgresClient {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Times a trivial round trip; returns `999.0` on failure instead of
    /// propagating, matching the degrade-not-fail latency probe the
    /// metrics tick relies on (spec §4.3 point 3).
    pub async fn db_latency_probe(&self) -> f64 {
        let start = Instant::now();
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => start.elapsed().as_secs_f64(),
            Err(_) => 999.0,
        }
    }

    /// Resolves a computer's internal id from its agent-facing UUID
    /// (spec §4.3 point 4, sync queue drain).
    pub async fn get_cid_from_uuid(&self, uuid: &str) -> Result<Option<i64>, CoreError> {
        let row = sqlx::query("SELECT id FROM public.client_computer WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    /// `SHOW pool_nodes`, used only when [`crate::config::Config::is_pgpool`]
    /// is true. Every Pgpool `SHOW` column is text regardless of its
    /// logical type, so every value is decoded as `String`.
    pub async fn show_pool_nodes(&self) -> Result<Vec<PgpoolRow>, CoreError> {
        let rows = sqlx::query("SHOW pool_nodes").fetch_all(&self.pool).await?;
        Ok(rows.iter().map(PgpoolRow::from_row).collect())
    }

    pub async fn show_pool_backend_stats(&self) -> Result<Vec<PgpoolRow>, CoreError> {
        let rows = sqlx::query("SHOW pool_backend_stats").fetch_all(&self.pool).await?;
        Ok(rows.iter().map(PgpoolRow::from_row).collect())
    }
}

/// One row of a Pgpool `SHOW` command, with values exposed as a
/// name→text map and a [`PgpoolRow::get_cnt`] fuzzy lookup.
#[derive(Debug, Clone)]
pub struct PgpoolRow {
    pub columns: Vec<(String, String)>,
}

impl PgpoolRow {
    fn from_row(row: &PgRow) -> Self {
        let columns = row
            .columns()
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let value: String = row.try_get::<String, _>(i).unwrap_or_default();
                (c.name().to_string(), value)
            })
            .collect();
        Self { columns }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Fuzzy column lookup matching any of `search_terms` case-insensitively
    /// as either an exact name or a substring, returning the first match
    /// parsed as an integer counter — ports the original `get_cnt` helper
    /// used against Pgpool's loosely-named `SHOW pool_backend_stats`
    /// columns (e.g. `select_cnt` vs `select_count` across versions).
    pub fn get_cnt(&self, search_terms: &[&str]) -> i64 {
        for term in search_terms {
            let term_lc = term.to_lowercase();
            for (name, value) in &self.columns {
                let name_lc = name.to_lowercase();
                if name_lc == term_lc || name_lc.contains(&term_lc) {
                    if let Ok(n) = value.trim().parse::<i64>() {
                        return n;
                    }
                }
            }
        }
        0
    }
}

/// Rejects anything but a single read-only statement (spec §8: "the query
/// gate must reject writes, multi-statements, and administrative
/// commands"). Comments are stripped first so they cannot hide a second
/// statement or a forbidden keyword from the prefix/keyword checks.
pub fn validate_readonly_sql(sql: &str) -> Result<(), CoreError> {
    let stripped = strip_sql_comments(sql);
    let trimmed = stripped.trim();

    if trimmed.is_empty() {
        return Err(CoreError::InvalidQuery("empty query".into()));
    }

    let lower = trimmed.to_lowercase();
    let allowed_prefixes = ["select", "explain", "with"];
    if !allowed_prefixes.iter().any(|p| lower.starts_with(p)) {
        return Err(CoreError::InvalidQuery(
            "only SELECT, WITH, and EXPLAIN statements are allowed".into(),
        ));
    }

    if has_top_level_semicolon(trimmed) {
        return Err(CoreError::InvalidQuery("multi-statement queries are not allowed".into()));
    }

    const FORBIDDEN: &[&str] = &[
        "insert", "update", "delete", "drop", "alter", "truncate", "grant", "revoke", "create",
        "copy", "call", "vacuum", "reindex", "--", "/*",
    ];
    for word in FORBIDDEN {
        if lower.contains(word) {
            return Err(CoreError::InvalidQuery(format!("forbidden keyword: {word}")));
        }
    }

    Ok(())
}

fn strip_sql_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_single_quote = false;
    while let Some(c) = chars.next() {
        if in_single_quote {
            out.push(c);
            if c == '\'' {
                in_single_quote = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_single_quote = true;
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn has_top_level_semicolon(sql: &str) -> bool {
    let trimmed = sql.trim_end();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    let mut in_single_quote = false;
    for c in body.chars() {
        match c {
            '\'' => in_single_quote = !in_single_quote,
            ';' if !in_single_quote => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_select() {
        assert!(validate_readonly_sql("select * from client_computer").is_ok());
    }

    #[test]
    fn accepts_with_cte() {
        assert!(validate_readonly_sql("WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
    }

    #[test]
    fn rejects_insert() {
        assert!(validate_readonly_sql("insert into t values (1)").is_err());
    }

    #[test]
    fn rejects_trailing_second_statement() {
        assert!(validate_readonly_sql("select 1; drop table t").is_err());
    }

    #[test]
    fn tolerates_single_trailing_semicolon() {
        assert!(validate_readonly_sql("select 1;").is_ok());
    }

    #[test]
    fn rejects_sql_comment_hiding_a_statement() {
        assert!(validate_readonly_sql("select 1 -- ; drop table t\n; drop table t").is_err());
    }

    #[test]
    fn semicolon_inside_string_literal_is_not_top_level() {
        assert!(!has_top_level_semicolon("select 'a;b'"));
    }

    #[test]
    fn get_cnt_matches_by_substring_case_insensitively() {
        let row = PgpoolRow {
            columns: vec![("Select_Count".to_string(), "42".to_string())],
        };
        assert_eq!(row.get_cnt(&["select_cnt", "select_count"]), 42);
    }
}
