//! In-process [`RowStore`] used by tests and local simulations.
//!
//! Understands a deliberately small SQL subset:
//! - predicates: `[WHERE] col = 'v' [AND col <> 'v' ...]`, or empty / `TRUE` for all rows;
//! - set clauses: `SET col = 'v' [, col = v ...]`.
//!
//! Rows are kept in identifier order, which gives selections the same
//! deterministic ordering a real backend produces with `ORDER BY identifier`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{RowId, RowStore};

/// Column name to value.
pub type Row = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, BTreeMap<RowId, Row>>,
    selections: BTreeMap<String, Vec<RowId>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    update_calls: AtomicU64,
    /// `apply_update` call index -> artificial latency before the write.
    stalls: Mutex<BTreeMap<u64, Duration>>,
    /// Latency before the next selection is materialized.
    selection_stall: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_table(&self, table: &str) {
        self.state().tables.entry(table.to_string()).or_default();
    }

    /// Inserts (or replaces) one row, creating the table on demand.
    pub fn insert<I, K, V>(&self, table: &str, id: &str, columns: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let row = columns
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<Row>();
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), row);
    }

    /// Removes a row, e.g. to model a concurrent delete after planning.
    pub fn delete_row(&self, table: &str, id: &str) -> bool {
        self.state()
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .is_some()
    }

    /// Copy of the whole table, keyed by identifier.
    pub fn rows(&self, table: &str) -> Option<BTreeMap<RowId, Row>> {
        self.state().tables.get(table).cloned()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.state()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    pub fn has_selection(&self, selection: &str) -> bool {
        self.state().selections.contains_key(selection)
    }

    /// Cuts a materialized selection down to `len` identifiers.
    pub fn truncate_selection(&self, selection: &str, len: usize) -> bool {
        match self.state().selections.get_mut(selection) {
            Some(ids) => {
                ids.truncate(len);
                true
            }
            None => false,
        }
    }

    /// Number of `apply_update` calls seen so far.
    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Delays the `call_index`-th (0-based) `apply_update` by `delay`. A delay at
    /// or above the call's timeout behaves like a server-side statement timeout.
    pub fn stall_update(&self, call_index: u64, delay: Duration) {
        self.stalls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(call_index, delay);
    }

    /// Delays the next `create_selection` by `delay`, as a slow scan of a large table would.
    pub fn stall_selection(&self, delay: Duration) {
        *self
            .selection_stall
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(delay);
    }

    fn take_stall(&self, call_index: u64) -> Option<Duration> {
        self.stalls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&call_index)
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn create_selection(
        &self,
        selection: &str,
        table: &str,
        predicate: &str,
    ) -> Result<u64, StoreError> {
        let filter = Filter::parse(predicate)?;
        let stall = self
            .selection_stall
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.selections.contains_key(selection) {
            return Err(StoreError::SelectionExists(selection.to_string()));
        }
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let ids = rows
            .iter()
            .filter(|(_, row)| filter.matches(row))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        let count = ids.len() as u64;
        state.selections.insert(selection.to_string(), ids);
        Ok(count)
    }

    async fn attach_selection(&self, selection: &str) -> Result<u64, StoreError> {
        self.state()
            .selections
            .get(selection)
            .map(|ids| ids.len() as u64)
            .ok_or_else(|| StoreError::UnknownSelection(selection.to_string()))
    }

    async fn read_selection(
        &self,
        selection: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RowId>, StoreError> {
        let state = self.state();
        let ids = state
            .selections
            .get(selection)
            .ok_or_else(|| StoreError::UnknownSelection(selection.to_string()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(ids.len());
        let end = start
            .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
            .min(ids.len());
        Ok(ids[start..end].to_vec())
    }

    async fn apply_update(
        &self,
        table: &str,
        set_clause: &str,
        ids: &[RowId],
        timeout: Duration,
    ) -> Result<u64, StoreError> {
        let assignments = parse_set_clause(set_clause)?;
        let call_index = self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.take_stall(call_index) {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(StoreError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let mut updated = 0u64;
        for id in ids {
            if let Some(row) = rows.get_mut(id) {
                for (column, value) in &assignments {
                    row.insert(column.clone(), value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn drop_selection(&self, selection: &str) -> Result<(), StoreError> {
        self.state().selections.remove(selection);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Text(String),
    Eq,
    NotEq,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, StoreError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '!' | '<' => {
                chars.next();
                let expected = if c == '!' { '=' } else { '>' };
                if chars.next() != Some(expected) {
                    return Err(StoreError::InvalidQuery(format!(
                        "unsupported operator starting with `{c}`"
                    )));
                }
                tokens.push(Token::NotEq);
            }
            '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            text.push('\'');
                        }
                        Some('\'') => break,
                        Some(ch) => text.push(ch),
                        None => {
                            return Err(StoreError::InvalidQuery(
                                "unterminated string literal".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unexpected character `{other}`"
                )))
            }
        }
    }
    Ok(tokens)
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
}

fn literal(token: Option<&Token>) -> Result<String, StoreError> {
    match token {
        Some(Token::Text(text)) => Ok(text.clone()),
        Some(Token::Word(word)) => Ok(word.clone()),
        other => Err(StoreError::InvalidQuery(format!(
            "expected a value, found {other:?}"
        ))),
    }
}

fn column(token: Option<&Token>) -> Result<String, StoreError> {
    match token {
        Some(Token::Word(word)) => Ok(word.clone()),
        other => Err(StoreError::InvalidQuery(format!(
            "expected a column name, found {other:?}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Condition {
    column: String,
    value: String,
    negated: bool,
}

/// Conjunction of column comparisons; empty matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    fn parse(predicate: &str) -> Result<Self, StoreError> {
        let tokens = tokenize(predicate)?;
        let mut rest = tokens.as_slice();
        if rest.first().is_some_and(|t| is_keyword(t, "where")) {
            rest = &rest[1..];
            if rest.is_empty() {
                return Err(StoreError::InvalidQuery("empty WHERE clause".into()));
            }
        }
        if rest.len() == 1 && is_keyword(&rest[0], "true") {
            return Ok(Self::default());
        }

        let mut conditions = Vec::new();
        while !rest.is_empty() {
            if rest.len() < 3 {
                return Err(StoreError::InvalidQuery(format!(
                    "incomplete condition in `{predicate}`"
                )));
            }
            let column = column(rest.first())?;
            let negated = match &rest[1] {
                Token::Eq => false,
                Token::NotEq => true,
                other => {
                    return Err(StoreError::InvalidQuery(format!(
                        "expected comparison operator, found {other:?}"
                    )))
                }
            };
            let value = literal(rest.get(2))?;
            conditions.push(Condition {
                column,
                value,
                negated,
            });
            rest = &rest[3..];
            if let Some(next) = rest.first() {
                if !is_keyword(next, "and") {
                    return Err(StoreError::InvalidQuery(format!(
                        "expected AND, found {next:?}"
                    )));
                }
                rest = &rest[1..];
                if rest.is_empty() {
                    return Err(StoreError::InvalidQuery("dangling AND".into()));
                }
            }
        }
        Ok(Self { conditions })
    }

    fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|condition| {
            let equal = row.get(&condition.column) == Some(&condition.value);
            equal != condition.negated
        })
    }
}

fn parse_set_clause(set_clause: &str) -> Result<Vec<(String, String)>, StoreError> {
    let tokens = tokenize(set_clause)?;
    let mut rest = match tokens.split_first() {
        Some((first, rest)) if is_keyword(first, "set") => rest,
        _ => {
            return Err(StoreError::InvalidQuery(format!(
                "set clause must start with SET: `{set_clause}`"
            )))
        }
    };

    let mut assignments = Vec::new();
    loop {
        let column = column(rest.first())?;
        if rest.get(1) != Some(&Token::Eq) {
            return Err(StoreError::InvalidQuery(format!(
                "expected `=` after `{column}`"
            )));
        }
        let value = literal(rest.get(2))?;
        assignments.push((column, value));
        rest = rest.get(3..).unwrap_or_default();
        match rest.split_first() {
            None => break,
            Some((Token::Comma, tail)) => rest = tail,
            Some((other, _)) => {
                return Err(StoreError::InvalidQuery(format!(
                    "expected `,` between assignments, found {other:?}"
                )))
            }
        }
    }
    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn filter_parses_where_and_conjunctions() {
        let filter = Filter::parse("WHERE provider = 'foo' AND title <> 'it''s'").expect("filter");
        assert!(filter.matches(&row(&[("provider", "foo"), ("title", "x")])));
        assert!(!filter.matches(&row(&[("provider", "foo"), ("title", "it's")])));
        assert!(!filter.matches(&row(&[("provider", "bar"), ("title", "x")])));
    }

    #[test]
    fn empty_and_true_predicates_match_everything() {
        assert!(Filter::parse("").expect("empty").matches(&Row::new()));
        assert!(Filter::parse("where TRUE").expect("true").matches(&Row::new()));
    }

    #[test]
    fn malformed_predicates_are_rejected() {
        for bad in ["WHERE", "provider =", "provider = 'a' OR x = 'b'", "a = 'b' AND", "a > 1"] {
            assert!(
                matches!(Filter::parse(bad), Err(StoreError::InvalidQuery(_))),
                "predicate `{bad}` should be rejected"
            );
        }
    }

    #[test]
    fn set_clause_supports_multiple_assignments() {
        let assignments = parse_set_clause("SET title = 'new', views = 10").expect("set");
        assert_eq!(
            assignments,
            vec![
                ("title".to_string(), "new".to_string()),
                ("views".to_string(), "10".to_string())
            ]
        );
        assert!(parse_set_clause("title = 'new'").is_err());
        assert!(parse_set_clause("SET title 'new'").is_err());
    }

    #[tokio::test]
    async fn selection_is_frozen_against_later_inserts() {
        let store = MemoryStore::new();
        store.insert("image", "a", [("provider", "foo")]);
        store.insert("image", "b", [("provider", "foo")]);
        let count = store
            .create_selection("s", "image", "WHERE provider = 'foo'")
            .await
            .expect("selection");
        assert_eq!(count, 2);

        store.insert("image", "c", [("provider", "foo")]);
        let ids = store.read_selection("s", 0, 10).await.expect("read");
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(
            store.create_selection("s", "image", "").await,
            Err(StoreError::SelectionExists(_))
        ));
    }

    #[tokio::test]
    async fn read_past_end_is_empty() {
        let store = MemoryStore::new();
        store.insert("image", "a", [("provider", "foo")]);
        store.create_selection("s", "image", "").await.expect("selection");
        assert!(store.read_selection("s", 4, 1).await.expect("read").is_empty());
    }
}
