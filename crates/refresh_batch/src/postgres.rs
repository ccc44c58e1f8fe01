//! PostgreSQL [`RowStore`] backed by `tokio-postgres`.
//!
//! The selection is a plain table `<run_id>_rows_to_update(row_id, <id>)`
//! numbered with `ROW_NUMBER() OVER (ORDER BY <id>)`, so later inserts or
//! updates on the live table cannot change which rows a batch touches.
//! Each batch runs in its own transaction with `SET LOCAL statement_timeout`,
//! so a timed-out batch is rolled back by the server. The client waits a
//! little longer than the server before cancelling the query itself, and
//! once `COMMIT` has been sent it waits for the answer whatever the budget.
//!
//! Predicates and set clauses are trusted SQL fragments supplied by the
//! operator; table, selection and id-column names are validated identifiers.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{RowId, RowStore};

/// Default identifier column on media tables.
pub const DEFAULT_ID_COLUMN: &str = "identifier";

/// Slack on top of `statement_timeout` before the client cancels on its own.
const CLIENT_GRACE: Duration = Duration::from_secs(5);

pub struct PgRowStore {
    client: Mutex<Client>,
    id_column: String,
}

impl PgRowStore {
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
            id_column: DEFAULT_ID_COLUMN.to_string(),
        }
    }

    /// Connects without TLS and drives the connection on a background task.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres connection closed with error");
            }
        });
        Ok(Self::new(client))
    }

    pub fn with_id_column(mut self, id_column: &str) -> anyhow::Result<Self> {
        if !is_identifier(id_column) {
            anyhow::bail!("invalid id column `{id_column}`");
        }
        self.id_column = id_column.to_string();
        Ok(self)
    }
}

fn is_identifier(raw: &str) -> bool {
    !raw.is_empty()
        && raw.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn checked<'a>(raw: &'a str, what: &str) -> Result<&'a str, StoreError> {
    if is_identifier(raw) {
        Ok(raw)
    } else {
        Err(StoreError::InvalidQuery(format!("invalid {what} name `{raw}`")))
    }
}

/// Which object an `undefined_table` error refers to.
#[derive(Clone, Copy)]
enum Missing<'a> {
    Table(&'a str),
    Selection(&'a str),
}

fn map_pg_error(err: tokio_postgres::Error, missing: Missing<'_>) -> StoreError {
    let code = match err.code() {
        Some(code) => code.clone(),
        None => return StoreError::Backend(anyhow::Error::new(err)),
    };
    let message = err
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| err.to_string());

    if code == SqlState::QUERY_CANCELED {
        StoreError::Timeout
    } else if code == SqlState::UNDEFINED_TABLE {
        match missing {
            Missing::Table(table) => StoreError::UnknownTable(table.to_string()),
            Missing::Selection(selection) => StoreError::UnknownSelection(selection.to_string()),
        }
    } else if code == SqlState::DUPLICATE_TABLE {
        match missing {
            Missing::Selection(selection) => StoreError::SelectionExists(selection.to_string()),
            Missing::Table(_) => StoreError::InvalidQuery(message),
        }
    } else if [
        SqlState::SYNTAX_ERROR,
        SqlState::UNDEFINED_COLUMN,
        SqlState::UNDEFINED_FUNCTION,
        SqlState::DATATYPE_MISMATCH,
        SqlState::INVALID_TEXT_REPRESENTATION,
    ]
    .contains(&code)
    {
        StoreError::InvalidQuery(message)
    } else {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn create_selection(
        &self,
        selection: &str,
        table: &str,
        predicate: &str,
    ) -> Result<u64, StoreError> {
        let selection = checked(selection, "selection")?;
        let table = checked(table, "table")?;
        let id = &self.id_column;
        let client = self.client.lock().await;

        // A duplicate selection must surface as `SelectionExists`, not as a
        // missing source table, so check for it before touching the live table.
        let exists = client
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&selection])
            .await
            .map_err(|err| map_pg_error(err, Missing::Selection(selection)))?;
        if exists.get::<_, bool>(0) {
            return Err(StoreError::SelectionExists(selection.to_string()));
        }

        let ddl = format!(
            "CREATE TABLE {selection} AS \
               SELECT ROW_NUMBER() OVER (ORDER BY {id}) AS row_id, {id} \
               FROM {table} {predicate}; \
             CREATE INDEX ON {selection} (row_id);"
        );
        client
            .batch_execute(&ddl)
            .await
            .map_err(|err| map_pg_error(err, Missing::Table(table)))?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {selection}"), &[])
            .await
            .map_err(|err| map_pg_error(err, Missing::Selection(selection)))?;
        let count: i64 = row.get(0);
        debug!(selection, table, rows = count, "created selection table");
        Ok(count.max(0) as u64)
    }

    async fn attach_selection(&self, selection: &str) -> Result<u64, StoreError> {
        let selection = checked(selection, "selection")?;
        let client = self.client.lock().await;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {selection}"), &[])
            .await
            .map_err(|err| map_pg_error(err, Missing::Selection(selection)))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn read_selection(
        &self,
        selection: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RowId>, StoreError> {
        let selection = checked(selection, "selection")?;
        let id = &self.id_column;
        let lower = i64::try_from(offset).unwrap_or(i64::MAX);
        let upper = lower.saturating_add(i64::try_from(limit).unwrap_or(i64::MAX));
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT {id}::text FROM {selection} \
                     WHERE row_id > $1 AND row_id <= $2 ORDER BY row_id"
                ),
                &[&lower, &upper],
            )
            .await
            .map_err(|err| map_pg_error(err, Missing::Selection(selection)))?;
        Ok(rows.into_iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn apply_update(
        &self,
        table: &str,
        set_clause: &str,
        ids: &[RowId],
        timeout: Duration,
    ) -> Result<u64, StoreError> {
        let table = checked(table, "table")?;
        let id = &self.id_column;
        let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128);
        let mut client = self.client.lock().await;
        let cancel = client.cancel_token();
        let client: &mut Client = &mut client;

        let pending = async move {
            let tx = client
                .transaction()
                .await
                .map_err(|err| map_pg_error(err, Missing::Table(table)))?;
            tx.batch_execute(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
                .await
                .map_err(|err| map_pg_error(err, Missing::Table(table)))?;
            let updated = tx
                .execute(
                    &format!("UPDATE {table} {set_clause} WHERE {id}::text = ANY($1)"),
                    &[&ids],
                )
                .await
                .map_err(|err| map_pg_error(err, Missing::Table(table)))?;
            Ok::<_, StoreError>((tx, updated))
        };
        // Dropping an uncommitted transaction rolls it back.
        let limit = timeout.saturating_add(CLIENT_GRACE);
        let (tx, updated) = match tokio::time::timeout(limit, pending).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(table, ?timeout, "server did not enforce statement_timeout; cancelling");
                if let Err(err) = cancel.cancel_query(NoTls).await {
                    warn!(error = %err, "failed to cancel update");
                }
                return Err(StoreError::Timeout);
            }
        };
        tx.commit()
            .await
            .map_err(|err| map_pg_error(err, Missing::Table(table)))?;
        Ok(updated)
    }

    async fn drop_selection(&self, selection: &str) -> Result<(), StoreError> {
        let selection = checked(selection, "selection")?;
        let client = self.client.lock().await;
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {selection}"))
            .await
            .map_err(|err| map_pg_error(err, Missing::Selection(selection)))?;
        Ok(())
    }
}
