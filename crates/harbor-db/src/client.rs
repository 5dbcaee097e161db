//! # Local Store Client
//!
//! The caller side of the local store boundary. Every call is a message to
//! the [`LocalHost`](crate::host::LocalHost); nothing here touches SQLite
//! directly.
//!
//! ## Availability
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Desktop context                  Browser context                      │
//! │  ───────────────                  ───────────────                      │
//! │  LocalStoreClient::connected()    LocalStoreClient::unavailable()      │
//! │       │                                │                                │
//! │       ▼                                ▼                                │
//! │  is_available() == true           is_available() == false              │
//! │  calls reach the host             calls fail fast: DbError::Unavailable│
//! │                                                                         │
//! │  A host that stopped, or never answers, is reported as                 │
//! │  Unavailable / Timeout rather than hanging the caller.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transactions
//! [`LocalStoreClient::transaction`] issues BEGIN/COMMIT as ordinary requests
//! on the host's single connection. Requests from other tasks issued while
//! the closure runs land inside the same transaction. Callers that need an
//! isolated multi-statement write use [`LocalStoreClient::batch`], which the
//! host executes without interleaving.

use std::future::Future;
use std::time::Duration;

use harbor_core::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::error::{DbError, DbResult};
use crate::host::{LocalRequest, DEFAULT_REQUEST_TIMEOUT};
use crate::value::is_valid_identifier;

// =============================================================================
// Statement / Result Types
// =============================================================================

/// Parameterized statement text plus positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Inside a batch: fail (and roll back) if no row was changed.
    #[serde(default)]
    pub expect_changes: bool,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Statement {
            sql: sql.into(),
            params,
            expect_changes: false,
        }
    }

    /// Requires the statement to change at least one row.
    pub fn expect_changes(mut self) -> Self {
        self.expect_changes = true;
        self
    }

    /// `INSERT INTO table (cols...) VALUES (?...)`
    pub fn insert(table: &str, record: &Record) -> DbResult<Self> {
        check_identifier(table)?;
        if record.is_empty() {
            return Ok(Statement::new(format!("INSERT INTO {table} DEFAULT VALUES"), vec![]));
        }

        let (columns, params) = split_record(record)?;
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();

        Ok(Statement::new(
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            params,
        ))
    }

    /// `INSERT ... ON CONFLICT(key) DO UPDATE` for every non-key column.
    pub fn upsert(table: &str, key_column: &str, record: &Record) -> DbResult<Self> {
        check_identifier(key_column)?;
        let mut statement = Statement::insert(table, record)?;

        let updates: Vec<String> = record
            .keys()
            .filter(|c| c.as_str() != key_column)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        statement.sql = if updates.is_empty() {
            format!("{} ON CONFLICT({key_column}) DO NOTHING", statement.sql)
        } else {
            format!(
                "{} ON CONFLICT({key_column}) DO UPDATE SET {}",
                statement.sql,
                updates.join(", ")
            )
        };
        Ok(statement)
    }

    /// `UPDATE table SET ... WHERE key = ?`
    ///
    /// An empty patch still matches the row, so the change count tells
    /// whether the row exists.
    pub fn update(table: &str, key_column: &str, id: &str, patch: &Record) -> DbResult<Self> {
        check_identifier(table)?;
        check_identifier(key_column)?;

        let patch: Record = patch
            .iter()
            .filter(|(column, _)| column.as_str() != key_column)
            .map(|(c, v)| (c.clone(), v.clone()))
            .collect();

        let (columns, mut params) = split_record(&patch)?;
        let mut assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 1))
            .collect();
        if assignments.is_empty() {
            assignments.push(format!("{key_column} = {key_column}"));
        }

        params.push(Value::String(id.to_string()));
        Ok(Statement::new(
            format!(
                "UPDATE {table} SET {} WHERE {key_column} = ?{}",
                assignments.join(", "),
                params.len()
            ),
            params,
        ))
    }

    /// `DELETE FROM table WHERE key = ?`
    pub fn delete(table: &str, key_column: &str, id: &str) -> DbResult<Self> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        Ok(Statement::new(
            format!("DELETE FROM {table} WHERE {key_column} = ?1"),
            vec![Value::String(id.to_string())],
        ))
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Rows changed.
    pub changes: u64,
    /// Rowid of the last inserted row.
    pub inserted_id: i64,
}

fn check_identifier(name: &str) -> DbResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

fn split_record(record: &Record) -> DbResult<(Vec<&str>, Vec<Value>)> {
    let mut columns = Vec::with_capacity(record.len());
    let mut params = Vec::with_capacity(record.len());
    for (column, value) in record {
        check_identifier(column)?;
        columns.push(column.as_str());
        params.push(value.clone());
    }
    Ok((columns, params))
}

// =============================================================================
// Client
// =============================================================================

/// Cloneable handle for issuing statements to the local store.
#[derive(Debug, Clone)]
pub struct LocalStoreClient {
    channel: Option<mpsc::Sender<LocalRequest>>,
    request_timeout: Duration,
}

impl LocalStoreClient {
    /// A client connected to a running host.
    pub fn connected(channel: mpsc::Sender<LocalRequest>, request_timeout: Duration) -> Self {
        LocalStoreClient {
            channel: Some(channel),
            request_timeout,
        }
    }

    /// A client for a context with no local store.
    pub fn unavailable() -> Self {
        LocalStoreClient {
            channel: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Returns true if a host is reachable.
    pub fn is_available(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| !c.is_closed())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<DbResult<T>>) -> LocalRequest,
    ) -> DbResult<T> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| DbError::Unavailable("no local store in this context".into()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        channel
            .send(build(reply_tx))
            .await
            .map_err(|_| DbError::Unavailable("local store host stopped".into()))?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DbError::Unavailable(
                "local store host dropped the request".into(),
            )),
            Err(_) => Err(DbError::Timeout(self.request_timeout)),
        }
    }

    // -------------------------------------------------------------------------
    // Primitives
    // -------------------------------------------------------------------------

    /// Runs a statement and returns its rows.
    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> DbResult<Vec<Record>> {
        let sql = sql.into();
        trace!(sql = %sql, "query");
        self.request(|reply| LocalRequest::Query { sql, params, reply })
            .await
    }

    /// Runs a statement and returns its change count.
    pub async fn run(&self, sql: impl Into<String>, params: Vec<Value>) -> DbResult<RunResult> {
        let sql = sql.into();
        trace!(sql = %sql, "run");
        self.request(|reply| LocalRequest::Run { sql, params, reply })
            .await
    }

    /// Runs several statements atomically.
    pub async fn batch(&self, statements: Vec<Statement>) -> DbResult<Vec<RunResult>> {
        self.request(|reply| LocalRequest::Batch { statements, reply })
            .await
    }

    // -------------------------------------------------------------------------
    // Convenience Wrappers
    // -------------------------------------------------------------------------

    pub async fn insert(&self, table: &str, record: &Record) -> DbResult<RunResult> {
        let Statement { sql, params, .. } = Statement::insert(table, record)?;
        self.run(sql, params).await
    }

    /// Returns the number of rows changed (0 when the row does not exist).
    pub async fn update(
        &self,
        table: &str,
        key_column: &str,
        id: &str,
        patch: &Record,
    ) -> DbResult<u64> {
        let Statement { sql, params, .. } = Statement::update(table, key_column, id, patch)?;
        Ok(self.run(sql, params).await?.changes)
    }

    pub async fn upsert(&self, table: &str, key_column: &str, record: &Record) -> DbResult<RunResult> {
        let Statement { sql, params, .. } = Statement::upsert(table, key_column, record)?;
        self.run(sql, params).await
    }

    /// Returns the number of rows deleted.
    pub async fn delete(&self, table: &str, key_column: &str, id: &str) -> DbResult<u64> {
        let Statement { sql, params, .. } = Statement::delete(table, key_column, id)?;
        Ok(self.run(sql, params).await?.changes)
    }

    pub async fn get_by_id(
        &self,
        table: &str,
        key_column: &str,
        id: &str,
    ) -> DbResult<Option<Record>> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        let rows = self
            .query(
                format!("SELECT * FROM {table} WHERE {key_column} = ?1 LIMIT 1"),
                vec![Value::String(id.to_string())],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn get_all(&self, table: &str) -> DbResult<Vec<Record>> {
        check_identifier(table)?;
        self.query(format!("SELECT * FROM {table}"), vec![]).await
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Runs `f` between BEGIN and COMMIT; rolls back and returns the error if
    /// `f` fails.
    pub async fn transaction<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(LocalStoreClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        self.run("BEGIN", vec![]).await?;

        let outcome = f(self.clone()).await;
        let finished = match outcome {
            Ok(value) => self.run("COMMIT", vec![]).await.map(|_| value),
            Err(e) => {
                self.rollback().await;
                return Err(e);
            }
        };

        match finished {
            Ok(value) => Ok(value),
            Err(commit_error) => {
                self.rollback().await;
                Err(commit_error.into())
            }
        }
    }

    async fn rollback(&self) {
        if let Err(e) = self.run("ROLLBACK", vec![]).await {
            warn!(error = %e, "Rollback failed");
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn client() -> LocalStoreClient {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let (_detached, client) = LocalHost::spawn(&db).await.unwrap();
        client
    }

    #[test]
    fn test_statement_builders() {
        let row = record(json!({ "id": "p-1", "name": "Cola" }));

        let insert = Statement::insert("products", &row).unwrap();
        assert_eq!(insert.sql, "INSERT INTO products (id, name) VALUES (?1, ?2)");
        assert_eq!(insert.params, vec![json!("p-1"), json!("Cola")]);

        let update = Statement::update("products", "id", "p-1", &row).unwrap();
        assert_eq!(update.sql, "UPDATE products SET name = ?1 WHERE id = ?2");

        let empty = Statement::update("products", "id", "p-1", &Record::new()).unwrap();
        assert_eq!(empty.sql, "UPDATE products SET id = id WHERE id = ?1");

        let delete = Statement::delete("settings", "key", "currency").unwrap();
        assert_eq!(delete.sql, "DELETE FROM settings WHERE key = ?1");
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        let row = record(json!({ "name; --": "x" }));
        assert!(matches!(
            Statement::insert("products", &row),
            Err(DbError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            Statement::delete("products p", "id", "1"),
            Err(DbError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_client_fails_fast() {
        let client = LocalStoreClient::unavailable();
        assert!(!client.is_available());

        let err = client.query("SELECT 1", vec![]).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_crud_wrappers() {
        let client = client().await;
        let row = record(json!({ "id": "c-1", "name": "Drinks", "is_active": 1 }));

        client.insert("categories", &row).await.unwrap();
        let fetched = client.get_by_id("categories", "id", "c-1").await.unwrap().unwrap();
        assert_eq!(fetched["name"], json!("Drinks"));

        let patch = record(json!({ "name": "Beverages" }));
        assert_eq!(client.update("categories", "id", "c-1", &patch).await.unwrap(), 1);
        assert_eq!(client.update("categories", "id", "nope", &patch).await.unwrap(), 0);

        let upsert = record(json!({ "id": "c-1", "name": "Soft drinks" }));
        client.upsert("categories", "id", &upsert).await.unwrap();
        assert_eq!(client.get_all("categories").await.unwrap().len(), 1);

        assert_eq!(client.delete("categories", "id", "c-1").await.unwrap(), 1);
        assert!(client.get_by_id("categories", "id", "c-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back() {
        let client = client().await;

        let result: DbResult<()> = client
            .transaction(|tx| async move {
                tx.insert("settings", &record(json!({ "key": "a", "value": "1" })))
                    .await?;
                Err(DbError::QueryFailed("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(client.get_all("settings").await.unwrap().is_empty());

        client
            .transaction(|tx| async move {
                tx.insert("settings", &record(json!({ "key": "b", "value": "2" })))
                    .await?;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap();
        assert_eq!(client.get_all("settings").await.unwrap().len(), 1);
    }
}
