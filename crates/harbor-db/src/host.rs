//! # Local Store Host
//!
//! The privileged side of the local store boundary. One task owns the SQLite
//! connection and answers requests that arrive over a channel.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Local Store Boundary                             │
//! │                                                                         │
//! │  LocalStoreClient (any task)            LocalHost (one task)           │
//! │  ───────────────────────────            ──────────────────────         │
//! │                                                                         │
//! │  query(sql, params) ──► LocalRequest::Query ──► fetch_all              │
//! │                     ◄── oneshot reply ◄──────── Vec<Record>            │
//! │                                                                         │
//! │  run(sql, params)   ──► LocalRequest::Run   ──► execute                │
//! │                     ◄── oneshot reply ◄──────── RunResult              │
//! │                                                                         │
//! │  batch(statements)  ──► LocalRequest::Batch ──► BEGIN                  │
//! │                                                 execute each           │
//! │                                                 COMMIT / ROLLBACK      │
//! │                     ◄── oneshot reply ◄──────── Vec<RunResult>         │
//! │                                                                         │
//! │  Requests are served one at a time: the store is single-writer.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use harbor_core::Record;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::Sqlite;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::client::{LocalStoreClient, RunResult, Statement};
use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::value::{bind_params, row_to_record};

/// Requests waiting for the host before callers see backpressure.
const REQUEST_BUFFER: usize = 64;

/// Default time a client waits for the host to answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Wire Messages
// =============================================================================

/// A message crossing the local store boundary.
#[derive(Debug)]
pub enum LocalRequest {
    Query {
        sql: String,
        params: Vec<Value>,
        reply: oneshot::Sender<DbResult<Vec<Record>>>,
    },
    Run {
        sql: String,
        params: Vec<Value>,
        reply: oneshot::Sender<DbResult<RunResult>>,
    },
    Batch {
        statements: Vec<Statement>,
        reply: oneshot::Sender<DbResult<Vec<RunResult>>>,
    },
}

// =============================================================================
// Host
// =============================================================================

/// Owns the local database connection and serves requests.
pub struct LocalHost {
    conn: PoolConnection<Sqlite>,
    requests: mpsc::Receiver<LocalRequest>,
    shutdown_rx: mpsc::Receiver<()>,
    /// A client issued BEGIN and has not finished the transaction yet.
    in_client_transaction: bool,
}

/// Handle for stopping the host task.
///
/// Dropping the handle detaches the host; it then stops once every client
/// has been dropped.
pub struct LocalHostHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl LocalHostHandle {
    /// Stops the host and waits for it to release the connection.
    ///
    /// Clients created from this host report unavailable afterwards.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(?e, "Local host task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl LocalHost {
    /// Takes a connection from `db` and starts serving requests.
    pub async fn spawn(db: &Database) -> DbResult<(LocalHostHandle, LocalStoreClient)> {
        Self::spawn_with_timeout(db, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Like [`LocalHost::spawn`], with a custom client request timeout.
    pub async fn spawn_with_timeout(
        db: &Database,
        request_timeout: Duration,
    ) -> DbResult<(LocalHostHandle, LocalStoreClient)> {
        let conn = db.acquire().await?;
        let (request_tx, requests) = mpsc::channel(REQUEST_BUFFER);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let host = LocalHost {
            conn,
            requests,
            shutdown_rx,
            in_client_transaction: false,
        };

        let task = tokio::spawn(host.run());
        let client = LocalStoreClient::connected(request_tx, request_timeout);

        Ok((LocalHostHandle { shutdown_tx, task }, client))
    }

    async fn run(mut self) {
        info!("Local store host started");

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.handle(request).await,
                        None => {
                            debug!("All local store clients dropped");
                            break;
                        }
                    }
                }
                Some(()) = self.shutdown_rx.recv() => {
                    info!("Local store host shutting down");
                    break;
                }
            }
        }

        if self.in_client_transaction {
            warn!("Rolling back transaction left open by a client");
            let _ = sqlx::query("ROLLBACK").execute(&mut *self.conn).await;
        }

        info!("Local store host stopped");
    }

    async fn handle(&mut self, request: LocalRequest) {
        match request {
            LocalRequest::Query { sql, params, reply } => {
                trace!(sql = %sql, "Local query");
                let result = self.query(&sql, &params).await;
                let _ = reply.send(result);
            }
            LocalRequest::Run { sql, params, reply } => {
                trace!(sql = %sql, "Local run");
                let result = self.execute(&sql, &params).await;
                if result.is_ok() {
                    if let Some(open) = transaction_control(&sql) {
                        self.in_client_transaction = open;
                    }
                }
                let _ = reply.send(result);
            }
            LocalRequest::Batch { statements, reply } => {
                debug!(statements = statements.len(), "Local batch");
                let result = self.batch(&statements).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Record>> {
        let rows = bind_params(sql, params).fetch_all(&mut *self.conn).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<RunResult> {
        let result = bind_params(sql, params).execute(&mut *self.conn).await?;
        Ok(RunResult {
            changes: result.rows_affected(),
            inserted_id: result.last_insert_rowid(),
        })
    }

    /// Runs every statement in one transaction.
    ///
    /// Inside a client transaction a savepoint is used instead, so the batch
    /// commits or rolls back together with the enclosing transaction.
    async fn batch(&mut self, statements: &[Statement]) -> DbResult<Vec<RunResult>> {
        let nested = self.in_client_transaction;
        let (begin, commit) = if nested {
            ("SAVEPOINT harbor_batch", "RELEASE harbor_batch")
        } else {
            ("BEGIN IMMEDIATE", "COMMIT")
        };

        self.execute(begin, &[])
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let outcome = match self.batch_statements(statements).await {
            Ok(results) => self
                .execute(commit, &[])
                .await
                .map(|_| results)
                .map_err(|e| DbError::TransactionFailed(format!("commit: {e}"))),
            Err(e) => Err(e),
        };

        // A failed COMMIT leaves the transaction open; roll it back as well.
        match outcome {
            Ok(results) => Ok(results),
            Err(e) => {
                let rollback = if nested {
                    self.execute("ROLLBACK TO harbor_batch", &[]).await.and(
                        self.execute("RELEASE harbor_batch", &[]).await,
                    )
                } else {
                    self.execute("ROLLBACK", &[]).await
                };
                if let Err(rb) = rollback {
                    warn!(error = %rb, "Batch rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn batch_statements(&mut self, statements: &[Statement]) -> DbResult<Vec<RunResult>> {
        let mut results = Vec::with_capacity(statements.len());

        for statement in statements {
            let result = self.execute(&statement.sql, &statement.params).await?;
            if statement.expect_changes && result.changes == 0 {
                return Err(DbError::not_found(
                    "Row",
                    statement
                        .params
                        .last()
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                ));
            }
            results.push(result);
        }

        Ok(results)
    }
}

/// Detects statements that open or close a client-driven transaction.
fn transaction_control(sql: &str) -> Option<bool> {
    let head = sql.trim_start().to_ascii_uppercase();
    if head.starts_with("BEGIN") {
        Some(true)
    } else if head.starts_with("COMMIT") || head.starts_with("END") {
        Some(false)
    } else if head.starts_with("ROLLBACK") && !head.contains(" TO ") {
        Some(false)
    } else {
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
