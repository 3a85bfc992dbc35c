//! Capturing database connection wrapper.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, StreamTrait, TransactionError,
    TransactionTrait, Value,
};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::analyzer::round_ms;
use crate::event::{self, QueryEvent};

/// A wrapper around a SeaORM connection that reports every statement to the
/// query listener of the current request.
///
/// `DebugConnection` implements `ConnectionTrait`, so entities and query
/// builders accept it anywhere they accept the inner connection. Outside a
/// capture scope it adds nothing beyond an `Instant` read per statement.
///
/// Statements issued through a plain `DatabaseTransaction` bypass the
/// wrapper; use [`DebugConnection::begin_captured`] to keep capturing inside
/// a transaction.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::Database;
/// use sea_orm_debugger::DebugConnection;
///
/// let db = DebugConnection::from(Database::connect("postgres://localhost/mydb").await?);
///
/// // Captured when run inside a request handled by `debugger_middleware`
/// let users = Users::find().all(&db).await?;
/// ```
#[derive(Debug, Clone)]
pub struct DebugConnection<C = DatabaseConnection> {
    inner: C,
}

impl<C> DebugConnection<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    /// Get a reference to the wrapped connection.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Consume the wrapper and return the wrapped connection.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl DebugConnection<DatabaseConnection> {
    /// Begin a transaction whose statements are captured as well.
    pub async fn begin_captured(&self) -> Result<DebugConnection<DatabaseTransaction>, DbErr> {
        self.inner.begin().await.map(DebugConnection::new)
    }
}

impl DebugConnection<DatabaseTransaction> {
    pub async fn commit(self) -> Result<(), DbErr> {
        self.inner.commit().await
    }

    pub async fn rollback(self) -> Result<(), DbErr> {
        self.inner.rollback().await
    }
}

impl From<DatabaseConnection> for DebugConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::new(connection)
    }
}

impl<C> AsRef<C> for DebugConnection<C> {
    fn as_ref(&self) -> &C {
        &self.inner
    }
}

/// A statement on its way to the listener.
struct Pending {
    sql: String,
    bindings: Vec<JsonValue>,
    start: Instant,
}

impl Pending {
    /// Copies the statement only when a listener is subscribed.
    fn start(sql: &str, values: Option<&[Value]>) -> Option<Self> {
        if !event::is_listening() {
            return None;
        }
        Some(Self {
            sql: sql.to_string(),
            bindings: values
                .map(|values| values.iter().map(value_to_json).collect())
                .unwrap_or_default(),
            start: Instant::now(),
        })
    }

    fn from_statement(stmt: &Statement) -> Option<Self> {
        Self::start(&stmt.sql, stmt.values.as_ref().map(|v| v.0.as_slice()))
    }

    /// Failed statements are not reported.
    fn finish<T>(pending: Option<Self>, result: &Result<T, DbErr>) {
        let Some(pending) = pending else {
            return;
        };
        let elapsed_ms = round_ms(pending.start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(_) => event::dispatch(move || QueryEvent {
                sql: pending.sql,
                bindings: pending.bindings,
                elapsed_ms,
            }),
            Err(e) => tracing::debug!(
                error = %e,
                elapsed_ms,
                sql = %pending.sql,
                "Failed query not captured"
            ),
        }
    }
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Bool(v) => to_json(v),
        Value::TinyInt(v) => to_json(v),
        Value::SmallInt(v) => to_json(v),
        Value::Int(v) => to_json(v),
        Value::BigInt(v) => to_json(v),
        Value::TinyUnsigned(v) => to_json(v),
        Value::SmallUnsigned(v) => to_json(v),
        Value::Unsigned(v) => to_json(v),
        Value::BigUnsigned(v) => to_json(v),
        Value::Float(v) => to_json(v),
        Value::Double(v) => to_json(v),
        Value::String(v) => to_json(v),
        Value::Char(v) => to_json(v),
        Value::Bytes(v) => to_json(v),
        // date/time, decimal, uuid, json and array values behind sea-orm features
        #[allow(unreachable_patterns)]
        other => JsonValue::String(format!("{other:?}")),
    }
}

fn to_json<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

#[async_trait]
impl<C> ConnectionTrait for DebugConnection<C>
where
    C: ConnectionTrait + Send,
{
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let pending = Pending::from_statement(&stmt);
        let result = self.inner.execute(stmt).await;
        Pending::finish(pending, &result);
        result
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let pending = Pending::start(sql, None);
        let result = self.inner.execute_unprepared(sql).await;
        Pending::finish(pending, &result);
        result
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let pending = Pending::from_statement(&stmt);
        let result = self.inner.query_one(stmt).await;
        Pending::finish(pending, &result);
        result
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let pending = Pending::from_statement(&stmt);
        let result = self.inner.query_all(stmt).await;
        Pending::finish(pending, &result);
        result
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl StreamTrait for DebugConnection<DatabaseConnection> {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    /// The reported time covers opening the stream, not draining it.
    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        Box::pin(async move {
            let pending = Pending::from_statement(&stmt);
            let result = self.inner.stream(stmt).await;
            Pending::finish(pending, &result);
            result
        })
    }
}

#[async_trait]
impl TransactionTrait for DebugConnection<DatabaseConnection> {
    async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        self.inner.begin().await
    }

    async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        self.inner
            .begin_with_config(isolation_level, access_mode)
            .await
    }

    async fn transaction<F, T, E>(&self, callback: F) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        self.inner.transaction(callback).await
    }

    async fn transaction_with_config<F, T, E>(
        &self,
        callback: F,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        self.inner
            .transaction_with_config(callback, isolation_level, access_mode)
            .await
    }
}

/// Extension trait for easy wrapping of database connections.
pub trait DebugExt {
    /// Wrap this connection so its statements can be captured.
    fn with_debugger(self) -> DebugConnection;
}

impl DebugExt for DatabaseConnection {
    fn with_debugger(self) -> DebugConnection {
        DebugConnection::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_to_json() {
        assert_eq!(value_to_json(&Value::Int(Some(7))), json!(7));
        assert_eq!(value_to_json(&Value::Int(None)), JsonValue::Null);
        assert_eq!(value_to_json(&Value::Bool(Some(true))), json!(true));
        assert_eq!(value_to_json(&Value::Double(Some(1.5))), json!(1.5));
        assert_eq!(
            value_to_json(&Value::String(Some(Box::new("ada".to_string())))),
            json!("ada")
        );
        assert_eq!(
            value_to_json(&Value::Bytes(Some(Box::new(vec![1, 2])))),
            json!([1, 2])
        );
    }

    #[test]
    fn test_pending_requires_listener() {
        assert!(Pending::start("SELECT 1", None).is_none());
    }
}
