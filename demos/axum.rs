//! An axum service with an N+1 query, backed by a mock database.
//!
//! Run with: APP_DEBUG=true cargo run --example axum
//! Then: curl -H 'Accept: application/json' http://127.0.0.1:3000/authors

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, middleware, routing::get, Json, Router};
use sea_orm::{ConnectionTrait, DbBackend, DbErr, MockDatabase, Statement, Value};
use sea_orm_debugger::prelude::*;
use serde_json::{json, Value as JsonValue};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn authors(State(db): State<Arc<DebugConnection>>) -> Json<JsonValue> {
    match load_authors(&db).await {
        Ok(authors) => Json(json!({ "authors": authors })),
        Err(e) => Json(json!({ "error": e.to_string() })),
    }
}

async fn load_authors(db: &DebugConnection) -> Result<Vec<JsonValue>, DbErr> {
    let rows = db
        .query_all(Statement::from_string(
            DbBackend::Postgres,
            "SELECT id, name FROM authors",
        ))
        .await?;

    let mut authors = Vec::new();
    for row in rows {
        let id: i32 = row.try_get("", "id")?;
        let name: String = row.try_get("", "name")?;
        // one query per author
        let books = db
            .query_all(Statement::from_sql_and_values(
                DbBackend::Postgres,
                "SELECT title FROM books WHERE author_id = $1",
                [id.into()],
            ))
            .await?;
        authors.push(json!({ "id": id, "name": name, "books": books.len() }));
    }
    Ok(authors)
}

fn mock_database() -> DebugConnection {
    let author = |id: i32, name: &str| {
        BTreeMap::from([
            ("id", Value::Int(Some(id))),
            ("name", Value::String(Some(Box::new(name.to_string())))),
        ])
    };
    let book = |title: &str| BTreeMap::from([("title", Value::String(Some(Box::new(title.to_string()))))]);

    // enough results for a handful of requests
    let mut mock = MockDatabase::new(DbBackend::Postgres);
    for _ in 0..16 {
        mock = mock
            .append_query_results([vec![author(1, "Le Guin"), author(2, "Banks")]])
            .append_query_results([vec![book("The Dispossessed")], vec![book("Excession")]]);
    }
    mock.into_connection().with_debugger()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sea_orm_debugger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let debugger = ApiDebugger::new(DebuggerConfig::development());
    if !debugger.is_active() {
        tracing::info!("APP_DEBUG is not set; responses will not be decorated");
    }

    let app = Router::new()
        .route("/authors", get(authors))
        .layer(middleware::from_fn_with_state(debugger, debugger_middleware))
        .with_state(Arc::new(mock_database()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!("Listening on http://127.0.0.1:3000");
    axum::serve(listener, app).await?;

    Ok(())
}
