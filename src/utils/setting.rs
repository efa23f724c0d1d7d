// Connectivity checks run before any destructive or network action.
use anyhow::Result;
use sqlx::{Connection, PgConnection};

use crate::config::ConnectionConfig;
use crate::errors::PipelineError;

/// Opens and closes one connection to `connection.database`.
pub async fn check_db_connection(connection: &ConnectionConfig) -> Result<()> {
    let url = connection.url()?;
    match PgConnection::connect(url.as_str()).await {
        Ok(conn) => {
            let _ = conn.close().await;
            tracing::info!("Successfully connected to {}", connection.describe());
            Ok(())
        }
        Err(e) => Err(PipelineError::Connection(format!(
            "failed to connect to {}: {}",
            connection.describe(),
            e
        ))
        .into()),
    }
}
