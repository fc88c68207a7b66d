use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use chatsync_core::config::PostgresConfig;

use crate::error::StoreError;

/// Connect to PostgreSQL and apply the workspace migrations.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.connection_string()?)
        .await?;
    info!("PostgreSQL connected: {}", config.host);

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}
