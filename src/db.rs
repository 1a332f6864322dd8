use std::time::Duration;

use sqlx::{
    sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::{config::Config, error::Error};

pub mod message;

/// How long a connection waits on a write lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the message database described by `config` and applies migrations.
pub async fn connect(config: &Config) -> Result<SqlitePool, Error> {
    let (opts, max_connections) = if let Some(path) = config.db_path() {
        (
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            config.db_max_connections,
        )
    } else {
        // Every in-memory connection is its own database.
        (SqliteConnectOptions::new().in_memory(true), 1)
    };

    let opts = opts
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

    let mut pool_opts = SqlitePoolOptions::new().max_connections(max_connections);
    if config.db_path().is_none() {
        // Dropping the only connection would drop the database with it.
        pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_opts.connect_with(opts).await?;

    migrate(&pool).await?;

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    migrate(&pool).await.unwrap();

    pool
}
