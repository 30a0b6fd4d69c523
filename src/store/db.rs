use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::MigrateError;
use crate::util::env::env_parse;

/// Thin handle around a Postgres pool. Each worker holds one small pool per
/// store; no distributed transactions, every statement stands alone.
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(
        label: &'static str,
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, MigrateError> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .map_err(|e| MigrateError::Configuration(format!("invalid {label} DSN: {e}")))?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // PgBouncer txn mode safe
        connect_options = connect_options.statement_cache_capacity(0);

        // Session guardrails applied to every acquired connection. Long
        // statements, stuck transactions and lock waits are all bounded so a
        // wedged worker cannot pin the store.
        let statement_timeout_secs: u64 = env_parse("DB_STATEMENT_TIMEOUT_SECS", 300u64);
        let idle_in_txn_timeout_secs: u64 = env_parse("DB_IDLE_IN_TXN_TIMEOUT_SECS", 600u64);
        let lock_timeout_secs: u64 = env_parse("DB_LOCK_TIMEOUT_SECS", 120u64);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    // Best-effort; a restricted role may not be allowed to SET.
                    let _ = sqlx::query(&format!(
                        "SET statement_timeout = '{statement_timeout_secs}s'"
                    ))
                    .execute(&mut *conn)
                    .await;
                    let _ = sqlx::query(&format!(
                        "SET idle_in_transaction_session_timeout = '{idle_in_txn_timeout_secs}s'"
                    ))
                    .execute(&mut *conn)
                    .await;
                    let _ = sqlx::query(&format!("SET lock_timeout = '{lock_timeout_secs}s'"))
                        .execute(&mut *conn)
                        .await;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await
            .map_err(MigrateError::from)?;

        info!(store = label, max_connections, "connected to db");
        Ok(Self { pool })
    }
}
