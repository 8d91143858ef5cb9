//! PostgreSQL destination database access.
//!
//! The destination is written exclusively through parameterized
//! insert-or-replace statements inside explicit transactions. Each table
//! worker owns one dedicated connection for the lifetime of its table, so
//! transaction boundaries never interleave.

use crate::catalog::TableDescriptor;
use crate::config::TargetConfig;
use crate::error::{ReplicateError, Result};
use crate::value::PgValue;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{debug, info};

/// Bind-parameter budget per statement, kept under PostgreSQL's 65535
/// protocol limit. One logical batch may span several statements inside the
/// same transaction.
const MAX_BIND_PARAMS: usize = 60_000;

/// A relational write capability over one destination connection.
///
/// Stateful: `begin`/`commit`/`rollback` frame the transaction the
/// coordinator manages. Implementations do not track transaction state
/// themselves; the coordinator enforces the state machine.
#[async_trait]
pub trait DestinationWriter: Send {
    async fn begin(&mut self) -> Result<()>;

    /// Upsert rows by primary key. Reapplying committed rows is a no-op.
    async fn upsert_rows(
        &mut self,
        table: &TableDescriptor,
        rows: &[Vec<PgValue>],
    ) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

/// Hands out dedicated writer connections, one per table worker.
#[async_trait]
pub trait DestinationPool: Send + Sync {
    async fn writer(&self) -> Result<Box<dyn DestinationWriter>>;
}

/// PostgreSQL destination pool.
pub struct PgPool {
    pool: Pool,
    schema: String,
}

impl PgPool {
    /// Create a new PostgreSQL destination pool.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| ReplicateError::pool(e.to_string(), "creating PostgreSQL pool"))?;

        // Test connection
        let client = pool
            .get()
            .await
            .map_err(|e| ReplicateError::pool(e.to_string(), "connecting to PostgreSQL"))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(ReplicateError::Target)?;

        info!(
            "Connected to PostgreSQL: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }
}

#[async_trait]
impl DestinationPool for PgPool {
    async fn writer(&self) -> Result<Box<dyn DestinationWriter>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ReplicateError::pool(e.to_string(), "acquiring writer connection"))?;
        Ok(Box::new(PgWriter {
            client,
            schema: self.schema.clone(),
        }))
    }
}

/// One destination connection with explicit transaction framing.
pub struct PgWriter {
    client: Object,
    schema: String,
}

#[async_trait]
impl DestinationWriter for PgWriter {
    async fn begin(&mut self) -> Result<()> {
        self.client.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn upsert_rows(
        &mut self,
        table: &TableDescriptor,
        rows: &[Vec<PgValue>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let column_count = table.columns.len();
        let rows_per_statement = max_rows_per_statement(column_count);
        let mut total = 0u64;

        for chunk in rows.chunks(rows_per_statement) {
            let sql = build_upsert_sql(&self.schema, table, chunk.len());
            let statement = self.client.prepare_cached(&sql).await?;

            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter())
                .map(|value| value as &(dyn ToSql + Sync))
                .collect();

            total += self.client.execute(&statement, &params).await?;
            debug!("{}: upserted {} rows", table.name, chunk.len());
        }

        Ok(total)
    }

    async fn commit(&mut self) -> Result<()> {
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

/// Rows one statement can carry without exceeding the parameter budget.
fn max_rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

/// Build a parameterized multi-row upsert statement.
///
/// `INSERT ... VALUES ($1,..),(..) ON CONFLICT (pk) DO UPDATE SET ...`;
/// tables whose every column is part of the key fall back to `DO NOTHING`.
fn build_upsert_sql(schema: &str, table: &TableDescriptor, row_count: usize) -> String {
    let columns = &table.columns;
    let column_list = columns
        .iter()
        .map(|c| quote_pg_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut placeholders = Vec::with_capacity(row_count);
    let mut param = 1;
    for _ in 0..row_count {
        let row = (0..columns.len())
            .map(|_| {
                let p = format!("${}", param);
                param += 1;
                p
            })
            .collect::<Vec<_>>()
            .join(", ");
        placeholders.push(format!("({})", row));
    }

    let conflict_cols = table
        .primary_key
        .iter()
        .map(|c| quote_pg_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let updates = columns
        .iter()
        .filter(|c| !table.primary_key.contains(&c.name))
        .map(|c| {
            let quoted = quote_pg_ident(&c.name);
            format!("{} = EXCLUDED.{}", quoted, quoted)
        })
        .collect::<Vec<_>>();

    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        qualify_pg_table(schema, &table.name),
        column_list,
        placeholders.join(", "),
        conflict_cols,
        conflict_action
    )
}

/// Quote a PostgreSQL identifier.
fn quote_pg_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualify a PostgreSQL table name with schema and proper quoting.
fn qualify_pg_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_pg_ident(schema), quote_pg_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDescriptor, SourceType};

    fn table() -> TableDescriptor {
        TableDescriptor {
            name: "accounts".into(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".into(),
                    source_type: SourceType::Int,
                    nullable: false,
                    max_length: None,
                },
                ColumnDescriptor {
                    name: "name".into(),
                    source_type: SourceType::VarText,
                    nullable: false,
                    max_length: Some(50),
                },
            ],
            primary_key: vec!["id".into()],
            foreign_keys: vec![],
            depth_column: None,
        }
    }

    #[test]
    fn test_upsert_sql_shape() {
        let sql = build_upsert_sql("public", &table(), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"accounts\" (\"id\", \"name\") \
             VALUES ($1, $2), ($3, $4) \
             ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""
        );
    }

    #[test]
    fn test_upsert_sql_all_key_columns_do_nothing() {
        let mut t = table();
        t.primary_key = vec!["id".into(), "name".into()];
        let sql = build_upsert_sql("public", &t, 1);
        assert!(sql.ends_with("ON CONFLICT (\"id\", \"name\") DO NOTHING"));
    }

    #[test]
    fn test_max_rows_per_statement() {
        assert_eq!(max_rows_per_statement(2), 30_000);
        assert_eq!(max_rows_per_statement(100_000), 1);
        assert_eq!(max_rows_per_statement(0), MAX_BIND_PARAMS);
    }

    #[test]
    fn test_pg_ident_quoting() {
        assert_eq!(quote_pg_ident("plain"), "\"plain\"");
        assert_eq!(quote_pg_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualify_pg_table("public", "t"), "\"public\".\"t\"");
    }
}
