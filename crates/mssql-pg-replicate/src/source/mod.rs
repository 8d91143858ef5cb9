//! MSSQL source database access.
//!
//! The source is strictly read-only: the reader opens a forward-only cursor
//! per table and streams raw rows through a bounded channel. Numeric and
//! GUID columns are cast to text server-side so the raw values arrive in
//! the shape the coercion policy expects.

use crate::catalog::{SourceType, TableDescriptor};
use crate::config::SourceConfig;
use crate::error::{ReplicateError, Result};
use crate::value::{RawValue, SourceRow};
use async_trait::async_trait;
use bb8::Pool;
use chrono::NaiveDateTime;
use futures::TryStreamExt;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, QueryItem, Row};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

/// Buffered rows between the reader task and the pipeline.
const CURSOR_BUFFER: usize = 1024;

/// A relational read capability over the source database.
///
/// `open_cursor` yields a lazy, finite, non-restartable sequence of raw
/// rows starting at `resume_offset` (in rows), in the table's replication
/// order. One pass only.
pub trait SourceReader: Send + Sync {
    fn open_cursor(
        &self,
        table: &TableDescriptor,
        resume_offset: u64,
    ) -> mpsc::Receiver<Result<SourceRow>>;
}

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        match self.config.encrypt.to_lowercase().as_str() {
            "false" | "no" | "0" | "disable" => {
                config.encryption(EncryptionLevel::NotSupported);
            }
            _ => {
                if self.config.trust_server_cert {
                    config.trust_cert();
                }
                config.encryption(EncryptionLevel::Required);
            }
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// MSSQL source reader with connection pooling.
pub struct MssqlReader {
    pool: Pool<TiberiusConnectionManager>,
    schema: String,
}

impl MssqlReader {
    /// Create a new MSSQL reader with the given pool size.
    pub async fn new(config: SourceConfig, max_connections: u32) -> Result<Self> {
        let schema = config.schema.clone();
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_connections)
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| ReplicateError::pool(e.to_string(), "creating MSSQL pool"))?;

        // Test connection
        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| ReplicateError::pool(e.to_string(), "connecting to MSSQL"))?;
            conn.simple_query("SELECT 1")
                .await
                .map_err(ReplicateError::Source)?
                .into_row()
                .await
                .map_err(ReplicateError::Source)?;
        }

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_connections
        );

        Ok(Self { pool, schema })
    }
}

impl SourceReader for MssqlReader {
    fn open_cursor(
        &self,
        table: &TableDescriptor,
        resume_offset: u64,
    ) -> mpsc::Receiver<Result<SourceRow>> {
        let (tx, rx) = mpsc::channel(CURSOR_BUFFER);
        let pool = self.pool.clone();
        let table = table.clone();
        let query = build_cursor_query(&self.schema, &table, resume_offset);

        tokio::spawn(async move {
            debug!("{}: opening cursor at offset {}", table.name, resume_offset);

            let mut conn = match pool.get().await {
                Ok(conn) => conn,
                Err(e) => {
                    let err = ReplicateError::pool(e.to_string(), "opening source cursor");
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            };

            let mut stream = match conn.simple_query(query.as_str()).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(ReplicateError::Source(e))).await;
                    return;
                }
            };

            loop {
                match stream.try_next().await {
                    Ok(Some(QueryItem::Row(row))) => {
                        let converted = row_to_source_row(&table, &row);
                        if tx.send(converted).await.is_err() {
                            // Pipeline hung up; stop reading.
                            return;
                        }
                    }
                    Ok(Some(QueryItem::Metadata(_))) => {}
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(ReplicateError::Source(e))).await;
                        return;
                    }
                }
            }

            debug!("{}: cursor exhausted", table.name);
        });

        rx
    }
}

/// Build the streaming cursor query for one table.
///
/// Replication order is the primary key, preceded by the hierarchy depth
/// column for self-referential tables so parents arrive before children.
/// Numeric and GUID columns are cast to NVARCHAR so they reach the policy
/// as text.
fn build_cursor_query(schema: &str, table: &TableDescriptor, resume_offset: u64) -> String {
    let select_list = table
        .columns
        .iter()
        .map(|col| {
            let quoted = quote_mssql_ident(&col.name);
            match col.source_type {
                SourceType::Numeric { .. } => {
                    format!("CAST({} AS NVARCHAR(50)) AS {}", quoted, quoted)
                }
                SourceType::Uuid => format!("CAST({} AS NVARCHAR(36)) AS {}", quoted, quoted),
                _ => quoted,
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut order_cols: Vec<&str> = Vec::new();
    if let Some(depth) = &table.depth_column {
        order_cols.push(depth);
    }
    for pk in &table.primary_key {
        if Some(pk) != table.depth_column.as_ref() {
            order_cols.push(pk);
        }
    }
    let order_by = order_cols
        .iter()
        .map(|c| quote_mssql_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT {} FROM {} ORDER BY {} OFFSET {} ROWS",
        select_list,
        qualify_mssql_table(schema, &table.name),
        order_by,
        resume_offset
    )
}

/// Convert one driver row into a raw source row, column by column.
fn row_to_source_row(table: &TableDescriptor, row: &Row) -> Result<SourceRow> {
    let mut values = Vec::with_capacity(table.columns.len());

    for (idx, col) in table.columns.iter().enumerate() {
        let value = match col.source_type {
            SourceType::SmallInt => row
                .try_get::<i16, _>(idx)
                .map_err(ReplicateError::Source)?
                .map(|v| RawValue::Int(v as i64)),
            SourceType::Int => row
                .try_get::<i32, _>(idx)
                .map_err(ReplicateError::Source)?
                .map(|v| RawValue::Int(v as i64)),
            SourceType::Bool => row
                .try_get::<bool, _>(idx)
                .map_err(ReplicateError::Source)?
                .map(RawValue::Bool),
            SourceType::Timestamp => row
                .try_get::<NaiveDateTime, _>(idx)
                .map_err(ReplicateError::Source)?
                .map(RawValue::DateTime),
            SourceType::Numeric { .. }
            | SourceType::Uuid
            | SourceType::VarText
            | SourceType::FixedText => row
                .try_get::<&str, _>(idx)
                .map_err(ReplicateError::Source)?
                .map(|v| RawValue::Text(v.to_string())),
            SourceType::Binary => row
                .try_get::<&[u8], _>(idx)
                .map_err(ReplicateError::Source)?
                .map(|v| RawValue::Bytes(v.to_vec())),
        };

        values.push(value.unwrap_or(RawValue::Null));
    }

    Ok(SourceRow::new(values))
}

/// Quote a SQL Server identifier, escaping closing brackets.
///
/// Identifiers cannot be bound as statement parameters, so they are
/// bracket-quoted with embedded closing brackets doubled.
fn quote_mssql_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Qualify a SQL Server table name with schema and proper quoting.
fn qualify_mssql_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_mssql_ident(schema), quote_mssql_ident(table))
}
