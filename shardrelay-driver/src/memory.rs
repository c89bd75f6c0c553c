//! In-memory driver for testing and development
//!
//! Every shard name maps to one in-memory database that outlives individual
//! connections, so reconnecting sees the same data. Faults can be injected per
//! shard to exercise failure isolation.

use async_trait::async_trait;
use shardrelay_config::ConnectionParams;
use shardrelay_core::{Datum, QueryResult, Result, Row, ShardName, ShardRelayError, Statement};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{Connection, Connector};

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<Datum, Row>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct DatabaseState {
    tables: BTreeMap<String, Table>,
    snapshot: Option<BTreeMap<String, Table>>,
    log: Vec<Statement>,
}

/// Faults injected into one shard
#[derive(Debug, Clone, Default)]
struct FaultPlan {
    refuse_connections: bool,
    fail_ping: bool,
    fail_statements_containing: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryDatabase {
    state: RwLock<DatabaseState>,
    faults: RwLock<FaultPlan>,
}

/// Connector backed by in-memory databases
#[derive(Default)]
pub struct MemoryConnector {
    databases: Mutex<HashMap<ShardName, Arc<MemoryDatabase>>>,
    opens: Mutex<HashMap<ShardName, usize>>,
    open_delay: Option<Duration>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before completing every open, widening race windows in tests
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    async fn database(&self, shard: &ShardName) -> Arc<MemoryDatabase> {
        let mut databases = self.databases.lock().await;
        databases.entry(shard.clone()).or_default().clone()
    }

    /// Number of connections opened for a shard
    pub async fn opens(&self, shard: &ShardName) -> usize {
        self.opens.lock().await.get(shard).copied().unwrap_or(0)
    }

    /// Every statement executed on a shard, in order
    pub async fn statements(&self, shard: &ShardName) -> Vec<Statement> {
        let database = self.database(shard).await;
        let state = database.state.read().await;
        state.log.clone()
    }

    /// Raw statements executed on a shard, in order
    pub async fn raw_statements(&self, shard: &ShardName) -> Vec<String> {
        self.statements(shard)
            .await
            .into_iter()
            .filter_map(|statement| match statement {
                Statement::Raw(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Rows currently stored in a table
    pub async fn rows(&self, shard: &ShardName, table: &str) -> Vec<Row> {
        let database = self.database(shard).await;
        let state = database.state.read().await;
        state
            .tables
            .get(table)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_table(&self, shard: &ShardName, table: &str) -> bool {
        let database = self.database(shard).await;
        let state = database.state.read().await;
        state.tables.contains_key(table)
    }

    /// Make opening connections to a shard fail
    pub async fn refuse_connections(&self, shard: &ShardName, refuse: bool) {
        let database = self.database(shard).await;
        database.faults.write().await.refuse_connections = refuse;
    }

    /// Make pings on a shard fail
    pub async fn fail_ping(&self, shard: &ShardName, fail: bool) {
        let database = self.database(shard).await;
        database.faults.write().await.fail_ping = fail;
    }

    /// Make every statement whose text contains `needle` fail on a shard
    pub async fn fail_statements_containing(&self, shard: &ShardName, needle: &str) {
        let database = self.database(shard).await;
        database
            .faults
            .write()
            .await
            .fail_statements_containing
            .push(needle.to_string());
    }

    pub async fn clear_faults(&self, shard: &ShardName) {
        let database = self.database(shard).await;
        *database.faults.write().await = FaultPlan::default();
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, shard: &ShardName, _params: &ConnectionParams) -> Result<Box<dyn Connection>> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }

        let database = self.database(shard).await;
        if database.faults.read().await.refuse_connections {
            return Err(ShardRelayError::connection_unavailable(
                shard.clone(),
                format!("memory shard {} refused the connection", shard),
            ));
        }

        *self.opens.lock().await.entry(shard.clone()).or_insert(0) += 1;

        Ok(Box::new(MemoryConnection {
            shard: shard.clone(),
            database,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to an in-memory database
pub struct MemoryConnection {
    shard: ShardName,
    database: Arc<MemoryDatabase>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShardRelayError::driver(format!(
                "connection to shard {} is closed",
                self.shard
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        self.ensure_open()?;

        let text = statement.to_string();
        {
            let faults = self.database.faults.read().await;
            if let Some(needle) = faults
                .fail_statements_containing
                .iter()
                .find(|needle| text.contains(needle.as_str()))
            {
                return Err(ShardRelayError::driver(format!(
                    "injected failure on shard {} for statement matching '{}'",
                    self.shard, needle
                )));
            }
        }

        let mut state = self.database.state.write().await;
        state.log.push(statement.clone());
        apply(&mut state, statement)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        if self.database.faults.read().await.fail_ping {
            return Err(ShardRelayError::driver(format!(
                "memory shard {} did not answer ping",
                self.shard
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn apply(state: &mut DatabaseState, statement: &Statement) -> Result<QueryResult> {
    match statement {
        Statement::Select { table, filter } => {
            let rows = state
                .tables
                .get(table)
                .map(|table| table.rows.values().filter(|row| filter.matches(row)).cloned().collect())
                .unwrap_or_default();
            Ok(QueryResult::Rows(rows))
        }
        Statement::Insert { table, key_column, row } => {
            let table = state.tables.entry(table.clone()).or_default();
            let mut row = row.clone();

            let key = match row.get(key_column) {
                Some(key) if !key.is_null() => key.clone(),
                _ => {
                    table.next_id += 1;
                    let key = Datum::Int(table.next_id);
                    row.insert(key_column.clone(), key.clone());
                    key
                }
            };

            if table.rows.contains_key(&key) {
                return Err(ShardRelayError::driver(format!("duplicate key {}", key)));
            }
            if let Datum::Int(value) = key {
                table.next_id = table.next_id.max(value);
            }

            table.rows.insert(key.clone(), row);
            Ok(QueryResult::Inserted { key })
        }
        Statement::Update { table, key_column, key, row } => {
            let Some(table) = state.tables.get_mut(table) else {
                return Ok(QueryResult::Affected(0));
            };
            match table.rows.get_mut(key) {
                Some(existing) => {
                    *existing = row.clone();
                    existing.insert(key_column.clone(), key.clone());
                    Ok(QueryResult::Affected(1))
                }
                None => Ok(QueryResult::Affected(0)),
            }
        }
        Statement::Delete { table, key, .. } => {
            let removed = state
                .tables
                .get_mut(table)
                .and_then(|table| table.rows.remove(key))
                .is_some();
            Ok(QueryResult::Affected(u64::from(removed)))
        }
        Statement::Begin => {
            if state.snapshot.is_some() {
                return Err(ShardRelayError::driver("transaction already in progress"));
            }
            state.snapshot = Some(state.tables.clone());
            Ok(QueryResult::Ack)
        }
        Statement::Commit => match state.snapshot.take() {
            Some(_) => Ok(QueryResult::Ack),
            None => Err(ShardRelayError::driver("no transaction in progress")),
        },
        Statement::Rollback => match state.snapshot.take() {
            Some(snapshot) => {
                state.tables = snapshot;
                Ok(QueryResult::Ack)
            }
            None => Err(ShardRelayError::driver("no transaction in progress")),
        },
        Statement::Raw(text) => {
            apply_raw(state, text);
            Ok(QueryResult::Ack)
        }
    }
}

// Only table creation and removal change state; other raw text is logged.
fn apply_raw(state: &mut DatabaseState, text: &str) {
    let words: Vec<&str> = text.split_whitespace().collect();
    match words.as_slice() {
        [create, table, name, ..]
            if create.eq_ignore_ascii_case("create") && table.eq_ignore_ascii_case("table") =>
        {
            state.tables.entry(clean_identifier(name)).or_default();
        }
        [drop, table, name, ..]
            if drop.eq_ignore_ascii_case("drop") && table.eq_ignore_ascii_case("table") =>
        {
            state.tables.remove(&clean_identifier(name));
        }
        _ => {}
    }
}

fn clean_identifier(name: &str) -> String {
    name.trim_matches(|c: char| c == '"' || c == '`' || c == '(' || c == ';').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardrelay_core::Filter;

    fn insert(table: &str, id: Option<i64>, name: &str) -> Statement {
        let mut row = Row::new();
        if let Some(id) = id {
            row.insert("id".to_string(), Datum::Int(id));
        }
        row.insert("name".to_string(), Datum::from(name));
        Statement::Insert {
            table: table.to_string(),
            key_column: "id".to_string(),
            row,
        }
    }

    async fn open(connector: &MemoryConnector, shard: &str) -> Box<dyn Connection> {
        connector
            .open(&ShardName::from(shard), &ConnectionParams::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_memory_connection_basic_operations() {
        let connector = MemoryConnector::new();
        let connection = open(&connector, "alpha").await;

        let inserted = connection.execute(&insert("users", None, "ada")).await.unwrap();
        assert_eq!(inserted, QueryResult::Inserted { key: Datum::Int(1) });

        let select = Statement::Select {
            table: "users".to_string(),
            filter: Filter::eq("id", Datum::Int(1)),
        };
        let rows = connection.execute(&select).await.unwrap().into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Datum::from("ada")));

        let delete = Statement::Delete {
            table: "users".to_string(),
            key_column: "id".to_string(),
            key: Datum::Int(1),
        };
        assert_eq!(connection.execute(&delete).await.unwrap().affected(), 1);
        assert!(connection.execute(&select).await.unwrap().into_rows().is_empty());
    }

    #[tokio::test]
    async fn test_memory_shards_are_isolated() {
        let connector = MemoryConnector::new();
        let alpha = open(&connector, "alpha").await;
        let beta = open(&connector, "beta").await;

        alpha.execute(&insert("users", Some(7), "ada")).await.unwrap();

        assert_eq!(connector.rows(&ShardName::from("alpha"), "users").await.len(), 1);
        assert!(connector.rows(&ShardName::from("beta"), "users").await.is_empty());
        drop(beta);
    }

    #[tokio::test]
    async fn test_memory_duplicate_key() {
        let connector = MemoryConnector::new();
        let connection = open(&connector, "alpha").await;

        connection.execute(&insert("users", Some(3), "ada")).await.unwrap();
        let result = connection.execute(&insert("users", Some(3), "bob")).await;
        assert!(result.unwrap_err().to_string().contains("duplicate key"));
    }

    #[tokio::test]
    async fn test_memory_transaction_rollback() {
        let connector = MemoryConnector::new();
        let connection = open(&connector, "alpha").await;

        connection.execute(&Statement::Begin).await.unwrap();
        connection.execute(&Statement::raw("CREATE TABLE widgets")).await.unwrap();
        connection.execute(&insert("widgets", Some(1), "gear")).await.unwrap();
        connection.execute(&Statement::Rollback).await.unwrap();

        assert!(!connector.has_table(&ShardName::from("alpha"), "widgets").await);
        assert!(connection.execute(&Statement::Commit).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_fault_injection() {
        let connector = MemoryConnector::new();
        let shard = ShardName::from("beta");
        let connection = open(&connector, "beta").await;

        connector.fail_statements_containing(&shard, "ALTER").await;
        let result = connection.execute(&Statement::raw("ALTER TABLE users ADD age")).await;
        assert!(result.unwrap_err().to_string().contains("injected failure"));

        connector.refuse_connections(&shard, true).await;
        let refused = connector.open(&shard, &ConnectionParams::default()).await;
        assert!(matches!(
            refused.err().unwrap(),
            ShardRelayError::ConnectionUnavailable { .. }
        ));

        connector.clear_faults(&shard).await;
        connection.execute(&Statement::raw("ALTER TABLE users ADD age")).await.unwrap();
        assert_eq!(connector.opens(&shard).await, 1);
    }

    #[tokio::test]
    async fn test_memory_closed_connection() {
        let connector = MemoryConnector::new();
        let connection = open(&connector, "alpha").await;

        connection.close().await.unwrap();
        assert!(connection.ping().await.is_err());
        assert!(connection.execute(&Statement::Begin).await.is_err());
    }
}
