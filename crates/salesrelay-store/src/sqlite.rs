//! SQLite-backed record store.
//! Amounts are stored as decimal text so sums stay exact; timestamps as unix
//! nanoseconds, so window bounds compare at full precision.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, params};
use rust_decimal::Decimal;

use salesrelay_core::error::{RelayError, Result};
use salesrelay_core::traits::RecordStore;
use salesrelay_core::types::{ItemQuantity, LineItem, TransactionRecord};

const RECORD_COLUMNS: &str =
    "SELECT id, counterparty_name, amount, reference_code, occurred_at_ns FROM transactions";

pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open or create the record database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        Self::from_connection(conn)
    }

    /// Throwaway database, used by tests and `--dry-run` style tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RelayError::StoreUnavailable("connection lock poisoned".into()))?;
            f(&mut *guard).map_err(store_err)
        })
        .await
        .map_err(|e| RelayError::StoreUnavailable(format!("store task failed: {e}")))?
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            counterparty_name TEXT NOT NULL,
            amount TEXT NOT NULL,            -- decimal, exact
            reference_code TEXT NOT NULL,
            occurred_at_ns INTEGER NOT NULL  -- unix nanos
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_occurred_at
            ON transactions(occurred_at_ns);

        CREATE TABLE IF NOT EXISTS line_items (
            transaction_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            item_key TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            PRIMARY KEY (transaction_id, position),
            FOREIGN KEY (transaction_id) REFERENCES transactions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_line_items_item_key ON line_items(item_key);
        ",
    )
}

fn store_err(e: rusqlite::Error) -> RelayError {
    match &e {
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation => {
            RelayError::Validation(format!("record rejected by store: {e}"))
        }
        _ => RelayError::StoreUnavailable(e.to_string()),
    }
}

/// Unix nanos for a query bound, clamped to the storable range.
fn nanos_bound(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or(if at.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

fn load_records(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<TransactionRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        let amount: String = row.get(2)?;
        let amount = Decimal::from_str(&amount)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        let nanos: i64 = row.get(4)?;
        let occurred_at = DateTime::<Utc>::from_timestamp_nanos(nanos);
        Ok(TransactionRecord {
            id: row.get(0)?,
            counterparty_name: row.get(1)?,
            amount,
            reference_code: row.get(3)?,
            occurred_at,
            line_items: Vec::new(),
        })
    })?;

    let mut records = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let mut items_stmt = conn.prepare(
        "SELECT item_key, quantity FROM line_items WHERE transaction_id = ?1 ORDER BY position",
    )?;
    for record in records.iter_mut() {
        record.line_items = items_stmt
            .query_map(params![record.id], |row| {
                let quantity: i64 = row.get(1)?;
                Ok(LineItem {
                    item_key: row.get(0)?,
                    quantity: u32::try_from(quantity).unwrap_or(0),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
    }
    Ok(records)
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert(&self, record: TransactionRecord) -> Result<()> {
        record.validate()?;
        let occurred_at = record.occurred_at.timestamp_nanos_opt().ok_or_else(|| {
            RelayError::Validation(format!(
                "occurredAt {} is outside the storable range",
                record.occurred_at
            ))
        })?;
        let id = record.id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO transactions (id, counterparty_name, amount, reference_code, occurred_at_ns)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.counterparty_name,
                    record.amount.to_string(),
                    record.reference_code,
                    occurred_at,
                ],
            )?;
            for (position, item) in record.line_items.iter().enumerate() {
                tx.execute(
                    "INSERT INTO line_items (transaction_id, position, item_key, quantity)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![record.id, position as i64, item.item_key, i64::from(item.quantity)],
                )?;
            }
            tx.commit()
        })
        .await?;
        tracing::debug!("💾 Stored transaction record {id}");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let id = id.to_string();
        let mut records = self
            .with_conn(move |conn| {
                load_records(conn, &format!("{RECORD_COLUMNS} WHERE id = ?1"), &[&id as &dyn rusqlite::ToSql])
            })
            .await?;
        Ok(records.pop())
    }

    async fn list(&self) -> Result<Vec<TransactionRecord>> {
        self.with_conn(|conn| {
            load_records(conn, &format!("{RECORD_COLUMNS} ORDER BY occurred_at_ns, id"), &[])
        })
        .await
    }

    async fn records_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TransactionRecord>> {
        let (start, end) = (nanos_bound(start), nanos_bound(end));
        self.with_conn(move |conn| {
            load_records(
                conn,
                &format!(
                    "{RECORD_COLUMNS} WHERE occurred_at_ns >= ?1 AND occurred_at_ns < ?2 ORDER BY occurred_at_ns, id"
                ),
                &[&start as &dyn rusqlite::ToSql, &end],
            )
        })
        .await
    }

    async fn quantity_by_item(&self) -> Result<Vec<ItemQuantity>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT item_key, SUM(quantity) FROM line_items GROUP BY item_key ORDER BY item_key",
            )?;
            let rows = stmt.query_map([], |row| {
                let key: String = row.get(0)?;
                let total: i64 = row.get(1)?;
                Ok(ItemQuantity::new(&key, u64::try_from(total).unwrap_or(0)))
            })?;
            let totals = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(totals)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, amount: Decimal, at: DateTime<Utc>, items: &[(&str, u32)]) -> TransactionRecord {
        TransactionRecord {
            id: id.into(),
            counterparty_name: "Ahsan Amin".into(),
            amount,
            reference_code: "REF123".into(),
            occurred_at: at,
            line_items: items.iter().map(|(k, q)| LineItem::new(k, *q)).collect(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let at = DateTime::<Utc>::from_timestamp(1_760_000_000, 123_456_789).unwrap();
        let original = record(
            "inv-1",
            Decimal::new(12_345, 2),
            at,
            &[("ITEM01", 3), ("ITEM02", 1)],
        );
        store.insert(original.clone()).await.unwrap();

        let loaded = store.get("inv-1").await.unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_validation_error() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let r = record("dup", Decimal::from(1), Utc::now(), &[]);
        store.insert(r.clone()).await.unwrap();
        let err = store.insert(r).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_records_between_filters_window() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert(record("old", Decimal::from(999), now - Duration::hours(30), &[]))
            .await
            .unwrap();
        store
            .insert(record("recent", Decimal::from(100), now - Duration::hours(1), &[]))
            .await
            .unwrap();

        let found = store
            .records_between(now - Duration::hours(24), now)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "recent");
    }

    #[tokio::test]
    async fn test_window_bounds_are_sub_millisecond_exact() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let start = DateTime::<Utc>::from_timestamp(1_760_000_000, 700_000).unwrap();
        let end = start + Duration::hours(24);
        let before_start = start - Duration::microseconds(500);
        let just_before_end = end - Duration::nanoseconds(1);

        for (id, at) in [
            ("before-start", before_start),
            ("at-start", start),
            ("before-end", just_before_end),
            ("at-end", end),
        ] {
            store
                .insert(record(id, Decimal::from(1), at, &[]))
                .await
                .unwrap();
        }

        let found = store.records_between(start, end).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["at-start", "before-end"]);
        assert_eq!(found[1].occurred_at, just_before_end);
    }

    #[tokio::test]
    async fn test_quantity_by_item_groups_across_records() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .insert(record("a", Decimal::from(1), now, &[("A", 3), ("B", 1)]))
            .await
            .unwrap();
        store
            .insert(record("b", Decimal::from(1), now, &[("A", 3)]))
            .await
            .unwrap();

        let totals = store.quantity_by_item().await.unwrap();
        assert_eq!(
            totals,
            vec![ItemQuantity::new("A", 6), ItemQuantity::new("B", 1)]
        );
    }

    #[tokio::test]
    async fn test_empty_store_queries() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let now = Utc::now();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.records_between(now - Duration::hours(24), now).await.unwrap().is_empty());
        assert!(store.quantity_by_item().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = std::env::temp_dir().join("salesrelay-test-sqlite");
        let path = dir.join("records.db");
        std::fs::remove_file(&path).ok();
        {
            let store = SqliteRecordStore::open(&path).unwrap();
            store
                .insert(record("disk", Decimal::from(5), Utc::now(), &[("X", 2)]))
                .await
                .unwrap();
        }
        let reopened = SqliteRecordStore::open(&path).unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
