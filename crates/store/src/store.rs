//! Store operations over positions and orders.

use crate::error::StoreError;
use crate::migrations::apply_migrations;
use execution_core::{Order, PositionState};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

/// SQLite-backed store.
///
/// Entities are serialized to JSON blobs in the `value` column with all
/// decimals as strings, so monetary values round-trip exactly. The
/// `state` column on orders is denormalized for indexed open-order
/// enumeration.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) a store file and run pending migrations.
    pub async fn open_file(path: &str) -> Result<Self, StoreError> {
        Self::connect(&format!("sqlite://{path}?mode=rwc"), 5).await
    }

    /// In-memory store for tests. Single connection: each SQLite
    /// `:memory:` connection is its own database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        let applied = apply_migrations(&store.pool).await?;
        if !applied.is_empty() {
            tracing::info!(versions = ?applied, "store migrations applied");
        }
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- positions ---

    pub async fn save_position(&self, pos: &PositionState) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.save_position(pos).await?;
        tx.commit().await
    }

    pub async fn load_position(&self, position_id: &str) -> Result<Option<PositionState>, StoreError> {
        let row = sqlx::query("SELECT value FROM positions WHERE position_id = ?")
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Ok(serde_json::from_str(&r.get::<String, _>(0))?))
            .transpose()
    }

    pub async fn list_positions(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT position_id FROM positions ORDER BY position_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
    }

    /// Every persisted position, deserialized.
    pub async fn load_all_positions(&self) -> Result<Vec<PositionState>, StoreError> {
        let rows = sqlx::query("SELECT value FROM positions ORDER BY position_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>(0))?))
            .collect()
    }

    // --- orders ---

    pub async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.save_order(order).await?;
        tx.commit().await
    }

    pub async fn load_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query("SELECT value FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Ok(serde_json::from_str(&r.get::<String, _>(0))?))
            .transpose()
    }

    pub async fn list_orders(&self, position_id: &str) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            "SELECT value FROM orders WHERE position_id = ? ORDER BY created_at, order_id",
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>(0))?))
            .collect()
    }

    /// Orders in a non-terminal state, across all positions.
    pub async fn list_open_orders(&self) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            "SELECT value FROM orders
             WHERE state NOT IN ('FILLED', 'CANCELLED', 'REJECTED')
             ORDER BY created_at, order_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>(0))?))
            .collect()
    }

    /// Begin a transaction for an atomic multi-row update.
    ///
    /// Writes made through the handle become visible only on `commit`;
    /// dropping the handle rolls everything back.
    pub async fn begin(&self) -> Result<StoreTxn, StoreError> {
        Ok(StoreTxn {
            tx: self.pool.begin().await?,
        })
    }
}

/// An open store transaction.
pub struct StoreTxn {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTxn {
    pub async fn save_position(&mut self, pos: &PositionState) -> Result<(), StoreError> {
        let value = serde_json::to_string(pos)?;
        sqlx::query(
            "INSERT INTO positions(position_id, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(position_id) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(&pos.position_id)
        .bind(value)
        .bind(pos.updated_at_ms)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn save_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let value = serde_json::to_string(order)?;
        sqlx::query(
            "INSERT INTO orders(order_id, position_id, value, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(order_id) DO UPDATE SET
                value = excluded.value,
                state = excluded.state,
                updated_at = excluded.updated_at",
        )
        .bind(&order.order_id)
        .bind(&order.position_id)
        .bind(value)
        .bind(order.state.as_str())
        .bind(order.created_at_ms)
        .bind(order.updated_at_ms)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
