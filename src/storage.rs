//! Persisted state (§6, §10): one sqlite table per entity kind, `name TEXT
//! PRIMARY KEY` / `value BLOB` holding a JSON-encoded row. Ported from the
//! reference implementation's generic `storage.StoreInstance[T]` — a
//! `GetInstance[T](store, table)` constructor returning a type-erased
//! key/value table, rather than one hand-written struct per entity.
//! Schema is not part of the wire contract (§6).

use std::marker::PhantomData;
use std::path::Path;

use serde::{Serialize, de::DeserializeOwned};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

        Ok(Self { pool })
    }

    /// Open (creating if needed) a typed table within this store. Every
    /// entity kind (CA, operators, sessions, CRL) gets its own table, keyed
    /// by the entity's natural key.
    pub async fn table<T>(&self, table: &'static str) -> anyhow::Result<Table<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Unpin,
    {
        let query = format!("CREATE TABLE IF NOT EXISTS {table} (name TEXT NOT NULL PRIMARY KEY, value BLOB)");
        sqlx::query(&query).execute(&self.pool).await?;

        Ok(Table { pool: self.pool.clone(), table, _marker: PhantomData })
    }
}

pub struct Table<T> {
    pool: SqlitePool,
    table: &'static str,
    _marker: PhantomData<T>,
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Unpin,
{
    pub async fn set(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let blob = serde_json::to_vec(value)?;
        let query = format!(
            "INSERT INTO {} (name, value) VALUES (?, ?) ON CONFLICT (name) DO UPDATE SET value = excluded.value",
            self.table
        );
        sqlx::query(&query).bind(key).bind(blob).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<T>> {
        let query = format!("SELECT value FROM {} WHERE name = ?", self.table);
        let row = sqlx::query(&query).bind(key).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let blob: Vec<u8> = row.try_get("value")?;
                Ok(Some(serde_json::from_slice(&blob)?))
            }
            None => Ok(None),
        }
    }

    pub async fn get_all(&self) -> anyhow::Result<Vec<T>> {
        let query = format!("SELECT value FROM {}", self.table);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.try_get("value")?;
                Ok(serde_json::from_slice(&blob)?)
            })
            .collect()
    }

    pub async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let query = format!("DELETE FROM {} WHERE name = ?", self.table);
        sqlx::query(&query).bind(key).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn set_get_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.sqlite3")).await.unwrap();
        let table: Table<Widget> = store.table("widgets").await.unwrap();

        let widget = Widget { name: "bolt".into(), count: 5 };
        table.set("bolt", &widget).await.unwrap();
        assert_eq!(table.get("bolt").await.unwrap(), Some(widget.clone()));

        let updated = Widget { name: "bolt".into(), count: 9 };
        table.set("bolt", &updated).await.unwrap();
        assert_eq!(table.get("bolt").await.unwrap(), Some(updated));

        table.remove("bolt").await.unwrap();
        assert_eq!(table.get("bolt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_all_returns_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.sqlite3")).await.unwrap();
        let table: Table<Widget> = store.table("widgets").await.unwrap();

        table.set("a", &Widget { name: "a".into(), count: 1 }).await.unwrap();
        table.set("b", &Widget { name: "b".into(), count: 2 }).await.unwrap();

        let mut all = table.get_all().await.unwrap();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(all, vec![Widget { name: "a".into(), count: 1 }, Widget { name: "b".into(), count: 2 }]);
    }
}
