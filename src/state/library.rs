use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::backend::ProductBackend;
use super::data::{ProductFields, ProductRecord};
use super::events::{ChangeBus, ChangeEvent, ChangeKind};
use crate::error::BackendError;

const PRODUCT_COLUMNS: &str = "id, name, price, description, stock, image_url, created_at";

/// The Library manages the SQLite product catalog.
/// It is the local stand-in for the hosted `products` table: same columns,
/// same newest-first ordering, and a change event for every mutation.
pub struct Library {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
    changes: Option<ChangeBus>,
}

impl Library {
    /// Open (or create) the catalog database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, BackendError> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(db_path)?;
        info!(path = %db_path.display(), "catalog database opened");

        Self::from_connection(conn, Some(db_path.to_path_buf()))
    }

    /// Throwaway database, used by tests
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, BackendError> {
        init_schema(&conn)?;
        Ok(Library {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
            changes: None,
        })
    }

    /// Fan out a change event on `bus` after every successful mutation
    pub fn with_change_bus(mut self, bus: ChangeBus) -> Self {
        self.changes = Some(bus);
        self
    }

    /// Get the path to the database file (`None` when in memory)
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Get a count of products in the catalog
    pub async fn product_count(&self) -> Result<i64, BackendError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
            Ok(count)
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| BackendError::Task("catalog connection lock poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| BackendError::Task(e.to_string()))?
    }

    fn publish(&self, kind: ChangeKind, id: i64) {
        if let Some(bus) = &self.changes {
            let receivers = bus.publish(ChangeEvent::backend(kind, Some(id)));
            debug!(?kind, product_id = id, receivers, "published change event");
        }
    }
}

/// Initialize the database schema.
/// Creates the products table and its ordering index if they don't exist.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    // `image_url` keeps the hosted table's column name, but it holds a
    // storage key; URLs are only built at display time
    conn.execute(
        "CREATE TABLE IF NOT EXISTS products (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL,
            price           REAL NOT NULL CHECK (price >= 0),
            description     TEXT,
            stock           INTEGER NOT NULL DEFAULT 0 CHECK (stock >= 0),
            image_url       TEXT,
            created_at      INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_products_created_at
         ON products(created_at DESC)",
        [],
    )?;

    Ok(())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ProductRecord> {
    let created_ms: i64 = row.get(6)?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, created_ms))?;

    Ok(ProductRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        price: row.get(2)?,
        description: row.get(3)?,
        stock: row.get(4)?,
        image_key: row.get(5)?,
        created_at,
    })
}

#[async_trait]
impl ProductBackend for Library {
    async fn list_products(&self) -> Result<Vec<ProductRecord>, BackendError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY created_at DESC, id DESC"
            ))?;

            let records = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn get_product(&self, id: i64) -> Result<ProductRecord, BackendError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?
            .ok_or(BackendError::NotFound(id))
        })
        .await
    }

    async fn insert_product(&self, fields: &ProductFields) -> Result<ProductRecord, BackendError> {
        let fields = fields.clone();
        let record = self
            .with_conn(move |conn| {
                // Millisecond precision, truncated so the row reads back identical
                let created_at = DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis())
                    .unwrap_or_else(Utc::now);

                conn.execute(
                    "INSERT INTO products (name, price, description, stock, image_url, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        fields.name,
                        fields.price,
                        fields.description,
                        fields.stock,
                        fields.image_key,
                        created_at.timestamp_millis(),
                    ],
                )?;

                Ok(ProductRecord {
                    id: conn.last_insert_rowid(),
                    name: fields.name,
                    price: fields.price,
                    description: fields.description,
                    stock: fields.stock,
                    image_key: fields.image_key,
                    created_at,
                })
            })
            .await?;

        self.publish(ChangeKind::Insert, record.id);
        Ok(record)
    }

    async fn update_product(&self, id: i64, fields: &ProductFields) -> Result<(), BackendError> {
        let fields = fields.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE products
                 SET name = ?1, price = ?2, description = ?3, stock = ?4, image_url = ?5
                 WHERE id = ?6",
                params![
                    fields.name,
                    fields.price,
                    fields.description,
                    fields.stock,
                    fields.image_key,
                    id,
                ],
            )?;

            if changed == 0 {
                return Err(BackendError::NotFound(id));
            }
            Ok(())
        })
        .await?;

        self.publish(ChangeKind::Update, id);
        Ok(())
    }

    async fn delete_product(&self, id: i64) -> Result<(), BackendError> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM products WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(BackendError::NotFound(id));
            }
            Ok(())
        })
        .await?;

        self.publish(ChangeKind::Delete, id);
        Ok(())
    }
}

// Implement Debug for better error messages
impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("db_path", &self.db_path)
            .field("publishes_changes", &self.changes.is_some())
            .finish()
    }
}
