//! SQLite persistence shared by the verdict cache and the exemption store.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Error from the persistent store.
#[derive(Debug)]
pub enum StoreError {
    /// SQLite error.
    Sqlite(rusqlite::Error),
    /// IO error (creating the database directory).
    Io(std::io::Error),
    /// A stored row could not be interpreted.
    Corrupt(String),
    /// The blocking task running a query panicked or was cancelled.
    Task(tokio::task::JoinError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Corrupt(msg) => write!(f, "corrupt row: {}", msg),
            StoreError::Task(e) => write!(f, "database task failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache (
    ip TEXT PRIMARY KEY,
    is_proxy INTEGER,
    exempted INTEGER NOT NULL DEFAULT 0,
    recorded_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS exemptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    value TEXT NOT NULL,
    UNIQUE (type, value)
);
";

/// Handle to the on-disk database.
///
/// Cloning is cheap; all clones share one connection behind a mutex, which
/// serializes writers so a cache write and an exemption toggle on the same
/// IP cannot interleave.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened proxy cache database");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

/// Run a synchronous store operation on the blocking thread pool, keeping
/// SQLite I/O off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
