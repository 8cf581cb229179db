use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Bump when the cards table layout changes; recorded in `store_meta`.
const SCHEMA_VERSION: i64 = 3;

const MAX_RETRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO cards
    (id, name, description, first_mes, mes_example, tags, category, creator,
     version, last_modified, file_hash, file_size, token_count,
     has_lore_book, lore_book_name, favorite)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)";

/// One persisted card row. The description / first message / example
/// message columns are opaque searchable text; the indexing core never
/// interprets them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub first_mes: String,
    pub mes_example: String,
    pub tags: Vec<String>,
    pub category: String,
    pub creator: String,
    pub version: String,
    pub last_modified: f64,
    pub file_hash: String,
    pub file_size: i64,
    pub token_count: i64,
    pub has_lore_book: bool,
    pub lore_book_name: String,
    pub favorite: bool,
}

/// The slice of a row the scanner diffs against the filesystem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanState {
    pub last_modified: f64,
    pub file_size: i64,
    pub token_count: i64,
    pub file_hash: String,
    pub favorite: bool,
}

/// SQLite-backed card metadata store. A single connection behind a mutex;
/// SQLite's own locking covers cross-process access, and every operation
/// runs through a bounded-backoff retry for busy/locked conditions.
pub struct CardStore {
    conn: Mutex<Connection>,
    fresh: bool,
}

impl CardStore {
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create store directory: {}", e))?;
        }

        let fresh = !path.exists();
        let conn = Connection::open(path)
            .map_err(|e| format!("Failed to open card store {:?}: {}", path, e))?;

        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            log::warn!("Failed to enable WAL mode: {}", e);
        }
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        conn.busy_timeout(Duration::from_secs(30))
            .map_err(|e| e.to_string())?;

        init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            fresh,
        })
    }

    /// Whether `open` created the database file, i.e. the library has
    /// never been imported.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, String> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| "card store mutex poisoned".to_string())?;

        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op(&mut *conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < MAX_RETRIES => {
                    log::warn!(
                        "[Store] busy ({}), retry {}/{}",
                        e,
                        attempt,
                        MAX_RETRIES
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(format!("card store: {}", e)),
            }
        }
    }

    pub fn fetch_all(&self) -> Result<Vec<CardRecord>, String> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, description, first_mes, mes_example, tags, category,
                        creator, version, last_modified, file_hash, file_size, token_count,
                        has_lore_book, lore_book_name, favorite
                 FROM cards ORDER BY id",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect()
        })
    }

    pub fn scan_snapshot(&self) -> Result<HashMap<String, ScanState>, String> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, last_modified, file_size, token_count, file_hash, favorite
                 FROM cards",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ScanState {
                        last_modified: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                        file_size: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        token_count: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        file_hash: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        favorite: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
                    },
                ))
            })?;
            rows.collect()
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<CardRecord>, String> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, description, first_mes, mes_example, tags, category,
                        creator, version, last_modified, file_hash, file_size, token_count,
                        has_lore_book, lore_book_name, favorite
                 FROM cards WHERE id = ?1",
                [id],
                row_to_record,
            )
            .optional()
        })
    }

    pub fn upsert(&self, record: &CardRecord) -> Result<(), String> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
            execute_upsert(&mut stmt, record)?;
            Ok(())
        })
    }

    /// Batch upsert in a single transaction; used by the initial import.
    pub fn upsert_many(&self, records: &[CardRecord]) -> Result<usize, String> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(UPSERT_SQL)?;
                for record in records {
                    execute_upsert(&mut stmt, record)?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
    }

    pub fn delete_by_id(&self, id: &str) -> Result<(), String> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM cards WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Delete every record under `prefix/`. Returns the number of rows
    /// removed.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize, String> {
        let pattern = format!("{}/%", escape_like(prefix));
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cards WHERE id LIKE ?1 ESCAPE '\\'",
                [pattern.as_str()],
            )
        })
    }

    /// Rewrite the id and category of every record under `old_prefix/` by
    /// prefix substitution, for folder and bundle moves. Returns the
    /// number of rows touched.
    pub fn rename_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<usize, String> {
        let pattern = format!("{}/%", escape_like(old_prefix));
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE cards SET
                    id = ?2 || substr(id, length(?1) + 1),
                    category = CASE
                        WHEN category = ?1 THEN ?2
                        WHEN category LIKE ?3 ESCAPE '\\'
                            THEN ?2 || substr(category, length(?1) + 1)
                        ELSE category
                    END
                 WHERE id LIKE ?3 ESCAPE '\\'",
                params![old_prefix, new_prefix, pattern],
            )
        })
    }

    pub fn set_favorite(&self, id: &str, favorite: bool) -> Result<bool, String> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE cards SET favorite = ?2 WHERE id = ?1",
                params![id, favorite],
            )?;
            Ok(changed > 0)
        })
    }

    /// Write back a recomputed content hash. The scanner clears hashes on
    /// change instead of rehashing, so whoever recomputes one on demand
    /// persists it here.
    pub fn set_hash(&self, id: &str, file_hash: &str) -> Result<bool, String> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE cards SET file_hash = ?2 WHERE id = ?1",
                params![id, file_hash],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn count(&self) -> Result<i64, String> {
        self.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0)))
    }
}

fn init_schema(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cards (
            id TEXT PRIMARY KEY,
            name TEXT,
            description TEXT,
            first_mes TEXT,
            mes_example TEXT,
            tags TEXT,
            category TEXT,
            creator TEXT,
            version TEXT,
            last_modified REAL,
            file_hash TEXT,
            file_size INTEGER,
            token_count INTEGER DEFAULT 0,
            has_lore_book INTEGER DEFAULT 0,
            lore_book_name TEXT DEFAULT '',
            favorite INTEGER DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT
        );",
    )
    .map_err(|e| format!("Failed to initialize card store schema: {}", e))?;

    apply_migrations(conn)?;

    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('created_at', ?1)
         ON CONFLICT(key) DO NOTHING",
        [created_at.as_str()],
    )
    .map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SCHEMA_VERSION.to_string().as_str()],
    )
    .map_err(|e| e.to_string())?;

    Ok(())
}

/// Column additions for databases created by older builds. Checked
/// against `PRAGMA table_info` rather than the recorded schema version so
/// a half-migrated file still converges.
fn apply_migrations(conn: &Connection) -> Result<(), String> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(cards)")
        .map_err(|e| e.to_string())?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| e.to_string())?
        .filter_map(|c| c.ok())
        .collect();

    let additions = [
        ("token_count", "ALTER TABLE cards ADD COLUMN token_count INTEGER DEFAULT 0"),
        ("has_lore_book", "ALTER TABLE cards ADD COLUMN has_lore_book INTEGER DEFAULT 0"),
        ("lore_book_name", "ALTER TABLE cards ADD COLUMN lore_book_name TEXT DEFAULT ''"),
        ("favorite", "ALTER TABLE cards ADD COLUMN favorite INTEGER DEFAULT 0"),
    ];
    for (column, ddl) in additions {
        if !columns.iter().any(|c| c == column) {
            log::info!("Upgrading card store: adding {} column", column);
            conn.execute(ddl, [])
                .map_err(|e| format!("Failed to add {} column: {}", column, e))?;
        }
    }

    Ok(())
}

fn execute_upsert(
    stmt: &mut rusqlite::Statement<'_>,
    record: &CardRecord,
) -> rusqlite::Result<usize> {
    let tags_json = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());
    stmt.execute(params![
        record.id,
        record.name,
        record.description,
        record.first_mes,
        record.mes_example,
        tags_json,
        record.category,
        record.creator,
        record.version,
        record.last_modified,
        record.file_hash,
        record.file_size,
        record.token_count,
        record.has_lore_book,
        record.lore_book_name,
        record.favorite,
    ])
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CardRecord> {
    let tags_json: Option<String> = row.get(5)?;
    let tags = tags_json
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Ok(CardRecord {
        id: row.get(0)?,
        name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        first_mes: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        mes_example: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        tags,
        category: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        creator: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        version: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        last_modified: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
        file_hash: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        file_size: row.get::<_, Option<i64>>(11)?.unwrap_or(0),
        token_count: row.get::<_, Option<i64>>(12)?.unwrap_or(0),
        has_lore_book: row.get::<_, Option<bool>>(13)?.unwrap_or(false),
        lore_book_name: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        favorite: row.get::<_, Option<bool>>(15)?.unwrap_or(false),
    })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::DatabaseBusy || failure.code == ErrorCode::DatabaseLocked
    )
}

/// Escape SQL LIKE wildcards so a literal prefix containing `%` or `_`
/// cannot widen a prefix query.
fn escape_like(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
