//! Append-only fact arena.
//!
//! Typed ground facts over a fixed predicate schema, appended by the
//! Loop Driver and queried by the Governor's logic engine. The arena is
//! tamper-evident (SHA-256 hash chain) and optionally backed by a SQLite
//! database so stagnation and stability reasoning survive restarts.
//! Append is the only mutation; components never hold references to
//! facts across mutations; they query by predicate.

pub mod schema;
pub mod term;

pub use term::Term;

use crate::error::{EngineError, EngineResult};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// A typed ground fact. Two facts are considered the same assertion when
/// predicate and arguments match; timestamps are bookkeeping.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Fact {
    pub predicate: String,
    pub args: Vec<Term>,
    pub timestamp: i64,
}

impl Fact {
    /// Equality over predicate + args, ignoring the timestamp.
    pub fn same_assertion(&self, other: &Fact) -> bool {
        self.predicate == other.predicate && self.args == other.args
    }
}

impl std::fmt::Display for Fact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Newtype wrapping `Connection` in a `Mutex` so the store is both
/// `Send` and `Sync` (`rusqlite::Connection` is `Send` but not `Sync`).
struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS facts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    predicate  TEXT    NOT NULL,
    step       TEXT,
    args       TEXT    NOT NULL,
    timestamp  INTEGER NOT NULL,
    chain_hash TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_facts_predicate ON facts(predicate);
CREATE INDEX IF NOT EXISTS idx_facts_step      ON facts(step);
";

/// The append-only fact store.
///
/// The in-memory working set holds the facts of live loop steps; the
/// database (when open) is the durable record. Opening the database
/// loads nothing; call [`FactStore::load_step`] to hydrate one step.
pub struct FactStore {
    facts: Vec<Fact>,
    hash_chain: Vec<String>,
    /// predicate -> indices into `facts`, in append order.
    by_predicate: HashMap<String, Vec<usize>>,
    conn: Option<DbConn>,
}

impl std::fmt::Debug for FactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactStore")
            .field("facts_len", &self.facts.len())
            .field("persistent", &self.conn.is_some())
            .finish()
    }
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStore {
    /// Pure in-memory store (no persistence).
    pub fn new() -> Self {
        Self {
            facts: Vec::new(),
            hash_chain: Vec::new(),
            by_predicate: HashMap::new(),
            conn: None,
        }
    }

    /// Open (or create) a SQLite-backed store at `path`. The in-memory
    /// working set starts empty; call [`load_step`] to hydrate.
    pub fn open_db(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EngineError::Generic(format!("failed to open fact db: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| EngineError::Generic(format!("failed to initialise fact schema: {}", e)))?;

        log::info!(
            "[FactStore] opened db at {} (empty working set)",
            path.display()
        );

        Ok(Self {
            facts: Vec::new(),
            hash_chain: Vec::new(),
            by_predicate: HashMap::new(),
            conn: Some(DbConn(Mutex::new(conn))),
        })
    }

    /// Hydrate all persisted facts for one loop step into the working
    /// set. Already-loaded assertions are skipped. Returns the number of
    /// facts loaded.
    pub fn load_step(&mut self, step: &str) -> EngineResult<usize> {
        let db = match self.conn.as_ref() {
            Some(db) => db,
            None => return Ok(0),
        };

        let rows: Vec<(String, String, i64, String)> = {
            let conn = db
                .0
                .lock()
                .map_err(|e| EngineError::Generic(format!("fact db lock poisoned: {}", e)))?;
            let mut stmt = conn
                .prepare(
                    "SELECT predicate, args, timestamp, chain_hash FROM facts \
                     WHERE step = ?1 ORDER BY id ASC",
                )
                .map_err(|e| EngineError::Generic(format!("failed to prepare SELECT: {}", e)))?;
            stmt.query_map([step], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())
            .map_err(|e| EngineError::Generic(format!("failed to load step facts: {}", e)))?
        };

        let mut loaded = 0usize;
        for (predicate, args_json, timestamp, stored_hash) in rows {
            let args: Vec<Term> = serde_json::from_str(&args_json)?;
            let fact = Fact {
                predicate,
                args,
                timestamp,
            };
            if self.contains(&fact) {
                continue;
            }
            self.index_fact(&fact);
            self.facts.push(fact);
            self.hash_chain.push(stored_hash);
            loaded += 1;
        }

        log::debug!("[FactStore] loaded {} facts for step '{}'", loaded, step);
        Ok(loaded)
    }

    // ------------------------------------------------------------------
    // Core mutation
    // ------------------------------------------------------------------

    /// Append one fact. This is the only mutation the store supports.
    pub fn append(&mut self, fact: Fact) -> EngineResult<()> {
        let fact_hash = Self::fact_hash(&fact);
        let chain_hash = self.chain_hash(&fact_hash);

        if let Some(ref db) = self.conn {
            let args_json = serde_json::to_string(&fact.args)?;
            let conn = db
                .0
                .lock()
                .map_err(|e| EngineError::Generic(format!("fact db lock poisoned: {}", e)))?;
            conn.execute(
                "INSERT INTO facts (predicate, step, args, timestamp, chain_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fact.predicate,
                    fact.step_scope(),
                    args_json,
                    fact.timestamp,
                    chain_hash,
                ],
            )
            .map_err(|e| EngineError::Generic(format!("failed to INSERT fact: {}", e)))?;
        }

        log::trace!("[FactStore] + {}", fact);
        self.index_fact(&fact);
        self.facts.push(fact);
        self.hash_chain.push(chain_hash);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn all(&self) -> &[Fact] {
        &self.facts
    }

    /// All facts with the given predicate, in append order.
    pub fn with_predicate(&self, predicate: &str) -> Vec<&Fact> {
        self.by_predicate
            .get(predicate)
            .map(|ids| ids.iter().map(|&i| &self.facts[i]).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, predicate: &str) -> usize {
        self.by_predicate
            .get(predicate)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// True when the same assertion (predicate + args) was appended before.
    pub fn contains(&self, fact: &Fact) -> bool {
        self.with_predicate(&fact.predicate)
            .iter()
            .any(|f| f.same_assertion(fact))
    }

    // ------------------------------------------------------------------
    // Integrity (over the in-memory working set)
    // ------------------------------------------------------------------

    pub fn verify_integrity(&self) -> bool {
        let mut last: Option<&String> = None;
        for (i, fact) in self.facts.iter().enumerate() {
            let fact_hash = Self::fact_hash(fact);
            let mut hasher = Sha256::new();
            if let Some(prev) = last {
                hasher.update(prev.as_bytes());
            }
            hasher.update(fact_hash.as_bytes());
            let expected = format!("{:x}", hasher.finalize());
            if self.hash_chain[i] != expected {
                return false;
            }
            last = Some(&self.hash_chain[i]);
        }
        true
    }

    // ------------------------------------------------------------------
    // Private helpers
    // ------------------------------------------------------------------

    fn index_fact(&mut self, fact: &Fact) {
        self.by_predicate
            .entry(fact.predicate.clone())
            .or_default()
            .push(self.facts.len());
    }

    fn fact_hash(fact: &Fact) -> String {
        let mut hasher = Sha256::new();
        hasher.update(fact.predicate.as_bytes());
        for arg in &fact.args {
            hasher.update(arg.to_string().as_bytes());
        }
        hasher.update(fact.timestamp.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn chain_hash(&self, fact_hash: &str) -> String {
        let mut hasher = Sha256::new();
        if let Some(prev) = self.hash_chain.last() {
            hasher.update(prev.as_bytes());
        }
        hasher.update(fact_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
