//! Run history and best genomes, persisted in SQLite.
//!
//! The core only sees the [`GenomeStore`] contract. Blobs are written in the
//! current codec format; reading hands the raw bytes back so the caller decides
//! how to migrate or fall back.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use thiserror::Error;

use crate::codec;
use crate::config::EvolutionConfig;
use crate::evolution::GenerationRecord;
use crate::genome::Genome;

pub type SessionId = i64;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("genome encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("config serialization failed: {0}")]
    Config(#[from] serde_json::Error),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A genome blob as stored, not yet decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredGenome {
    pub session: SessionId,
    pub generation: u32,
    pub fitness: f32,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub population_size: usize,
    pub grid_size: usize,
    pub elite_size: usize,
    pub mutation_rate: f32,
    pub mutation_strength: f32,
    pub max_steps: usize,
    pub total_generations: u32,
    pub best_fitness: f32,
    pub notes: Option<String>,
}

pub trait GenomeStore {
    fn save_generation(
        &self,
        session: SessionId,
        generation: u32,
        best_fitness: f32,
        avg_fitness: f32,
    ) -> StorageResult<()>;

    fn save_best_genome(
        &self,
        session: SessionId,
        generation: u32,
        fitness: f32,
        genome: &Genome,
    ) -> StorageResult<()>;

    /// Highest-fitness genome of a session, most recent on ties.
    fn load_best_genome(&self, session: SessionId) -> StorageResult<Option<StoredGenome>>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL DEFAULT (datetime('now')),
                ended_at TEXT,
                population_size INTEGER NOT NULL,
                grid_size INTEGER NOT NULL,
                elite_size INTEGER NOT NULL,
                mutation_rate REAL NOT NULL,
                mutation_strength REAL NOT NULL,
                max_steps INTEGER NOT NULL,
                config_json TEXT NOT NULL,
                total_generations INTEGER NOT NULL DEFAULT 0,
                best_fitness REAL NOT NULL DEFAULT 0,
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS generations (
                session_id INTEGER NOT NULL,
                generation INTEGER NOT NULL,
                best_fitness REAL NOT NULL,
                avg_fitness REAL NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (session_id, generation),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS best_genomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                generation INTEGER NOT NULL,
                fitness REAL NOT NULL,
                format_tag INTEGER NOT NULL,
                genome BLOB NOT NULL,
                saved_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE INDEX IF NOT EXISTS idx_generations_session ON generations(session_id);
            CREATE INDEX IF NOT EXISTS idx_best_genomes_session ON best_genomes(session_id);
            "#,
        )?;
        Ok(Self { conn })
    }

    pub fn create_session(
        &self,
        config: &EvolutionConfig,
        notes: Option<&str>,
    ) -> StorageResult<SessionId> {
        let config_json = serde_json::to_string(config)?;
        self.conn.execute(
            "INSERT INTO sessions
             (population_size, grid_size, elite_size, mutation_rate, mutation_strength,
              max_steps, config_json, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                config.population_size as i64,
                config.grid_size as i64,
                config.elite_size as i64,
                f64::from(config.mutation.rate),
                f64::from(config.mutation.strength),
                config.max_steps as i64,
                config_json,
                notes,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Stamps the session as ended with its final totals.
    pub fn update_session(
        &self,
        session: SessionId,
        total_generations: u32,
        best_fitness: f32,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE sessions
             SET total_generations = ?2, best_fitness = ?3, ended_at = datetime('now')
             WHERE id = ?1",
            params![session, total_generations, f64::from(best_fitness)],
        )?;
        if changed == 0 {
            return Err(StorageError::UnknownSession(session));
        }
        Ok(())
    }

    /// The configuration a session was started with.
    pub fn session_config(&self, session: SessionId) -> StorageResult<EvolutionConfig> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM sessions WHERE id = ?1",
                params![session],
                |row| row.get(0),
            )
            .optional()?;
        let json = json.ok_or(StorageError::UnknownSession(session))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Most recent sessions first.
    pub fn sessions(&self, limit: usize) -> StorageResult<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], session_summary)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn session(&self, session: SessionId) -> StorageResult<SessionSummary> {
        self.conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session],
                session_summary,
            )
            .optional()?
            .ok_or(StorageError::UnknownSession(session))
    }

    /// Highest generation recorded for an existing session, 0 if none yet.
    pub fn last_generation(&self, session: SessionId) -> StorageResult<u32> {
        let last: Option<Option<u32>> = self
            .conn
            .query_row(
                "SELECT (SELECT MAX(generation) FROM generations WHERE session_id = s.id)
                 FROM sessions s WHERE s.id = ?1",
                params![session],
                |row| row.get(0),
            )
            .optional()?;
        match last {
            Some(generation) => Ok(generation.unwrap_or(0)),
            None => Err(StorageError::UnknownSession(session)),
        }
    }

    pub fn generation_history(&self, session: SessionId) -> StorageResult<Vec<GenerationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT generation, best_fitness, avg_fitness
             FROM generations WHERE session_id = ?1 ORDER BY generation",
        )?;
        let rows = stmt.query_map(params![session], |row| {
            Ok(GenerationRecord {
                generation: row.get(0)?,
                best_fitness: row.get::<_, f64>(1)? as f32,
                avg_fitness: row.get::<_, f64>(2)? as f32,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Best genome across every session.
    pub fn best_overall(&self) -> StorageResult<Option<StoredGenome>> {
        Ok(self
            .conn
            .query_row(
                "SELECT session_id, generation, fitness, genome FROM best_genomes
                 ORDER BY fitness DESC, id DESC LIMIT 1",
                [],
                stored_genome,
            )
            .optional()?)
    }

    /// Top `limit` saved genomes by fitness, within one session or across all.
    pub fn best_genomes(
        &self,
        session: Option<SessionId>,
        limit: usize,
    ) -> StorageResult<Vec<StoredGenome>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, generation, fitness, genome FROM best_genomes
             WHERE ?1 IS NULL OR session_id = ?1
             ORDER BY fitness DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session, limit as i64], stored_genome)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

const SESSION_COLUMNS: &str = "id, started_at, ended_at, population_size, grid_size, elite_size,
    mutation_rate, mutation_strength, max_steps, total_generations, best_fitness, notes";

fn session_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        population_size: row.get::<_, i64>(3)? as usize,
        grid_size: row.get::<_, i64>(4)? as usize,
        elite_size: row.get::<_, i64>(5)? as usize,
        mutation_rate: row.get::<_, f64>(6)? as f32,
        mutation_strength: row.get::<_, f64>(7)? as f32,
        max_steps: row.get::<_, i64>(8)? as usize,
        total_generations: row.get(9)?,
        best_fitness: row.get::<_, f64>(10)? as f32,
        notes: row.get(11)?,
    })
}

fn stored_genome(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredGenome> {
    Ok(StoredGenome {
        session: row.get(0)?,
        generation: row.get(1)?,
        fitness: row.get::<_, f64>(2)? as f32,
        bytes: row.get(3)?,
    })
}

impl GenomeStore for SqliteStore {
    fn save_generation(
        &self,
        session: SessionId,
        generation: u32,
        best_fitness: f32,
        avg_fitness: f32,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO generations (session_id, generation, best_fitness, avg_fitness)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session,
                generation,
                f64::from(best_fitness),
                f64::from(avg_fitness)
            ],
        )?;
        Ok(())
    }

    fn save_best_genome(
        &self,
        session: SessionId,
        generation: u32,
        fitness: f32,
        genome: &Genome,
    ) -> StorageResult<()> {
        let bytes = codec::encode(genome)?;
        self.conn.execute(
            "INSERT INTO best_genomes (session_id, generation, fitness, format_tag, genome)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session,
                generation,
                f64::from(fitness),
                codec::TAG_LAYERED,
                bytes
            ],
        )?;
        Ok(())
    }

    fn load_best_genome(&self, session: SessionId) -> StorageResult<Option<StoredGenome>> {
        Ok(self
            .conn
            .query_row(
                "SELECT session_id, generation, fitness, genome FROM best_genomes
                 WHERE session_id = ?1 ORDER BY fitness DESC, id DESC LIMIT 1",
                params![session],
                stored_genome,
            )
            .optional()?)
    }
}
