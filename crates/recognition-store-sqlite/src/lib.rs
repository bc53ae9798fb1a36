use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use recognition_core::{
    compute_score, truncate_to_millis, unix_millis, AuditEvent, EntryId, ProfileId,
    ProfileRecord, ProfileStatus, RecognitionAggregate, RecognitionDraft, RecognitionEntry,
    RecognitionError, RecognitionType, RecognitionView, TrustLevel, UserId, UserRecord,
    VerificationStatus, WeightConfig, DUPLICATE_RECOGNITION_MESSAGE,
};
use rusqlite::{
    params, Connection, DatabaseName, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  role TEXT NOT NULL,
  verification TEXT NOT NULL CHECK (verification IN ('unverified','pending','verified')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
  profile_id TEXT PRIMARY KEY,
  owner_id TEXT,
  display_name TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','hidden','deleted')),
  recognition_score REAL NOT NULL DEFAULT 0 CHECK (recognition_score >= 0),
  recognition_level TEXT NOT NULL DEFAULT 'new' CHECK (recognition_level IN ('new','low','moderate','high')),
  recognizer_count INTEGER NOT NULL DEFAULT 0 CHECK (recognizer_count >= 0),
  last_recognition_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (owner_id) REFERENCES users(user_id)
);

CREATE TABLE IF NOT EXISTS recognition_entries (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  profile_id TEXT NOT NULL,
  recognizer_id TEXT NOT NULL,
  recognition_type TEXT NOT NULL CHECK (recognition_type IN ('know_personally','know_family','verified_documents','community_reference')),
  relationship TEXT,
  notes TEXT,
  base_weight REAL NOT NULL CHECK (base_weight >= 0),
  recognizer_role TEXT NOT NULL,
  entry_hash TEXT NOT NULL,
  previous_entry_hash TEXT,
  created_at TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  UNIQUE(profile_id, recognizer_id, recognition_type),
  FOREIGN KEY (profile_id) REFERENCES profiles(profile_id),
  FOREIGN KEY (recognizer_id) REFERENCES users(user_id)
);

CREATE TABLE IF NOT EXISTS audit_events (
  audit_id TEXT PRIMARY KEY,
  action TEXT NOT NULL,
  target TEXT NOT NULL,
  actor TEXT NOT NULL,
  metadata_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recognition_entries_profile_order
  ON recognition_entries(profile_id, created_at_ms, seq);
CREATE INDEX IF NOT EXISTS idx_recognition_entries_recognizer ON recognition_entries(recognizer_id);
CREATE INDEX IF NOT EXISTS idx_audit_events_target ON audit_events(target, created_at);
";

const MIGRATION_002_SQL: &str = r"
CREATE TRIGGER IF NOT EXISTS recognition_entries_reject_update
BEFORE UPDATE ON recognition_entries
BEGIN
  SELECT RAISE(ABORT, 'recognition_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS recognition_entries_reject_delete
BEFORE DELETE ON recognition_entries
BEGIN
  SELECT RAISE(ABORT, 'recognition_entries is append-only');
END;
";

const ENTRY_COLUMNS: &str = "entry_id, profile_id, recognizer_id, recognition_type, relationship, notes,
    base_weight, recognizer_role, entry_hash, previous_entry_hash, created_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// A committed ledger entry together with the profile snapshot written in the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendedRecognition {
    pub entry: RecognitionEntry,
    pub aggregate: RecognitionAggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed recognition store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration v{version} transaction"))?;

        // Another connection may have migrated while this one waited for the write lock.
        if current_schema_version(&tx)? >= version {
            return Ok(());
        }

        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        Ok(())
    }

    /// Persist one identity record.
    ///
    /// # Errors
    /// Returns an error when validation fails or the user already exists.
    pub fn insert_user(&mut self, user: &UserRecord) -> Result<()> {
        user.validate()?;
        let created_at = rfc3339(user.created_at)?;
        self.conn
            .execute(
                "INSERT INTO users(user_id, display_name, role, verification, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.user_id.to_string(),
                    user.display_name,
                    user.role.trim(),
                    user.verification.as_str(),
                    created_at,
                    created_at,
                ],
            )
            .context("failed to insert user")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, display_name, role, verification, created_at
             FROM users WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query(params![user_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_user(row)?)),
            None => Ok(None),
        }
    }

    /// Update a user's verification state. Returns `false` when the user does not exist.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_user_verification(
        &mut self,
        user_id: UserId,
        verification: VerificationStatus,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE users SET verification = ?2, updated_at = ?3 WHERE user_id = ?1",
                params![user_id.to_string(), verification.as_str(), now_rfc3339()?],
            )
            .context("failed to update user verification")?;
        Ok(updated == 1)
    }

    /// Persist one profile together with its zeroed recognition snapshot.
    ///
    /// # Errors
    /// Returns an error when validation fails, the owner does not exist, or the insert fails.
    pub fn insert_profile(&mut self, profile: &ProfileRecord) -> Result<()> {
        profile.validate()?;
        let created_at = rfc3339(profile.created_at)?;
        self.conn
            .execute(
                "INSERT INTO profiles(
                    profile_id, owner_id, display_name, status,
                    recognition_score, recognition_level, recognizer_count, last_recognition_at,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    profile.profile_id.to_string(),
                    profile.owner_id.map(|owner| owner.to_string()),
                    profile.display_name,
                    profile.status.as_str(),
                    profile.recognition.score,
                    profile.recognition.level.as_str(),
                    profile.recognition.recognizer_count,
                    profile.recognition.last_recognition_at.map(rfc3339).transpose()?,
                    created_at,
                    created_at,
                ],
            )
            .context("failed to insert profile")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_profile(&self, profile_id: ProfileId) -> Result<Option<ProfileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT profile_id, owner_id, display_name, status,
                    recognition_score, recognition_level, recognizer_count, last_recognition_at,
                    created_at
             FROM profiles WHERE profile_id = ?1",
        )?;
        let mut rows = stmt.query(params![profile_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_profile(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when the profile table cannot be read.
    pub fn list_profile_ids(&self) -> Result<Vec<ProfileId>> {
        let mut stmt = self.conn.prepare("SELECT profile_id FROM profiles ORDER BY profile_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(ProfileId::from_str(&row?)?);
        }
        Ok(ids)
    }

    /// Move a profile through its lifecycle. Returns `false` when the profile does not exist.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_profile_status(&mut self, profile_id: ProfileId, status: ProfileStatus) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE profiles SET status = ?2, updated_at = ?3 WHERE profile_id = ?1",
                params![profile_id.to_string(), status.as_str(), now_rfc3339()?],
            )
            .context("failed to update profile status")?;
        Ok(updated == 1)
    }

    /// # Errors
    /// Returns an error when the existence query fails.
    pub fn recognition_exists(
        &self,
        profile_id: ProfileId,
        recognizer_id: UserId,
        recognition_type: RecognitionType,
    ) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM recognition_entries
                WHERE profile_id = ?1 AND recognizer_id = ?2 AND recognition_type = ?3
             )",
            params![profile_id.to_string(), recognizer_id.to_string(), recognition_type.as_str()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Append one recognition to its profile's hash chain and refresh the profile snapshot.
    ///
    /// Preconditions are re-checked, the entry is linked onto the chain head, and the
    /// aggregate is recomputed from the full ledger, all inside one `BEGIN IMMEDIATE`
    /// transaction. Concurrent writers queue on the database write lock, so every entry links
    /// onto the entry committed immediately before it and the cached aggregate covers every
    /// committed entry.
    /// The write timestamp is captured once, never earlier than the chain head, and used for
    /// both `created_at` and the hash.
    ///
    /// # Errors
    /// Returns a wrapped [`RecognitionError`] when the recognizer is missing or unverified,
    /// the profile is missing or deleted, or the triple already exists. Any other failure
    /// rolls the whole transaction back, entry included.
    pub fn append_recognition(
        &mut self,
        draft: RecognitionDraft,
        now: OffsetDateTime,
        weights: &WeightConfig,
    ) -> Result<AppendedRecognition> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;

        check_append_preconditions(&tx, &draft)?;

        let head = latest_entry(&tx, draft.profile_id)?;
        let mut created_at = truncate_to_millis(now);
        if let Some(head) = &head {
            created_at = created_at.max(head.created_at);
        }
        let entry =
            RecognitionEntry::seal(draft, head.map(|head| head.entry_hash), created_at);
        entry.validate()?;

        let inserted = tx.execute(
            "INSERT INTO recognition_entries(
                entry_id, profile_id, recognizer_id, recognition_type, relationship, notes,
                base_weight, recognizer_role, entry_hash, previous_entry_hash,
                created_at, created_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.entry_id.to_string(),
                entry.profile_id.to_string(),
                entry.recognizer_id.to_string(),
                entry.recognition_type.as_str(),
                entry.relationship,
                entry.notes,
                entry.base_weight,
                entry.recognizer_role,
                entry.entry_hash,
                entry.previous_entry_hash,
                rfc3339(entry.created_at)?,
                unix_millis(entry.created_at),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(
                    RecognitionError::Conflict(DUPLICATE_RECOGNITION_MESSAGE.to_string()).into()
                );
            }
            Err(err) => return Err(err).context("failed to insert recognition entry"),
        }

        let entries = load_entries(&tx, entry.profile_id)?;
        let aggregate = compute_score(&entries, now, weights);
        write_aggregate(&tx, entry.profile_id, &aggregate)?;

        tx.commit().context("failed to commit append transaction")?;
        Ok(AppendedRecognition { entry, aggregate })
    }

    /// Recompute a profile's aggregate from its ledger and overwrite the cached snapshot.
    ///
    /// Runs under the same write lock as [`SqliteStore::append_recognition`], so a rebuild
    /// never interleaves with an append.
    ///
    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the profile does not exist, or an
    /// error when the transaction fails.
    pub fn refresh_aggregate(
        &mut self,
        profile_id: ProfileId,
        now: OffsetDateTime,
        weights: &WeightConfig,
    ) -> Result<RecognitionAggregate> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start aggregate transaction")?;
        if profile_status(&tx, profile_id)?.is_none() {
            return Err(RecognitionError::NotFound("profile".to_string()).into());
        }
        let entries = load_entries(&tx, profile_id)?;
        let aggregate = compute_score(&entries, now, weights);
        write_aggregate(&tx, profile_id, &aggregate)?;
        tx.commit().context("failed to commit aggregate transaction")?;
        Ok(aggregate)
    }

    /// Load a profile's entries in chain order (oldest first).
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entries(&self, profile_id: ProfileId) -> Result<Vec<RecognitionEntry>> {
        load_entries(&self.conn, profile_id)
    }

    /// Load a profile's entries newest first with the recognizer's name and role resolved.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_recognition_views(&self, profile_id: ProfileId) -> Result<Vec<RecognitionView>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.entry_id, e.profile_id, e.recognizer_id, e.recognition_type, e.relationship,
                    e.notes, e.base_weight, e.recognizer_role, e.entry_hash, e.previous_entry_hash,
                    e.created_at, u.display_name, u.role
             FROM recognition_entries e
             LEFT JOIN users u ON u.user_id = e.recognizer_id
             WHERE e.profile_id = ?1
             ORDER BY e.created_at_ms DESC, e.seq DESC",
        )?;
        let mut rows = stmt.query(params![profile_id.to_string()])?;
        let mut views = Vec::new();
        while let Some(row) = rows.next()? {
            views.push(RecognitionView {
                entry: decode_entry(row, 0)?,
                recognizer_name: row.get(11)?,
                recognizer_current_role: row.get(12)?,
            });
        }
        Ok(views)
    }

    /// # Errors
    /// Returns an error when metadata serialization or the insert fails.
    pub fn append_audit_event(&mut self, event: &AuditEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO audit_events(audit_id, action, target, actor, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.audit_id.to_string(),
                    event.action,
                    event.target,
                    event.actor,
                    serde_json::to_string(&event.metadata)
                        .context("failed to serialize audit metadata")?,
                    rfc3339(event.created_at)?,
                ],
            )
            .context("failed to insert audit event")?;
        Ok(())
    }

    /// List audit events newest first, optionally filtered by target.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_audit_events(&self, target: Option<&str>) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT audit_id, action, target, actor, metadata_json, created_at
             FROM audit_events
             WHERE ?1 IS NULL OR target = ?1
             ORDER BY created_at DESC, audit_id DESC",
        )?;
        let mut rows = stmt.query(params![target])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let audit_id_raw: String = row.get(0)?;
            let metadata_json: String = row.get(4)?;
            events.push(AuditEvent {
                audit_id: Ulid::from_string(&audit_id_raw)
                    .with_context(|| format!("invalid ULID: {audit_id_raw}"))?,
                action: row.get(1)?,
                target: row.get(2)?,
                actor: row.get(3)?,
                metadata: serde_json::from_str(&metadata_json)
                    .context("failed to deserialize audit metadata")?,
                created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            });
        }
        Ok(events)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn check_append_preconditions(conn: &Connection, draft: &RecognitionDraft) -> Result<()> {
    let verification_raw = conn
        .query_row(
            "SELECT verification FROM users WHERE user_id = ?1",
            params![draft.recognizer_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| RecognitionError::NotFound("recognizer".to_string()))?;
    let verification = VerificationStatus::parse(&verification_raw)
        .ok_or_else(|| anyhow!("unknown verification status: {verification_raw}"))?;
    if !verification.is_verified() {
        return Err(RecognitionError::Forbidden("unverified recognizer".to_string()).into());
    }

    let status = profile_status(conn, draft.profile_id)?
        .ok_or_else(|| RecognitionError::NotFound("profile".to_string()))?;
    if status.is_terminal() {
        return Err(RecognitionError::Conflict("deleted profile".to_string()).into());
    }

    let duplicate = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM recognition_entries
            WHERE profile_id = ?1 AND recognizer_id = ?2 AND recognition_type = ?3
         )",
        params![
            draft.profile_id.to_string(),
            draft.recognizer_id.to_string(),
            draft.recognition_type.as_str()
        ],
        |row| row.get::<_, i64>(0),
    )?;
    if duplicate == 1 {
        return Err(RecognitionError::Conflict(DUPLICATE_RECOGNITION_MESSAGE.to_string()).into());
    }
    Ok(())
}

fn profile_status(conn: &Connection, profile_id: ProfileId) -> Result<Option<ProfileStatus>> {
    let status_raw = conn
        .query_row(
            "SELECT status FROM profiles WHERE profile_id = ?1",
            params![profile_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    status_raw
        .map(|raw| {
            ProfileStatus::parse(&raw).ok_or_else(|| anyhow!("unknown profile status: {raw}"))
        })
        .transpose()
}

fn load_entries(conn: &Connection, profile_id: ProfileId) -> Result<Vec<RecognitionEntry>> {
    let query = format!(
        "SELECT {ENTRY_COLUMNS} FROM recognition_entries
         WHERE profile_id = ?1
         ORDER BY created_at_ms ASC, seq ASC"
    );
    let mut stmt = conn.prepare(&query)?;
    let mut rows = stmt.query(params![profile_id.to_string()])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(decode_entry(row, 0)?);
    }
    Ok(entries)
}

fn write_aggregate(
    conn: &Connection,
    profile_id: ProfileId,
    aggregate: &RecognitionAggregate,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE profiles
             SET recognition_score = ?2, recognition_level = ?3, recognizer_count = ?4,
                 last_recognition_at = ?5, updated_at = ?6
             WHERE profile_id = ?1",
            params![
                profile_id.to_string(),
                aggregate.score,
                aggregate.level.as_str(),
                aggregate.recognizer_count,
                aggregate.last_recognition_at.map(rfc3339).transpose()?,
                now_rfc3339()?,
            ],
        )
        .context("failed to write recognition aggregate")?;
    if updated != 1 {
        return Err(anyhow!("profile {profile_id} disappeared before its aggregate was written"));
    }
    Ok(())
}

fn latest_entry(conn: &Connection, profile_id: ProfileId) -> Result<Option<RecognitionEntry>> {
    let query = format!(
        "SELECT {ENTRY_COLUMNS} FROM recognition_entries
         WHERE profile_id = ?1
         ORDER BY created_at_ms DESC, seq DESC
         LIMIT 1"
    );
    let mut stmt = conn.prepare(&query)?;
    let mut rows = stmt.query(params![profile_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_entry(row, 0)?)),
        None => Ok(None),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn decode_entry(row: &Row<'_>, offset: usize) -> Result<RecognitionEntry> {
    let entry_id_raw: String = row.get(offset)?;
    let profile_id_raw: String = row.get(offset + 1)?;
    let recognizer_id_raw: String = row.get(offset + 2)?;
    let recognition_type_raw: String = row.get(offset + 3)?;

    Ok(RecognitionEntry {
        entry_id: EntryId::from_str(&entry_id_raw)?,
        profile_id: ProfileId::from_str(&profile_id_raw)?,
        recognizer_id: UserId::from_str(&recognizer_id_raw)?,
        recognition_type: RecognitionType::parse(&recognition_type_raw)
            .ok_or_else(|| anyhow!("unknown recognition_type: {recognition_type_raw}"))?,
        relationship: row.get(offset + 4)?,
        notes: row.get(offset + 5)?,
        base_weight: row.get(offset + 6)?,
        recognizer_role: row.get(offset + 7)?,
        entry_hash: row.get(offset + 8)?,
        previous_entry_hash: row.get(offset + 9)?,
        created_at: parse_rfc3339(&row.get::<_, String>(offset + 10)?)?,
    })
}

fn decode_user(row: &Row<'_>) -> Result<UserRecord> {
    let user_id_raw: String = row.get(0)?;
    let verification_raw: String = row.get(3)?;
    Ok(UserRecord {
        user_id: UserId::from_str(&user_id_raw)?,
        display_name: row.get(1)?,
        role: row.get(2)?,
        verification: VerificationStatus::parse(&verification_raw)
            .ok_or_else(|| anyhow!("unknown verification status: {verification_raw}"))?,
        created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
    })
}

fn decode_profile(row: &Row<'_>) -> Result<ProfileRecord> {
    let profile_id_raw: String = row.get(0)?;
    let owner_id_raw: Option<String> = row.get(1)?;
    let status_raw: String = row.get(3)?;
    let level_raw: String = row.get(5)?;
    let last_recognition_raw: Option<String> = row.get(7)?;

    Ok(ProfileRecord {
        profile_id: ProfileId::from_str(&profile_id_raw)?,
        owner_id: owner_id_raw.as_deref().map(UserId::from_str).transpose()?,
        display_name: row.get(2)?,
        status: ProfileStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown profile status: {status_raw}"))?,
        recognition: RecognitionAggregate {
            score: row.get(4)?,
            level: TrustLevel::parse(&level_raw)
                .ok_or_else(|| anyhow!("unknown recognition level: {level_raw}"))?,
            recognizer_count: row.get(6)?,
            last_recognition_at: last_recognition_raw.as_deref().map(parse_rfc3339).transpose()?,
        },
        created_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
