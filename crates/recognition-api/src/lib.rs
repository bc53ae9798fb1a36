use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use recognition_core::{
    compute_score, normalize_optional_text, validate_text_bounds, verify_chain, AuditEvent,
    ChainVerification, ProfileId, ProfileRecord, ProfileStatus, RecognitionAggregate,
    RecognitionDraft, RecognitionEntry, RecognitionError, RecognitionType, RecognitionView,
    UserId, UserRecord, VerificationStatus, WeightConfig, WeightOverrides,
    DUPLICATE_RECOGNITION_MESSAGE,
};
use recognition_store_sqlite::{AppendedRecognition, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Destination for append-only audit events emitted by state-changing operations.
pub trait AuditSink: Send + Sync {
    /// # Errors
    /// Returns an error when the event cannot be recorded. Callers treat this as non-fatal.
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Default sink: the `audit_events` table of the recognition database.
#[derive(Debug, Clone)]
pub struct SqliteAuditSink {
    db_path: PathBuf,
}

impl SqliteAuditSink {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.append_audit_event(event)
    }
}

/// Load the weight table from an optional YAML file, falling back to built-in defaults.
///
/// Role and type entries in the file are merged over the built-in tables, so a file that only
/// adjusts `elder` keeps every other role at its default. `level_thresholds`, when present,
/// replaces the default ranges as a whole.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, or the resulting table is invalid.
pub fn load_weight_config(path: Option<&Path>) -> Result<WeightConfig> {
    let config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read weight config {}", path.display()))?;
            let overrides = serde_yaml::from_str::<WeightOverrides>(&raw)
                .with_context(|| format!("failed to parse weight config {}", path.display()))?;
            WeightConfig::default().with_overrides(overrides)
        }
        None => WeightConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Caller context copied into the audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddRecognitionRequest {
    pub profile_id: ProfileId,
    pub recognizer_id: UserId,
    pub recognition_type: RecognitionType,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddRecognitionResult {
    pub entry: RecognitionEntry,
    pub aggregate: RecognitionAggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterUserRequest {
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub display_name: String,
    pub role: String,
    #[serde(default)]
    pub verification: Option<VerificationStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateProfileRequest {
    #[serde(default)]
    pub profile_id: Option<ProfileId>,
    pub display_name: String,
    #[serde(default)]
    pub owner_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileChainReport {
    pub profile_id: ProfileId,
    pub verification: ChainVerification,
}

#[derive(Clone)]
pub struct RecognitionApi {
    db_path: PathBuf,
    weights: Arc<WeightConfig>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for RecognitionApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionApi")
            .field("db_path", &self.db_path)
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

impl RecognitionApi {
    /// Build an API over `db_path` with default weights and the `SQLite` audit sink.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        let audit = Arc::new(SqliteAuditSink::new(db_path.clone()));
        Self { db_path, weights: Arc::new(WeightConfig::default()), audit }
    }

    /// Install a weight table for the lifetime of this handle.
    ///
    /// # Errors
    /// Returns [`RecognitionError::InvalidConfig`] (wrapped) when the table is invalid.
    pub fn with_weights(mut self, weights: WeightConfig) -> Result<Self> {
        weights.validate()?;
        self.weights = Arc::new(weights);
        Ok(self)
    }

    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn weights(&self) -> &WeightConfig {
        &self.weights
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        tracing::info!(
            from = before.current_version,
            to = after.current_version,
            "recognition schema migrated"
        );
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let store = self.open_migrated_store()?;
        store.backup_database(out_file)
    }

    /// Register a user in the identity table. New users start unverified unless stated.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn register_user(&self, input: RegisterUserRequest) -> Result<UserRecord> {
        let mut store = self.open_migrated_store()?;
        let user = UserRecord {
            user_id: input.user_id.unwrap_or_default(),
            display_name: input.display_name.trim().to_string(),
            role: input.role.trim().to_string(),
            verification: input.verification.unwrap_or(VerificationStatus::Unverified),
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_user(&user)?;
        Ok(user)
    }

    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the user does not exist.
    pub fn set_user_verification(
        &self,
        user_id: UserId,
        verification: VerificationStatus,
    ) -> Result<UserRecord> {
        let mut store = self.open_migrated_store()?;
        if !store.set_user_verification(user_id, verification)? {
            return Err(RecognitionError::NotFound("user".to_string()).into());
        }
        self.emit_audit(AuditEvent {
            audit_id: Ulid::new(),
            action: "user_verification".to_string(),
            target: user_id.to_string(),
            actor: "operator".to_string(),
            metadata: serde_json::json!({ "verification": verification.as_str() }),
            created_at: OffsetDateTime::now_utc(),
        });
        store
            .get_user(user_id)?
            .ok_or_else(|| RecognitionError::NotFound("user".to_string()).into())
    }

    /// Create a profile with an empty ledger and a zeroed recognition snapshot.
    ///
    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the owner does not exist, or an
    /// error when validation or persistence fails.
    pub fn create_profile(&self, input: CreateProfileRequest) -> Result<ProfileRecord> {
        let mut store = self.open_migrated_store()?;
        if let Some(owner_id) = input.owner_id {
            if store.get_user(owner_id)?.is_none() {
                return Err(RecognitionError::NotFound("owner".to_string()).into());
            }
        }

        let profile = ProfileRecord {
            profile_id: input.profile_id.unwrap_or_default(),
            owner_id: input.owner_id,
            display_name: input.display_name.trim().to_string(),
            status: ProfileStatus::Active,
            recognition: RecognitionAggregate::default(),
            created_at: OffsetDateTime::now_utc(),
        };
        store.insert_profile(&profile)?;
        Ok(profile)
    }

    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the profile does not exist.
    pub fn get_profile(&self, profile_id: ProfileId) -> Result<ProfileRecord> {
        let store = self.open_migrated_store()?;
        require_profile(&store, profile_id)
    }

    /// Move a profile between `active`, `hidden`, and `deleted`. Deletion is terminal.
    ///
    /// # Errors
    /// Returns [`RecognitionError::NotFound`] or [`RecognitionError::Conflict`] (wrapped) when
    /// the profile is missing or already deleted.
    pub fn set_profile_status(
        &self,
        profile_id: ProfileId,
        status: ProfileStatus,
    ) -> Result<ProfileRecord> {
        let mut store = self.open_migrated_store()?;
        let current = require_profile(&store, profile_id)?;
        if current.status.is_terminal() && current.status != status {
            return Err(RecognitionError::Conflict("deleted profile".to_string()).into());
        }
        store.set_profile_status(profile_id, status)?;
        self.emit_audit(AuditEvent {
            audit_id: Ulid::new(),
            action: "profile_status".to_string(),
            target: profile_id.to_string(),
            actor: "operator".to_string(),
            metadata: serde_json::json!({
                "from": current.status.as_str(),
                "to": status.as_str(),
            }),
            created_at: OffsetDateTime::now_utc(),
        });
        require_profile(&store, profile_id)
    }

    /// Record one recognition at the current time.
    ///
    /// # Errors
    /// See [`RecognitionApi::add_recognition_at`].
    pub fn add_recognition(&self, input: AddRecognitionRequest) -> Result<AddRecognitionResult> {
        self.add_recognition_at(input, OffsetDateTime::now_utc())
    }

    /// Record one recognition with `now` as the write clock.
    ///
    /// Preconditions are checked in a fixed order so each failure is distinguishable:
    /// input bounds, recognizer exists, recognizer verified, profile exists and is not
    /// deleted, recognizer is not the owner, triple not yet recorded.
    ///
    /// The store re-checks the recognizer, profile, and duplicate preconditions under its write
    /// lock and writes the profile snapshot in the same transaction as the entry.
    ///
    /// # Errors
    /// Returns a wrapped [`RecognitionError`] for each rejected precondition, or an error when
    /// persistence fails. A failed snapshot write rolls the entry back.
    pub fn add_recognition_at(
        &self,
        input: AddRecognitionRequest,
        now: OffsetDateTime,
    ) -> Result<AddRecognitionResult> {
        let relationship = normalize_optional_text(input.relationship);
        let notes = normalize_optional_text(input.notes);
        validate_text_bounds(relationship.as_deref(), notes.as_deref())?;

        let mut store = self.open_migrated_store()?;

        let recognizer = store
            .get_user(input.recognizer_id)?
            .ok_or_else(|| RecognitionError::NotFound("recognizer".to_string()))?;
        if !recognizer.verification.is_verified() {
            return Err(RecognitionError::Forbidden("unverified recognizer".to_string()).into());
        }

        let profile = require_profile(&store, input.profile_id)?;
        if profile.status.is_terminal() {
            return Err(RecognitionError::Conflict("deleted profile".to_string()).into());
        }
        if profile.owner_id == Some(recognizer.user_id) {
            return Err(RecognitionError::Forbidden("self recognition".to_string()).into());
        }

        if store.recognition_exists(profile.profile_id, recognizer.user_id, input.recognition_type)? {
            return Err(RecognitionError::Conflict(DUPLICATE_RECOGNITION_MESSAGE.to_string()).into());
        }

        let draft = RecognitionDraft::new(
            profile.profile_id,
            recognizer.user_id,
            input.recognition_type,
            relationship,
            notes,
            &recognizer.role,
            &self.weights,
        )?;
        let profile_id = profile.profile_id;
        let AppendedRecognition { entry, aggregate } =
            match store.append_recognition(draft, now, &self.weights) {
                Ok(appended) => appended,
                Err(err) => {
                    if err.downcast_ref::<RecognitionError>().is_none() {
                        tracing::error!(
                            profile_id = %profile_id,
                            recognizer_id = %recognizer.user_id,
                            error = %err,
                            "recognition append rolled back"
                        );
                    }
                    return Err(err);
                }
            };

        self.emit_audit(AuditEvent {
            audit_id: Ulid::new(),
            action: "recognition_add".to_string(),
            target: profile.profile_id.to_string(),
            actor: recognizer.user_id.to_string(),
            metadata: serde_json::json!({
                "entry_id": entry.entry_id.to_string(),
                "recognition_type": entry.recognition_type.as_str(),
                "base_weight": entry.base_weight,
                "recognizer_role": entry.recognizer_role,
                "request": input.metadata,
            }),
            created_at: now,
        });

        tracing::info!(
            profile_id = %profile.profile_id,
            recognizer_id = %recognizer.user_id,
            recognition_type = entry.recognition_type.as_str(),
            base_weight = entry.base_weight,
            score = aggregate.score,
            level = aggregate.level.as_str(),
            "recognition added"
        );

        Ok(AddRecognitionResult { entry, aggregate })
    }

    /// List a profile's recognitions, newest first, with recognizer identity resolved.
    ///
    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the profile does not exist.
    pub fn list_recognitions(&self, profile_id: ProfileId) -> Result<Vec<RecognitionView>> {
        let store = self.open_migrated_store()?;
        require_profile(&store, profile_id)?;
        store.list_recognition_views(profile_id)
    }

    /// Compute the aggregate from the ledger at `as_of` (default now) without caching it.
    ///
    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the profile does not exist.
    pub fn get_aggregate(
        &self,
        profile_id: ProfileId,
        as_of: Option<OffsetDateTime>,
    ) -> Result<RecognitionAggregate> {
        let store = self.open_migrated_store()?;
        require_profile(&store, profile_id)?;
        let entries = store.list_entries(profile_id)?;
        Ok(compute_score(
            &entries,
            as_of.unwrap_or_else(OffsetDateTime::now_utc),
            &self.weights,
        ))
    }

    /// Recompute the aggregate and overwrite the profile's cached snapshot.
    ///
    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the profile does not exist.
    pub fn rebuild_aggregate(
        &self,
        profile_id: ProfileId,
        as_of: Option<OffsetDateTime>,
    ) -> Result<RecognitionAggregate> {
        let mut store = self.open_migrated_store()?;
        let previous = require_profile(&store, profile_id)?.recognition;
        let now = as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let aggregate = store.refresh_aggregate(profile_id, now, &self.weights)?;

        self.emit_audit(AuditEvent {
            audit_id: Ulid::new(),
            action: "aggregate_rebuild".to_string(),
            target: profile_id.to_string(),
            actor: "operator".to_string(),
            metadata: serde_json::json!({
                "previous_score": previous.score,
                "score": aggregate.score,
            }),
            created_at: now,
        });
        tracing::info!(
            profile_id = %profile_id,
            previous_score = previous.score,
            score = aggregate.score,
            "recognition aggregate rebuilt"
        );
        Ok(aggregate)
    }

    /// Walk a profile's hash chain and report the first break, if any.
    ///
    /// # Errors
    /// Returns [`RecognitionError::NotFound`] (wrapped) when the profile does not exist.
    pub fn verify_chain(&self, profile_id: ProfileId) -> Result<ChainVerification> {
        let store = self.open_migrated_store()?;
        require_profile(&store, profile_id)?;
        verify_profile_chain(&store, profile_id)
    }

    /// # Errors
    /// Returns an error when any profile's ledger cannot be read.
    pub fn verify_all_chains(&self) -> Result<Vec<ProfileChainReport>> {
        let store = self.open_migrated_store()?;
        let mut reports = Vec::new();
        for profile_id in store.list_profile_ids()? {
            let verification = verify_profile_chain(&store, profile_id)?;
            reports.push(ProfileChainReport { profile_id, verification });
        }
        Ok(reports)
    }

    /// # Errors
    /// Returns an error when the audit table cannot be read.
    pub fn list_audit_events(&self, target: Option<&str>) -> Result<Vec<AuditEvent>> {
        let store = self.open_migrated_store()?;
        store.list_audit_events(target)
    }

    fn emit_audit(&self, event: AuditEvent) {
        if let Err(err) = self.audit.record(&event) {
            tracing::warn!(
                action = %event.action,
                target = %event.target,
                error = %err,
                "audit event could not be recorded"
            );
        }
    }
}

fn require_profile(store: &SqliteStore, profile_id: ProfileId) -> Result<ProfileRecord> {
    store
        .get_profile(profile_id)?
        .ok_or_else(|| RecognitionError::NotFound("profile".to_string()).into())
}

fn verify_profile_chain(store: &SqliteStore, profile_id: ProfileId) -> Result<ChainVerification> {
    let entries = store.list_entries(profile_id)?;
    let verification = verify_chain(&entries);
    if !verification.valid {
        tracing::warn!(
            profile_id = %profile_id,
            broken_at_index = ?verification.broken_at_index,
            reason = ?verification.reason,
            "recognition chain broken"
        );
    }
    Ok(verification)
}
