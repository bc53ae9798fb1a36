use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub const MAX_RELATIONSHIP_CHARS: usize = 100;
pub const MAX_NOTES_CHARS: usize = 500;

/// Weight applied when a role or recognition type has no entry in the weight table.
pub const FALLBACK_WEIGHT: f64 = 1.0;

pub const DUPLICATE_RECOGNITION_MESSAGE: &str =
    "You have already provided this type of recognition for this profile";

const SECONDS_PER_WEEK: f64 = 7.0 * 24.0 * 60.0 * 60.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecognitionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("invalid weight configuration: {0}")]
    InvalidConfig(String),
}

impl RecognitionError {
    /// Stable machine-readable category used by the CLI and HTTP surfaces.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = RecognitionError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value.trim()).map(Self).map_err(|err| {
                    RecognitionError::Validation(format!(
                        "{} MUST be a valid ULID ({value}): {err}",
                        $label
                    ))
                })
            }
        }
    };
}

ulid_id!(UserId, "user_id");
ulid_id!(ProfileId, "profile_id");
ulid_id!(EntryId, "entry_id");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionType {
    KnowPersonally,
    KnowFamily,
    VerifiedDocuments,
    CommunityReference,
}

impl RecognitionType {
    pub const ALL: [Self; 4] =
        [Self::KnowPersonally, Self::KnowFamily, Self::VerifiedDocuments, Self::CommunityReference];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KnowPersonally => "know_personally",
            Self::KnowFamily => "know_family",
            Self::VerifiedDocuments => "verified_documents",
            Self::CommunityReference => "community_reference",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "know_personally" => Some(Self::KnowPersonally),
            "know_family" => Some(Self::KnowFamily),
            "verified_documents" => Some(Self::VerifiedDocuments),
            "community_reference" => Some(Self::CommunityReference),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    New,
    Low,
    Moderate,
    High,
}

impl TrustLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "low" => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Unverified,
    Pending,
    Verified,
}

impl VerificationStatus {
    #[must_use]
    pub fn is_verified(self) -> bool {
        self == Self::Verified
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Pending => "pending",
            Self::Verified => "verified",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unverified" => Some(Self::Unverified),
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Active,
    Hidden,
    Deleted,
}

impl ProfileStatus {
    /// Terminal profiles accept no new recognitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Deleted
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Hidden => "hidden",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "hidden" => Some(Self::Hidden),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelThreshold {
    pub level: TrustLevel,
    pub min: f64,
    /// Exclusive upper bound; `None` marks the open-ended top range.
    pub max: Option<f64>,
}

impl LevelThreshold {
    fn contains(&self, score: f64) -> bool {
        score >= self.min && self.max.map_or(true, |max| score < max)
    }
}

/// Scoring policy shared by the calculator and the recognition service.
///
/// Loaded once at process start and never mutated afterwards; historical entries keep the
/// `base_weight` they were written with even when this table changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeightConfig {
    pub role_weights: BTreeMap<String, f64>,
    pub type_multipliers: BTreeMap<RecognitionType, f64>,
    pub level_thresholds: Vec<LevelThreshold>,
    pub half_life_weeks: f64,
    pub decay_floor: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        let role_weights = [
            ("admin", 10.0),
            ("elder", 8.0),
            ("matchmaker", 6.0),
            ("moderator", 5.0),
            ("member", 3.0),
        ]
        .into_iter()
        .map(|(role, weight)| (role.to_string(), weight))
        .collect();

        let type_multipliers = [
            (RecognitionType::KnowPersonally, 1.0),
            (RecognitionType::KnowFamily, 1.3),
            (RecognitionType::VerifiedDocuments, 1.2),
            (RecognitionType::CommunityReference, 0.8),
        ]
        .into_iter()
        .collect();

        Self {
            role_weights,
            type_multipliers,
            level_thresholds: default_level_thresholds(),
            half_life_weeks: 52.0,
            decay_floor: 0.1,
        }
    }
}

/// Partial weight table as written in a YAML file.
///
/// Map entries are merged key by key over the defaults; `level_thresholds` replaces the
/// default ranges as a whole because the ranges are only valid as a contiguous set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WeightOverrides {
    pub role_weights: BTreeMap<String, f64>,
    pub type_multipliers: BTreeMap<RecognitionType, f64>,
    pub level_thresholds: Option<Vec<LevelThreshold>>,
    pub half_life_weeks: Option<f64>,
    pub decay_floor: Option<f64>,
}

#[must_use]
pub fn default_level_thresholds() -> Vec<LevelThreshold> {
    vec![
        LevelThreshold { level: TrustLevel::New, min: 0.0, max: Some(5.0) },
        LevelThreshold { level: TrustLevel::Low, min: 5.0, max: Some(20.0) },
        LevelThreshold { level: TrustLevel::Moderate, min: 20.0, max: Some(50.0) },
        LevelThreshold { level: TrustLevel::High, min: 50.0, max: None },
    ]
}

impl WeightConfig {
    /// Role weight lookup; unmapped roles degrade to [`FALLBACK_WEIGHT`] instead of failing.
    #[must_use]
    pub fn role_weight(&self, role: &str) -> f64 {
        self.role_weights.get(role.trim()).copied().unwrap_or(FALLBACK_WEIGHT)
    }

    #[must_use]
    pub fn type_multiplier(&self, recognition_type: RecognitionType) -> f64 {
        self.type_multipliers.get(&recognition_type).copied().unwrap_or(FALLBACK_WEIGHT)
    }

    #[must_use]
    pub fn base_weight(&self, role: &str, recognition_type: RecognitionType) -> f64 {
        self.role_weight(role) * self.type_multiplier(recognition_type)
    }

    /// Layer file overrides on top of this table. The result still needs [`Self::validate`].
    #[must_use]
    pub fn with_overrides(mut self, overrides: WeightOverrides) -> Self {
        self.role_weights.extend(overrides.role_weights);
        self.type_multipliers.extend(overrides.type_multipliers);
        if let Some(level_thresholds) = overrides.level_thresholds {
            self.level_thresholds = level_thresholds;
        }
        if let Some(half_life_weeks) = overrides.half_life_weeks {
            self.half_life_weeks = half_life_weeks;
        }
        if let Some(decay_floor) = overrides.decay_floor {
            self.decay_floor = decay_floor;
        }
        self
    }

    /// Map a score onto the ordered threshold ranges, defaulting to [`TrustLevel::New`].
    #[must_use]
    pub fn level_for_score(&self, score: f64) -> TrustLevel {
        self.level_thresholds
            .iter()
            .find(|threshold| threshold.contains(score))
            .map_or(TrustLevel::New, |threshold| threshold.level)
    }

    /// Check the table before it is installed for the lifetime of the process.
    ///
    /// # Errors
    /// Returns [`RecognitionError::InvalidConfig`] when decay parameters are out of range,
    /// a weight is negative or non-finite, or the level thresholds are not contiguous.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        if !self.half_life_weeks.is_finite() || self.half_life_weeks <= 0.0 {
            return Err(RecognitionError::InvalidConfig(
                "half_life_weeks MUST be a positive number".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.decay_floor) {
            return Err(RecognitionError::InvalidConfig(
                "decay_floor MUST be in [0.0, 1.0]".to_string(),
            ));
        }

        for (role, weight) in &self.role_weights {
            if role.trim().is_empty() {
                return Err(RecognitionError::InvalidConfig(
                    "role names MUST be non-empty".to_string(),
                ));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(RecognitionError::InvalidConfig(format!(
                    "role weight for {role} MUST be a non-negative number"
                )));
            }
        }

        for (recognition_type, multiplier) in &self.type_multipliers {
            if !multiplier.is_finite() || *multiplier < 0.0 {
                return Err(RecognitionError::InvalidConfig(format!(
                    "type multiplier for {} MUST be a non-negative number",
                    recognition_type.as_str()
                )));
            }
        }

        self.validate_thresholds()
    }

    fn validate_thresholds(&self) -> Result<(), RecognitionError> {
        let Some((last, leading)) = self.level_thresholds.split_last() else {
            return Err(RecognitionError::InvalidConfig(
                "level_thresholds MUST contain at least one range".to_string(),
            ));
        };

        if last.max.is_some() {
            return Err(RecognitionError::InvalidConfig(
                "the last level threshold MUST be open-ended".to_string(),
            ));
        }

        let mut expected_min = 0.0_f64;
        for threshold in leading {
            let Some(max) = threshold.max else {
                return Err(RecognitionError::InvalidConfig(format!(
                    "only the last level threshold may be open-ended (found {})",
                    threshold.level.as_str()
                )));
            };
            if threshold.min.to_bits() != expected_min.to_bits() || max <= threshold.min {
                return Err(RecognitionError::InvalidConfig(format!(
                    "level threshold {} MUST start at {expected_min} and end above its min",
                    threshold.level.as_str()
                )));
            }
            expected_min = max;
        }

        if last.min.to_bits() != expected_min.to_bits() {
            return Err(RecognitionError::InvalidConfig(format!(
                "level threshold {} MUST start at {expected_min}",
                last.level.as_str()
            )));
        }

        Ok(())
    }
}

/// One immutable attestation in a profile's recognition ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecognitionEntry {
    pub entry_id: EntryId,
    pub profile_id: ProfileId,
    pub recognizer_id: UserId,
    pub recognition_type: RecognitionType,
    pub relationship: Option<String>,
    pub notes: Option<String>,
    pub base_weight: f64,
    pub recognizer_role: String,
    pub entry_hash: String,
    pub previous_entry_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl RecognitionEntry {
    /// Seal a validated draft into a ledger entry chained onto `previous_entry_hash`.
    ///
    /// `created_at` is truncated to millisecond precision so the stored timestamp and the
    /// hash input are the same value.
    #[must_use]
    pub fn seal(
        draft: RecognitionDraft,
        previous_entry_hash: Option<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        let created_at = truncate_to_millis(created_at);
        let entry_hash =
            entry_hash(draft.profile_id, draft.recognizer_id, draft.recognition_type, created_at);

        Self {
            entry_id: EntryId::new(),
            profile_id: draft.profile_id,
            recognizer_id: draft.recognizer_id,
            recognition_type: draft.recognition_type,
            relationship: draft.relationship,
            notes: draft.notes,
            base_weight: draft.base_weight,
            recognizer_role: draft.recognizer_role,
            entry_hash,
            previous_entry_hash,
            created_at,
        }
    }

    #[must_use]
    pub fn recompute_hash(&self) -> String {
        entry_hash(self.profile_id, self.recognizer_id, self.recognition_type, self.created_at)
    }

    /// Validate the stored shape of an entry.
    ///
    /// # Errors
    /// Returns [`RecognitionError::Validation`] when text bounds, weight, or hash format
    /// constraints are violated.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        validate_text_bounds(self.relationship.as_deref(), self.notes.as_deref())?;
        validate_base_weight(self.base_weight)?;

        if !is_hex_digest(&self.entry_hash) {
            return Err(RecognitionError::Validation(
                "entry_hash MUST be a lowercase hex SHA-256 digest".to_string(),
            ));
        }

        if let Some(previous) = &self.previous_entry_hash {
            if !is_hex_digest(previous) {
                return Err(RecognitionError::Validation(
                    "previous_entry_hash MUST be a lowercase hex SHA-256 digest".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Everything about a recognition that is known before the ledger position is.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionDraft {
    pub profile_id: ProfileId,
    pub recognizer_id: UserId,
    pub recognition_type: RecognitionType,
    pub relationship: Option<String>,
    pub notes: Option<String>,
    pub recognizer_role: String,
    pub base_weight: f64,
}

impl RecognitionDraft {
    /// Build a draft, normalizing optional text and snapshotting the recognizer's role.
    ///
    /// # Errors
    /// Returns [`RecognitionError::Validation`] when text exceeds its bound or the computed
    /// weight is not a non-negative number.
    pub fn new(
        profile_id: ProfileId,
        recognizer_id: UserId,
        recognition_type: RecognitionType,
        relationship: Option<String>,
        notes: Option<String>,
        recognizer_role: &str,
        config: &WeightConfig,
    ) -> Result<Self, RecognitionError> {
        let relationship = normalize_optional_text(relationship);
        let notes = normalize_optional_text(notes);
        validate_text_bounds(relationship.as_deref(), notes.as_deref())?;

        let base_weight = config.base_weight(recognizer_role, recognition_type);
        validate_base_weight(base_weight)?;

        Ok(Self {
            profile_id,
            recognizer_id,
            recognition_type,
            relationship,
            notes,
            recognizer_role: recognizer_role.trim().to_string(),
            base_weight,
        })
    }
}

/// Denormalized recognition snapshot cached on a profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecognitionAggregate {
    pub score: f64,
    pub level: TrustLevel,
    pub recognizer_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_recognition_at: Option<OffsetDateTime>,
}

impl Default for RecognitionAggregate {
    fn default() -> Self {
        Self { score: 0.0, level: TrustLevel::New, recognizer_count: 0, last_recognition_at: None }
    }
}

/// Identity-store view of a user as the engine consumes it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub role: String,
    pub verification: VerificationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UserRecord {
    /// # Errors
    /// Returns [`RecognitionError::Validation`] when the name or role is blank or too long.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        validate_label("display_name", &self.display_name)?;
        validate_label("role", &self.role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileRecord {
    pub profile_id: ProfileId,
    pub owner_id: Option<UserId>,
    pub display_name: String,
    pub status: ProfileStatus,
    pub recognition: RecognitionAggregate,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ProfileRecord {
    /// # Errors
    /// Returns [`RecognitionError::Validation`] when the display name is blank or too long.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        validate_label("display_name", &self.display_name)
    }
}

/// A ledger entry joined with the recognizer's current identity for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecognitionView {
    #[serde(flatten)]
    pub entry: RecognitionEntry,
    pub recognizer_name: Option<String>,
    pub recognizer_current_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub audit_id: Ulid,
    pub action: String,
    pub target: String,
    pub actor: String,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const MAX_LABEL_CHARS: usize = 120;

fn validate_label(field: &str, value: &str) -> Result<(), RecognitionError> {
    if value.trim().is_empty() {
        return Err(RecognitionError::Validation(format!("{field} MUST be provided")));
    }
    if value.chars().count() > MAX_LABEL_CHARS {
        return Err(RecognitionError::Validation(format!(
            "{field} MUST be at most {MAX_LABEL_CHARS} characters"
        )));
    }
    Ok(())
}

#[must_use]
pub fn normalize_optional_text(value: Option<String>) -> Option<String> {
    value.map(|text| text.trim().to_string()).filter(|text| !text.is_empty())
}

/// Validate free-text bounds shared by drafts and stored entries.
///
/// # Errors
/// Returns [`RecognitionError::Validation`] when either field exceeds its character bound.
pub fn validate_text_bounds(
    relationship: Option<&str>,
    notes: Option<&str>,
) -> Result<(), RecognitionError> {
    if relationship.is_some_and(|text| text.chars().count() > MAX_RELATIONSHIP_CHARS) {
        return Err(RecognitionError::Validation(format!(
            "relationship MUST be at most {MAX_RELATIONSHIP_CHARS} characters"
        )));
    }

    if notes.is_some_and(|text| text.chars().count() > MAX_NOTES_CHARS) {
        return Err(RecognitionError::Validation(format!(
            "notes MUST be at most {MAX_NOTES_CHARS} characters"
        )));
    }

    Ok(())
}

fn validate_base_weight(base_weight: f64) -> Result<(), RecognitionError> {
    if !base_weight.is_finite() || base_weight < 0.0 {
        return Err(RecognitionError::Validation(
            "base_weight MUST be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

fn is_hex_digest(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
}

#[must_use]
pub fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    value - Duration::nanoseconds(i64::from(value.nanosecond() % 1_000_000))
}

#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(i64::MAX)
}

/// Deterministic chain hash over the identity of an attestation and its write time.
#[must_use]
pub fn entry_hash(
    profile_id: ProfileId,
    recognizer_id: UserId,
    recognition_type: RecognitionType,
    created_at: OffsetDateTime,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(profile_id.to_string().as_bytes());
    hasher.update(recognizer_id.to_string().as_bytes());
    hasher.update(recognition_type.as_str().as_bytes());
    hasher.update(unix_millis(created_at).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn age_in_weeks(created_at: OffsetDateTime, now: OffsetDateTime) -> f64 {
    let seconds = (now - created_at).as_seconds_f64();
    if seconds <= 0.0 {
        return 0.0;
    }
    seconds / SECONDS_PER_WEEK
}

#[must_use]
pub fn decay_factor(age_weeks: f64, half_life_weeks: f64) -> f64 {
    0.5_f64.powf(age_weeks / half_life_weeks)
}

/// Weight an entry still contributes at `now`; never below `base_weight * decay_floor`.
#[must_use]
pub fn decayed_weight(entry: &RecognitionEntry, now: OffsetDateTime, config: &WeightConfig) -> f64 {
    let factor = decay_factor(age_in_weeks(entry.created_at, now), config.half_life_weeks);
    (entry.base_weight * factor).max(entry.base_weight * config.decay_floor)
}

#[must_use]
pub fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Compute a profile's point-in-time recognition aggregate from its full ledger.
///
/// Entry order does not matter. This is the only place a score is derived.
#[must_use]
pub fn compute_score(
    entries: &[RecognitionEntry],
    now: OffsetDateTime,
    config: &WeightConfig,
) -> RecognitionAggregate {
    let total = entries.iter().map(|entry| decayed_weight(entry, now, config)).sum::<f64>();
    let score = round_to_tenth(total).max(0.0);

    let recognizers = entries.iter().map(|entry| entry.recognizer_id).collect::<BTreeSet<_>>();
    let recognizer_count = u32::try_from(recognizers.len()).unwrap_or(u32::MAX);

    RecognitionAggregate {
        score,
        level: config.level_for_score(score),
        recognizer_count,
        last_recognition_at: entries.iter().map(|entry| entry.created_at).max(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreak {
    PreviousHashMismatch,
    EntryHashMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries_checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ChainBreak>,
}

/// Walk a profile's entries in creation order and report the earliest break.
///
/// `entries` MUST already be ordered oldest first. The walk stops at the first entry whose
/// `previous_entry_hash` does not match its predecessor, or whose own hash no longer matches
/// its stored fields.
#[must_use]
pub fn verify_chain(entries: &[RecognitionEntry]) -> ChainVerification {
    let mut expected_previous: Option<&str> = None;

    for (index, entry) in entries.iter().enumerate() {
        let reason = if entry.previous_entry_hash.as_deref() != expected_previous {
            Some(ChainBreak::PreviousHashMismatch)
        } else if entry.entry_hash != entry.recompute_hash() {
            Some(ChainBreak::EntryHashMismatch)
        } else {
            None
        };

        if let Some(reason) = reason {
            return ChainVerification {
                valid: false,
                entries_checked: index + 1,
                broken_at_index: Some(index),
                entry_id: Some(entry.entry_id),
                reason: Some(reason),
            };
        }

        expected_previous = Some(entry.entry_hash.as_str());
    }

    ChainVerification {
        valid: true,
        entries_checked: entries.len(),
        broken_at_index: None,
        entry_id: None,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_profile() -> ProfileId {
        match ProfileId::from_str("01J0RQ3K6D4V5P0M7XW2Z8Y9AB") {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture ULID: {err}"),
        }
    }

    fn mk_draft(recognizer_id: UserId, recognition_type: RecognitionType, role: &str) -> RecognitionDraft {
        match RecognitionDraft::new(
            fixture_profile(),
            recognizer_id,
            recognition_type,
            Some("family friend".to_string()),
            None,
            role,
            &WeightConfig::default(),
        ) {
            Ok(draft) => draft,
            Err(err) => panic!("fixture draft should build: {err}"),
        }
    }

    fn mk_entry(base_weight: f64, created_at: OffsetDateTime) -> RecognitionEntry {
        let mut draft = mk_draft(UserId::new(), RecognitionType::KnowPersonally, "member");
        draft.base_weight = base_weight;
        RecognitionEntry::seal(draft, None, created_at)
    }

    fn mk_chain(length: usize) -> Vec<RecognitionEntry> {
        let mut entries: Vec<RecognitionEntry> = Vec::new();
        for index in 0..length {
            let previous = entries.last().map(|entry| entry.entry_hash.clone());
            let offset = i64::try_from(index).unwrap_or(i64::MAX);
            entries.push(RecognitionEntry::seal(
                mk_draft(UserId::new(), RecognitionType::KnowFamily, "elder"),
                previous,
                fixture_time() + Duration::minutes(offset),
            ));
        }
        entries
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn level_thresholds_are_lower_inclusive() {
        let config = WeightConfig::default();
        assert_eq!(config.level_for_score(0.0), TrustLevel::New);
        assert_eq!(config.level_for_score(4.9), TrustLevel::New);
        assert_eq!(config.level_for_score(5.0), TrustLevel::Low);
        assert_eq!(config.level_for_score(20.0), TrustLevel::Moderate);
        assert_eq!(config.level_for_score(49.99), TrustLevel::Moderate);
        assert_eq!(config.level_for_score(50.0), TrustLevel::High);
        assert_eq!(config.level_for_score(10_000.0), TrustLevel::High);
    }

    #[test]
    fn level_falls_back_to_new_when_no_range_matches() {
        let config = WeightConfig::default();
        assert_eq!(config.level_for_score(-1.0), TrustLevel::New);
        assert_eq!(config.level_for_score(f64::NAN), TrustLevel::New);
    }

    #[test]
    fn unmapped_roles_and_known_roles_weigh_as_configured() {
        let config = WeightConfig::default();
        assert_close(config.base_weight("elder", RecognitionType::KnowFamily), 10.4);
        assert_close(config.base_weight("admin", RecognitionType::VerifiedDocuments), 12.0);
        assert_close(config.base_weight("astrologer", RecognitionType::KnowPersonally), 1.0);

        let mut sparse = WeightConfig::default();
        sparse.type_multipliers.clear();
        assert_close(sparse.base_weight("elder", RecognitionType::CommunityReference), 8.0);
    }

    #[test]
    fn half_life_halves_weight_each_period() {
        let config = WeightConfig::default();
        let entry = mk_entry(10.0, fixture_time());

        assert_close(decayed_weight(&entry, fixture_time(), &config), 10.0);
        assert_close(decayed_weight(&entry, fixture_time() + Duration::weeks(52), &config), 5.0);
        assert_close(decayed_weight(&entry, fixture_time() + Duration::weeks(104), &config), 2.5);
    }

    #[test]
    fn decay_never_drops_below_floor() {
        let config = WeightConfig::default();
        let entry = mk_entry(10.0, fixture_time());
        let ancient = fixture_time() + Duration::weeks(52 * 40);

        assert_close(decayed_weight(&entry, ancient, &config), 1.0);
    }

    #[test]
    fn future_dated_entries_count_at_full_weight() {
        let config = WeightConfig::default();
        let entry = mk_entry(6.0, fixture_time() + Duration::days(3));
        assert_close(decayed_weight(&entry, fixture_time(), &config), 6.0);
    }

    #[test]
    fn empty_ledger_yields_default_aggregate() {
        let aggregate = compute_score(&[], fixture_time(), &WeightConfig::default());
        assert_eq!(aggregate, RecognitionAggregate::default());
    }

    #[test]
    fn recognizer_with_two_types_counts_once() {
        let config = WeightConfig::default();
        let recognizer = UserId::new();
        let first = RecognitionEntry::seal(
            mk_draft(recognizer, RecognitionType::KnowPersonally, "member"),
            None,
            fixture_time(),
        );
        let second = RecognitionEntry::seal(
            mk_draft(recognizer, RecognitionType::KnowFamily, "member"),
            Some(first.entry_hash.clone()),
            fixture_time() + Duration::seconds(1),
        );

        let aggregate = compute_score(&[first, second.clone()], fixture_time(), &config);
        assert_eq!(aggregate.recognizer_count, 1);
        assert_close(aggregate.score, 6.9);
        assert_eq!(aggregate.last_recognition_at, Some(second.created_at));
    }

    #[test]
    fn score_is_rounded_to_one_decimal() {
        let config = WeightConfig::default();
        let entries = vec![mk_entry(1.04, fixture_time()), mk_entry(2.02, fixture_time())];
        let aggregate = compute_score(&entries, fixture_time(), &config);
        assert_close(aggregate.score, 3.1);
    }

    #[test]
    fn elder_then_admin_scenario_stays_low() {
        let config = WeightConfig::default();
        let t0 = fixture_time();
        let elder = RecognitionEntry::seal(
            mk_draft(UserId::new(), RecognitionType::KnowFamily, "elder"),
            None,
            t0,
        );
        assert_close(elder.base_weight, 10.4);

        let at_t0 = compute_score(std::slice::from_ref(&elder), t0, &config);
        assert_close(at_t0.score, 10.4);
        assert_eq!(at_t0.level, TrustLevel::Low);

        let one_year = compute_score(std::slice::from_ref(&elder), t0 + Duration::weeks(52), &config);
        assert_close(one_year.score, 5.2);
        assert_eq!(one_year.level, TrustLevel::Low);

        let admin = RecognitionEntry::seal(
            mk_draft(UserId::new(), RecognitionType::VerifiedDocuments, "admin"),
            Some(elder.entry_hash.clone()),
            t0 + Duration::weeks(52),
        );
        assert_close(admin.base_weight, 12.0);

        let combined = compute_score(&[elder, admin], t0 + Duration::weeks(53), &config);
        assert_close(combined.score, 17.0);
        assert_eq!(combined.level, TrustLevel::Low);
        assert_eq!(combined.recognizer_count, 2);
    }

    #[test]
    fn seal_truncates_timestamp_and_hash_uses_same_value() {
        let raw = fixture_time() + Duration::nanoseconds(123_456_789);
        let entry = RecognitionEntry::seal(
            mk_draft(UserId::new(), RecognitionType::KnowPersonally, "member"),
            None,
            raw,
        );

        assert_eq!(entry.created_at.nanosecond(), 123_000_000);
        assert_eq!(entry.entry_hash, entry.recompute_hash());
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn entry_hash_is_deterministic_and_input_sensitive() {
        let profile = fixture_profile();
        let recognizer = UserId::new();
        let a = entry_hash(profile, recognizer, RecognitionType::KnowFamily, fixture_time());
        let b = entry_hash(profile, recognizer, RecognitionType::KnowFamily, fixture_time());
        let c = entry_hash(profile, recognizer, RecognitionType::KnowPersonally, fixture_time());
        let d = entry_hash(
            profile,
            recognizer,
            RecognitionType::KnowFamily,
            fixture_time() + Duration::milliseconds(1),
        );

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn draft_rejects_oversized_text_and_normalizes_blanks() {
        let too_long = "x".repeat(MAX_NOTES_CHARS + 1);
        let err = RecognitionDraft::new(
            fixture_profile(),
            UserId::new(),
            RecognitionType::KnowPersonally,
            None,
            Some(too_long),
            "member",
            &WeightConfig::default(),
        );
        assert!(matches!(err, Err(RecognitionError::Validation(message)) if message.contains("notes")));

        let draft = match RecognitionDraft::new(
            fixture_profile(),
            UserId::new(),
            RecognitionType::KnowPersonally,
            Some("   ".to_string()),
            Some(" neighbour since 2010 ".to_string()),
            " elder ",
            &WeightConfig::default(),
        ) {
            Ok(draft) => draft,
            Err(err) => panic!("draft should build: {err}"),
        };
        assert_eq!(draft.relationship, None);
        assert_eq!(draft.notes.as_deref(), Some("neighbour since 2010"));
        assert_eq!(draft.recognizer_role, "elder");
        assert_close(draft.base_weight, 8.0);
    }

    #[test]
    fn intact_chain_verifies() {
        let entries = mk_chain(5);
        let result = verify_chain(&entries);
        assert!(result.valid);
        assert_eq!(result.entries_checked, 5);
        assert_eq!(result.broken_at_index, None);
        assert!(verify_chain(&[]).valid);
    }

    #[test]
    fn altered_entry_hash_is_reported_at_its_own_index() {
        let mut entries = mk_chain(5);
        entries[2].entry_hash = "0".repeat(64);

        let result = verify_chain(&entries);
        assert!(!result.valid);
        assert_eq!(result.broken_at_index, Some(2));
        assert_eq!(result.entry_id, Some(entries[2].entry_id));
        assert_eq!(result.reason, Some(ChainBreak::EntryHashMismatch));
    }

    #[test]
    fn altered_previous_hash_and_deleted_entry_break_the_chain() {
        let mut relinked = mk_chain(4);
        relinked[0].previous_entry_hash = Some("f".repeat(64));
        let result = verify_chain(&relinked);
        assert_eq!(result.broken_at_index, Some(0));
        assert_eq!(result.reason, Some(ChainBreak::PreviousHashMismatch));

        let mut deleted = mk_chain(4);
        deleted.remove(1);
        let result = verify_chain(&deleted);
        assert_eq!(result.broken_at_index, Some(1));
        assert_eq!(result.reason, Some(ChainBreak::PreviousHashMismatch));
    }

    #[test]
    fn default_config_is_valid_and_round_trips_through_json() {
        let config = WeightConfig::default();
        assert!(config.validate().is_ok());

        let json = match serde_json::to_string(&config) {
            Ok(json) => json,
            Err(err) => panic!("config should serialize: {err}"),
        };
        let parsed: WeightConfig = match serde_json::from_str(&json) {
            Ok(parsed) => parsed,
            Err(err) => panic!("config should deserialize: {err}"),
        };
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: WeightConfig = match serde_json::from_str(r#"{"half_life_weeks": 26.0}"#) {
            Ok(parsed) => parsed,
            Err(err) => panic!("partial config should deserialize: {err}"),
        };
        assert_close(parsed.half_life_weeks, 26.0);
        assert_eq!(parsed.level_thresholds, default_level_thresholds());
        assert_close(parsed.role_weight("elder"), 8.0);
    }

    #[test]
    fn overrides_merge_map_entries_over_defaults() {
        let overrides: WeightOverrides = match serde_json::from_str(
            r#"{"role_weights": {"elder": 9.0, "priest": 4.0}, "type_multipliers": {"know_family": 1.5}}"#,
        ) {
            Ok(overrides) => overrides,
            Err(err) => panic!("overrides should deserialize: {err}"),
        };
        let config = WeightConfig::default().with_overrides(overrides);

        assert_close(config.role_weight("elder"), 9.0);
        assert_close(config.role_weight("priest"), 4.0);
        assert_close(config.role_weight("admin"), 10.0);
        assert_close(config.type_multiplier(RecognitionType::KnowFamily), 1.5);
        assert_close(config.type_multiplier(RecognitionType::VerifiedDocuments), 1.2);
        assert_eq!(config.level_thresholds, default_level_thresholds());
        assert_close(config.half_life_weeks, 52.0);
        assert!(config.validate().is_ok());

        let unknown = serde_json::from_str::<WeightOverrides>(r#"{"half_life": 10.0}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = WeightConfig { half_life_weeks: 0.0, ..WeightConfig::default() };
        assert!(matches!(config.validate(), Err(RecognitionError::InvalidConfig(_))));

        config = WeightConfig { decay_floor: 1.5, ..WeightConfig::default() };
        assert!(matches!(config.validate(), Err(RecognitionError::InvalidConfig(_))));

        config = WeightConfig::default();
        config.role_weights.insert("elder".to_string(), -2.0);
        assert!(matches!(config.validate(), Err(RecognitionError::InvalidConfig(_))));

        config = WeightConfig::default();
        config.level_thresholds.pop();
        assert!(matches!(config.validate(), Err(RecognitionError::InvalidConfig(_))));

        config = WeightConfig::default();
        config.level_thresholds[1].min = 6.0;
        assert!(matches!(config.validate(), Err(RecognitionError::InvalidConfig(_))));
    }

    #[test]
    fn ids_parse_and_reject_garbage() {
        let id = UserId::new();
        assert_eq!(UserId::from_str(&id.to_string()), Ok(id));
        assert!(matches!(
            ProfileId::from_str("not-a-ulid"),
            Err(RecognitionError::Validation(message)) if message.contains("profile_id")
        ));
    }

    proptest! {
        #[test]
        fn property_decay_is_monotonic_and_bounded_by_floor(
            base_weight in 0.1_f64..50.0,
            earlier_days in 0_i64..5_000,
            extra_days in 0_i64..5_000,
        ) {
            let config = WeightConfig::default();
            let entry = mk_entry(base_weight, fixture_time());
            let t1 = fixture_time() + Duration::days(earlier_days);
            let t2 = t1 + Duration::days(extra_days);

            let w1 = decayed_weight(&entry, t1, &config);
            let w2 = decayed_weight(&entry, t2, &config);
            prop_assert!(w2 <= w1);
            prop_assert!(w2 >= base_weight * config.decay_floor);
            prop_assert!(w1 <= base_weight);
        }

        #[test]
        fn property_score_ignores_entry_order(seed in any::<u64>(), weeks in 0_i64..300) {
            let config = WeightConfig::default();
            let entries = mk_chain(6);
            let mut shuffled = entries.clone();
            let len = shuffled.len();
            let rotation = usize::try_from(seed % 6).unwrap_or(0);
            shuffled.rotate_left(rotation);
            if seed % 2 == 0 {
                shuffled.swap(0, len - 1);
            }

            let now = fixture_time() + Duration::weeks(weeks);
            prop_assert_eq!(compute_score(&entries, now, &config), compute_score(&shuffled, now, &config));
        }
    }
}
