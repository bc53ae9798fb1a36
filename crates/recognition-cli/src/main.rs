use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use recognition_api::{
    load_weight_config, AddRecognitionRequest, CreateProfileRequest, RecognitionApi,
    RegisterUserRequest, RequestMetadata,
};
use recognition_core::{
    ProfileId, ProfileStatus, RecognitionError, RecognitionType, UserId, VerificationStatus,
};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "recog")]
#[command(about = "Recognition ledger CLI")]
struct Cli {
    #[arg(long, env = "RECOGNITION_DB", default_value = "./recognition.sqlite3")]
    db: PathBuf,

    /// YAML weight table; built-in defaults apply when omitted.
    #[arg(long, env = "RECOGNITION_WEIGHTS")]
    weights: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Recognition {
        #[command(subcommand)]
        command: Box<RecognitionCommand>,
    },
    Weights {
        #[command(subcommand)]
        command: WeightsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add(UserAddArgs),
    Verify(UserVerifyArgs),
}

#[derive(Debug, Args)]
struct UserAddArgs {
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    role: String,
    #[arg(long, value_enum, default_value_t = VerificationArg::Unverified)]
    verification: VerificationArg,
    #[arg(long)]
    user_id: Option<String>,
}

#[derive(Debug, Args)]
struct UserVerifyArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long, value_enum, default_value_t = VerificationArg::Verified)]
    status: VerificationArg,
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    Add(ProfileAddArgs),
    Status(ProfileStatusArgs),
    Show(ProfileArgs),
}

#[derive(Debug, Args)]
struct ProfileAddArgs {
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    owner_id: Option<String>,
    #[arg(long)]
    profile_id: Option<String>,
}

#[derive(Debug, Args)]
struct ProfileStatusArgs {
    #[arg(long)]
    profile_id: String,
    #[arg(long, value_enum)]
    status: ProfileStatusArg,
}

#[derive(Debug, Args)]
struct ProfileArgs {
    #[arg(long)]
    profile_id: String,
}

#[derive(Debug, Subcommand)]
enum RecognitionCommand {
    Add(RecognitionAddArgs),
    List(ProfileArgs),
    Aggregate(AsOfArgs),
    Rebuild(AsOfArgs),
    VerifyChain(VerifyChainArgs),
    Audit(AuditArgs),
}

#[derive(Debug, Args)]
struct RecognitionAddArgs {
    #[arg(long)]
    profile_id: String,
    #[arg(long)]
    recognizer_id: String,
    #[arg(long = "type", value_enum)]
    recognition_type: RecognitionTypeArg,
    #[arg(long)]
    relationship: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    /// Write clock override (RFC3339, UTC).
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct AsOfArgs {
    #[arg(long)]
    profile_id: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct VerifyChainArgs {
    /// Verify a single profile; every profile is checked when omitted.
    #[arg(long)]
    profile_id: Option<String>,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long)]
    target: Option<String>,
}

#[derive(Debug, Subcommand)]
enum WeightsCommand {
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
enum VerificationArg {
    Unverified,
    Pending,
    Verified,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
enum ProfileStatusArg {
    Active,
    Hidden,
    Deleted,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
enum RecognitionTypeArg {
    KnowPersonally,
    KnowFamily,
    VerifiedDocuments,
    CommunityReference,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("recognition_cli=info".parse()?)
                .add_directive("recognition_api=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let weights = load_weight_config(cli.weights.as_deref())?;
    tracing::debug!(db = %cli.db.display(), half_life_weeks = weights.half_life_weeks, "weights loaded");
    let api = RecognitionApi::new(cli.db).with_weights(weights)?;

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::User { command } => run_user(command, &api),
        Command::Profile { command } => run_profile(command, &api),
        Command::Recognition { command } => run_recognition(*command, &api),
        Command::Weights { command: WeightsCommand::Show } => emit(api.weights()),
    }
}

fn run_db(command: DbCommand, api: &RecognitionApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_user(command: UserCommand, api: &RecognitionApi) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let user = api.register_user(RegisterUserRequest {
                user_id: args.user_id.as_deref().map(parse_id::<UserId>).transpose()?,
                display_name: args.display_name,
                role: args.role,
                verification: Some(args.verification.into_verification()),
            })?;
            emit(&user)
        }
        UserCommand::Verify(args) => {
            let user = api.set_user_verification(
                parse_id::<UserId>(&args.user_id)?,
                args.status.into_verification(),
            )?;
            emit(&user)
        }
    }
}

fn run_profile(command: ProfileCommand, api: &RecognitionApi) -> Result<()> {
    match command {
        ProfileCommand::Add(args) => {
            let profile = api.create_profile(CreateProfileRequest {
                profile_id: args.profile_id.as_deref().map(parse_id::<ProfileId>).transpose()?,
                display_name: args.display_name,
                owner_id: args.owner_id.as_deref().map(parse_id::<UserId>).transpose()?,
            })?;
            emit(&profile)
        }
        ProfileCommand::Status(args) => {
            let profile = api.set_profile_status(
                parse_id::<ProfileId>(&args.profile_id)?,
                args.status.into_profile_status(),
            )?;
            emit(&profile)
        }
        ProfileCommand::Show(args) => emit(&api.get_profile(parse_id(&args.profile_id)?)?),
    }
}

fn run_recognition(command: RecognitionCommand, api: &RecognitionApi) -> Result<()> {
    match command {
        RecognitionCommand::Add(args) => {
            let request = AddRecognitionRequest {
                profile_id: parse_id(&args.profile_id)?,
                recognizer_id: parse_id(&args.recognizer_id)?,
                recognition_type: args.recognition_type.into_recognition_type(),
                relationship: args.relationship,
                notes: args.notes,
                metadata: RequestMetadata {
                    ip_address: None,
                    user_agent: Some(format!("recog/{}", env!("CARGO_PKG_VERSION"))),
                },
            };
            let result = match args.at.as_deref() {
                Some(raw) => api.add_recognition_at(request, parse_rfc3339(raw)?)?,
                None => api.add_recognition(request)?,
            };
            emit(&result)
        }
        RecognitionCommand::List(args) => {
            let profile_id = parse_id::<ProfileId>(&args.profile_id)?;
            let recognitions = api.list_recognitions(profile_id)?;
            emit_json(serde_json::json!({
                "profile_id": profile_id,
                "recognitions": recognitions
            }))
        }
        RecognitionCommand::Aggregate(args) => {
            let as_of = args.as_of.as_deref().map(parse_rfc3339).transpose()?;
            emit(&api.get_aggregate(parse_id(&args.profile_id)?, as_of)?)
        }
        RecognitionCommand::Rebuild(args) => {
            let as_of = args.as_of.as_deref().map(parse_rfc3339).transpose()?;
            emit(&api.rebuild_aggregate(parse_id(&args.profile_id)?, as_of)?)
        }
        RecognitionCommand::VerifyChain(args) => match args.profile_id.as_deref() {
            Some(raw) => emit(&api.verify_chain(parse_id(raw)?)?),
            None => {
                let reports = api.verify_all_chains()?;
                let all_valid = reports.iter().all(|report| report.verification.valid);
                emit_json(serde_json::json!({
                    "all_valid": all_valid,
                    "profiles": reports
                }))
            }
        },
        RecognitionCommand::Audit(args) => {
            let events = api.list_audit_events(args.target.as_deref())?;
            emit_json(serde_json::json!({ "events": events }))
        }
    }
}

fn parse_id<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = RecognitionError>,
{
    Ok(T::from_str(value)?)
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

impl VerificationArg {
    fn into_verification(self) -> VerificationStatus {
        match self {
            Self::Unverified => VerificationStatus::Unverified,
            Self::Pending => VerificationStatus::Pending,
            Self::Verified => VerificationStatus::Verified,
        }
    }
}

impl ProfileStatusArg {
    fn into_profile_status(self) -> ProfileStatus {
        match self {
            Self::Active => ProfileStatus::Active,
            Self::Hidden => ProfileStatus::Hidden,
            Self::Deleted => ProfileStatus::Deleted,
        }
    }
}

impl RecognitionTypeArg {
    fn into_recognition_type(self) -> RecognitionType {
        match self {
            Self::KnowPersonally => RecognitionType::KnowPersonally,
            Self::KnowFamily => RecognitionType::KnowFamily,
            Self::VerifiedDocuments => RecognitionType::VerifiedDocuments,
            Self::CommunityReference => RecognitionType::CommunityReference,
        }
    }
}
