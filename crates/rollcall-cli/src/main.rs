use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceRecord, Identity, Method, RecognitionResult};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.Rollcall1",
    default_service = "org.freedesktop.Rollcall1",
    default_path = "/org/freedesktop/Rollcall1"
)]
trait Rollcall {
    fn register_identity(
        &self,
        name: &str,
        cohort: &str,
        roll_number: u32,
    ) -> zbus::Result<String>;
    fn enroll(&self, identity: &str, descriptor: &str) -> zbus::Result<u32>;
    fn issue_token(&self, identity: &str) -> zbus::Result<String>;
    fn roster(&self, cohort: &str) -> zbus::Result<String>;
    fn recognize(&self, cohort: &str, probes: &str) -> zbus::Result<String>;
    fn resolve_token(&self, cohort: &str, token: &str) -> zbus::Result<String>;
    fn commit(
        &self,
        cohort: &str,
        subject: &str,
        present: &str,
        method: &str,
        recorded_by: &str,
    ) -> zbus::Result<String>;
    fn mark_by_token(
        &self,
        cohort: &str,
        subject: &str,
        token: &str,
        recorded_by: &str,
    ) -> zbus::Result<String>;
    fn list_records(&self, cohort: &str, date: &str, limit: u32) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity in a cohort
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        cohort: String,
        #[arg(short, long)]
        roll: u32,
    },
    /// Enroll a descriptor (JSON array of floats) for an identity
    Enroll {
        identity: String,
        #[arg(short, long)]
        descriptor_file: PathBuf,
    },
    /// Issue a scannable token for an identity
    IssueToken { identity: String },
    /// List a cohort's roster
    Roster { cohort: String },
    /// Recognize a group capture's descriptors (JSON array of arrays)
    Recognize {
        cohort: String,
        #[arg(short, long)]
        probes_file: PathBuf,
        /// Commit the recognized present-set as a session of this subject
        #[arg(long)]
        commit: Option<String>,
        #[arg(long, default_value = "")]
        recorded_by: String,
    },
    /// Look up the identity owning a token without recording anything
    Resolve { cohort: String, token: String },
    /// Mark a single attendee by scanned token
    Scan {
        cohort: String,
        token: String,
        #[arg(short, long)]
        subject: String,
        #[arg(long, default_value = "")]
        recorded_by: String,
    },
    /// Commit a present-set by hand
    Commit {
        cohort: String,
        #[arg(short, long)]
        subject: String,
        /// Present identity ids, comma separated
        #[arg(short, long, value_delimiter = ',')]
        present: Vec<String>,
        #[arg(short, long, default_value = "manual")]
        method: Method,
        #[arg(long, default_value = "")]
        recorded_by: String,
    },
    /// Show recent attendance records
    Records {
        #[arg(short, long)]
        cohort: Option<String>,
        /// Day to show (YYYY-MM-DD, UTC)
        #[arg(short, long)]
        date: Option<String>,
        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Register { name, cohort, roll } => {
            let identity: Identity =
                serde_json::from_str(&proxy.register_identity(&name, &cohort, roll).await?)?;
            println!("Registered {} ({}) as {}", identity.name, identity.cohort, identity.id);
        }
        Commands::Enroll {
            identity,
            descriptor_file,
        } => {
            let descriptor = read_json_file(&descriptor_file)?;
            let count = proxy.enroll(&identity, &descriptor).await?;
            println!("Enrolled descriptor for {identity} ({count} total)");
        }
        Commands::IssueToken { identity } => {
            println!("{}", proxy.issue_token(&identity).await?);
        }
        Commands::Roster { cohort } => {
            let roster: Vec<Identity> = serde_json::from_str(&proxy.roster(&cohort).await?)?;
            if roster.is_empty() {
                println!("No identities in cohort {cohort}");
            }
            for identity in roster {
                println!(
                    "{:>4}  {:<24} {}  descriptors={}{}",
                    identity.roll_number,
                    identity.name,
                    identity.id,
                    identity.descriptors.len(),
                    if identity.token.is_some() { "  token" } else { "" }
                );
            }
        }
        Commands::Recognize {
            cohort,
            probes_file,
            commit,
            recorded_by,
        } => {
            let probes = read_json_file(&probes_file)?;
            let result: RecognitionResult =
                serde_json::from_str(&proxy.recognize(&cohort, &probes).await?)?;
            println!(
                "Detected {} face(s): {} present, {} unmatched, {} ambiguous",
                result.detected_count,
                result.present.len(),
                result.unmatched,
                result.ambiguous
            );
            for id in &result.present {
                println!("  present: {id}");
            }
            if let Some(subject) = commit {
                let present = serde_json::to_string(&result.present)?;
                let json = proxy
                    .commit(
                        &cohort,
                        &subject,
                        &present,
                        Method::FaceRecognition.as_str(),
                        &recorded_by,
                    )
                    .await?;
                print_record(&serde_json::from_str(&json)?);
            }
        }
        Commands::Resolve { cohort, token } => {
            println!("{}", proxy.resolve_token(&cohort, &token).await?);
        }
        Commands::Scan {
            cohort,
            token,
            subject,
            recorded_by,
        } => {
            let json = proxy
                .mark_by_token(&cohort, &subject, &token, &recorded_by)
                .await?;
            print_record(&serde_json::from_str(&json)?);
        }
        Commands::Commit {
            cohort,
            subject,
            present,
            method,
            recorded_by,
        } => {
            let present = serde_json::to_string(&present)?;
            let json = proxy
                .commit(&cohort, &subject, &present, method.as_str(), &recorded_by)
                .await?;
            print_record(&serde_json::from_str(&json)?);
        }
        Commands::Records {
            cohort,
            date,
            limit,
        } => {
            let json = proxy
                .list_records(
                    cohort.as_deref().unwrap_or(""),
                    date.as_deref().unwrap_or(""),
                    limit,
                )
                .await?;
            let records: Vec<AttendanceRecord> = serde_json::from_str(&json)?;
            if records.is_empty() {
                println!("No attendance records");
            }
            for record in &records {
                print_record(record);
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn read_json_file(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    // Validate locally so a typo fails before reaching the daemon.
    serde_json::from_str::<serde_json::Value>(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(text)
}

fn print_record(record: &AttendanceRecord) {
    println!(
        "{}  {} / {}  {}  by {}  present={} absent={}",
        record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
        record.cohort,
        record.subject,
        record.method,
        record.recorded_by,
        record.present.len(),
        record.absent.len()
    );
    println!("  record {}", record.id);
}
