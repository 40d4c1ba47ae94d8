use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::credentials::{self, ServiceAccountKey};
use rollcall_core::index::load_image;
use rollcall_core::{
    BackupEntry, BackupStore, CosineMatcher, FaceEncoder, FaceMatcher, KnownFaceIndex, Ledger,
    OnnxFaceEncoder, Recognition,
};
use std::io::Read;
use std::path::{Path, PathBuf};

mod drive;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Rollcall attendance utilities")]
struct Cli {
    /// Attendance ledger CSV
    #[arg(long, global = true, env = "ROLLCALL_LEDGER_PATH", default_value = "Attendance.csv")]
    ledger: PathBuf,
    /// Directory holding ledger backups
    #[arg(long, global = true, env = "ROLLCALL_BACKUP_DIR", default_value = "backups")]
    backup_dir: PathBuf,
    /// Directory of known-face images
    #[arg(long, global = true, env = "ROLLCALL_FACES_DIR", default_value = "DownloadedImages")]
    faces_dir: PathBuf,
    /// Directory containing the ONNX models
    #[arg(long, global = true, env = "ROLLCALL_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Google Cloud service-account key file
    #[arg(long, global = true, env = "ROLLCALL_KEY_PATH", default_value = "keys/service-account.json")]
    key_path: PathBuf,
    /// Minimum cosine similarity for a match
    #[arg(long, global = true, env = "ROLLCALL_MATCH_THRESHOLD", default_value_t = CosineMatcher::DEFAULT_THRESHOLD)]
    threshold: f32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy the ledger to a timestamped backup
    Backup,
    /// List available backups
    Backups,
    /// Overwrite the ledger with a backup
    Restore {
        /// Backup file name, or its number from `rollcall backups`
        backup: String,
    },
    /// Show entry counts per person
    Summary,
    /// Manage the Google Cloud service-account key
    Keys {
        #[command(subcommand)]
        action: KeyCommand,
    },
    /// Google Drive image sync
    Drive {
        #[command(subcommand)]
        action: DriveCommand,
    },
    /// Record a check-in or check-out by name
    Mark { name: String },
    /// Build the known-face index and list who is in it
    Faces,
    /// Recognize the face in an image file
    Recognize {
        image: PathBuf,
        /// Also record attendance for the recognized person
        #[arg(long)]
        mark: bool,
    },
    /// Compare the first face in two images
    Compare { known: PathBuf, probe: PathBuf },
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Validate and install a key (reads stdin without --file)
    Install {
        #[arg(long)]
        file: Option<PathBuf>,
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },
    /// Check that the installed key is valid
    Verify,
    /// Print GOOGLE_APPLICATION_CREDENTIALS setup lines
    Env,
}

#[derive(Subcommand)]
enum DriveCommand {
    /// Download every image in a Drive folder into the known-faces directory
    Sync {
        /// Drive folder ID
        #[arg(long)]
        folder: String,
        /// OAuth access token with Drive read scope
        #[arg(long, env = "ROLLCALL_DRIVE_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = BackupStore::new(&cli.ledger, &cli.backup_dir);

    match cli.command {
        Commands::Backup => {
            let entry = store.backup()?;
            println!("Backup created: {}", entry.path.display());
        }
        Commands::Backups => {
            let backups = store.list_backups()?;
            if backups.is_empty() {
                println!("No backup files found in {}", store.backup_dir().display());
            }
            for (i, backup) in backups.iter().enumerate() {
                println!("  {}. {}", i + 1, describe_backup(backup));
            }
        }
        Commands::Restore { backup } => {
            let backups = store.list_backups()?;
            let name = resolve_backup(&backups, &backup)?;
            let entry = store.restore(&name)?;
            println!("Attendance data restored from: {}", entry.path.display());
        }
        Commands::Summary => {
            let summary = store.summarize()?;
            if summary.is_empty() {
                println!("No attendance data to summarize");
            } else {
                println!("Attendance summary:");
                for (name, count) in &summary.counts {
                    println!("  {name}: {count} entries");
                }
                println!("Total entries: {}", summary.total);
            }
        }
        Commands::Keys { action } => run_keys(action, &cli.key_path)?,
        Commands::Drive {
            action: DriveCommand::Sync { folder, token },
        } => {
            let key = credentials::verify_key(&cli.key_path)
                .with_context(|| format!("service-account key at {}", cli.key_path.display()))?;
            tracing::info!(client_email = %key.client_email, "using service account");

            let report = drive::DriveClient::new(token)
                .sync_folder(&folder, &cli.faces_dir)
                .await?;
            println!(
                "Found {} image(s); downloaded {}, failed {}.",
                report.listed,
                report.downloaded.len(),
                report.failed
            );
        }
        Commands::Mark { name } => {
            let outcome = Ledger::new(&cli.ledger).mark_attendance(&name)?;
            println!("{outcome}");
        }
        Commands::Faces => {
            let mut encoder = load_encoder(cli.model_dir.as_deref())?;
            let index = KnownFaceIndex::build(&cli.faces_dir, &mut encoder)?;
            println!("{} known face(s) in {}", index.len(), cli.faces_dir.display());
            for face in index.faces() {
                println!("  {} ({})", face.name, face.source.display());
            }
        }
        Commands::Recognize { image, mark } => {
            let mut encoder = load_encoder(cli.model_dir.as_deref())?;
            let index = KnownFaceIndex::build(&cli.faces_dir, &mut encoder)?;
            let frame = load_image(&image).with_context(|| format!("cannot read {}", image.display()))?;

            let matcher = FaceMatcher::new(CosineMatcher {
                min_similarity: cli.threshold,
            });
            match matcher.recognize(&mut encoder, &frame, &index)? {
                Recognition::Matched { name, score } => {
                    println!("Recognized {name} (similarity {score:.3})");
                    if mark {
                        println!("{}", Ledger::new(&cli.ledger).mark_attendance(&name)?);
                    }
                }
                Recognition::NoMatch { faces } => {
                    println!("Face not recognized ({faces} face(s) detected)")
                }
                Recognition::NoFace => println!("No face detected"),
            }
        }
        Commands::Compare { known, probe } => {
            let mut encoder = load_encoder(cli.model_dir.as_deref())?;
            let known_embedding = first_face(&mut encoder, &known)?;
            let probe_embedding = first_face(&mut encoder, &probe)?;

            let similarity = known_embedding.similarity(&probe_embedding);
            let matched = similarity >= cli.threshold;
            println!("match: {matched}, similarity: {similarity:.3}");
        }
    }

    Ok(())
}

fn run_keys(action: KeyCommand, key_path: &Path) -> Result<()> {
    match action {
        KeyCommand::Install { file, force } => {
            let json = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                None => {
                    eprintln!("Paste the service-account JSON, then end input (Ctrl-D):");
                    let mut json = String::new();
                    std::io::stdin().read_to_string(&mut json)?;
                    json
                }
            };
            let key = credentials::install_key(&json, key_path, force)?;
            println!("Key saved to {}", key_path.display());
            print_key(&key);
        }
        KeyCommand::Verify => {
            let key = credentials::verify_key(key_path)?;
            println!("Key file is valid: {}", key_path.display());
            print_key(&key);
        }
        KeyCommand::Env => {
            if !key_path.is_file() {
                bail!("key file not found: {}", key_path.display());
            }
            print!("{}", credentials::env_hint(key_path));
        }
    }
    Ok(())
}

fn print_key(key: &ServiceAccountKey) {
    println!("  service account: {}", key.client_email);
    println!("  project:         {}", key.project_id);
}

fn load_encoder(model_dir: Option<&Path>) -> Result<OnnxFaceEncoder> {
    let dir = model_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(rollcall_core::default_model_dir);
    OnnxFaceEncoder::from_model_dir(&dir)
        .with_context(|| format!("failed to load face models from {}", dir.display()))
}

fn first_face(encoder: &mut impl FaceEncoder, path: &Path) -> Result<rollcall_core::Embedding> {
    let image = load_image(path).with_context(|| format!("cannot read {}", path.display()))?;
    encoder
        .encode(&image)?
        .into_iter()
        .next()
        .with_context(|| format!("no face found in {}", path.display()))
}

fn describe_backup(backup: &BackupEntry) -> String {
    match backup.modified {
        Some(modified) => format!(
            "{} ({} bytes, {})",
            backup.name,
            backup.size,
            modified.format("%Y-%m-%d %H:%M:%S")
        ),
        None => format!("{} ({} bytes)", backup.name, backup.size),
    }
}

/// Accept a backup file name or its 1-based position in the listing.
fn resolve_backup(backups: &[BackupEntry], selector: &str) -> Result<String> {
    match selector.trim().parse::<usize>() {
        Ok(n) => match n.checked_sub(1).and_then(|i| backups.get(i)) {
            Some(entry) => Ok(entry.name.clone()),
            None => bail!("invalid backup number {n}; {} backup(s) available", backups.len()),
        },
        Err(_) => Ok(selector.to_string()),
    }
}
