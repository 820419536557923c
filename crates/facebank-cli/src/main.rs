use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facebank_core::{
    EmbeddingStore, EnrollOptions, FaceId, LoadOutcome, RecognitionEngine, RecognizeOptions,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod detections;

use config::Config;
use detections::DetectionsFile;

#[derive(Parser)]
#[command(name = "facebank", about = "Face embedding store and 1:N recognition")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config and FACEBANK_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage subjects
    Subjects {
        #[command(subcommand)]
        action: SubjectAction,
    },
    /// Manage stored faces
    Faces {
        #[command(subcommand)]
        action: FaceAction,
    },
    /// Enroll the single face in an image under a subject
    Enroll {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long)]
        image: PathBuf,
        /// Detector output for the image (JSON array of faces)
        #[arg(short, long)]
        faces: PathBuf,
        #[arg(long)]
        det_prob_threshold: Option<f32>,
    },
    /// Identify the faces in an image
    Recognize {
        #[arg(short, long)]
        image: PathBuf,
        /// Detector output for the image (JSON array of faces)
        #[arg(short, long)]
        faces: PathBuf,
        /// Maximum faces to report (0 = all)
        #[arg(long, default_value_t = 0)]
        limit: usize,
        /// Maximum matches per face (0 = all above threshold)
        #[arg(long, default_value_t = 1)]
        prediction_count: usize,
        #[arg(long)]
        det_prob_threshold: Option<f32>,
    },
    /// Show store status
    Status,
}

#[derive(Subcommand)]
enum SubjectAction {
    /// List subjects
    List,
    /// Create an empty subject
    Add { name: String },
    /// Rename a subject, keeping its faces
    Rename { old: String, new: String },
    /// Delete a subject and all of its faces
    Delete { name: String },
}

#[derive(Subcommand)]
enum FaceAction {
    /// List faces
    List {
        #[arg(short, long)]
        subject: Option<String>,
    },
    /// Delete one face by id
    Delete { id: FaceId },
    /// Delete every face of a subject
    Purge {
        #[arg(short, long)]
        subject: String,
    },
    /// Write a face's stored image to a file
    Image {
        id: FaceId,
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    // Store and snapshot I/O are blocking.
    let output = tokio::task::spawn_blocking(move || execute(cli.command, &config))
        .await
        .context("command task panicked")??;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<EmbeddingStore>> {
    let (store, outcome) = EmbeddingStore::open(&config.data_dir)
        .with_context(|| format!("opening store at {}", config.data_dir.display()))?;
    if let LoadOutcome::Recovered { quarantined, reason } = &outcome {
        eprintln!(
            "WARNING: snapshot was unreadable ({reason}); moved to {} and started EMPTY",
            quarantined.display()
        );
    }
    Ok(Arc::new(store))
}

fn engine(config: &Config, faces: &Path) -> Result<RecognitionEngine<DetectionsFile>> {
    let detector = DetectionsFile::load(faces)?;
    Ok(RecognitionEngine::new(
        open_store(config)?,
        detector,
        config.engine_config(),
    ))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

fn execute(command: Commands, config: &Config) -> Result<Value> {
    match command {
        Commands::Subjects { action } => {
            let store = open_store(config)?;
            match action {
                SubjectAction::List => Ok(json!({ "subjects": store.list_subjects()? })),
                SubjectAction::Add { name } => {
                    store.add_subject(&name)?;
                    Ok(json!({ "subject": name }))
                }
                SubjectAction::Rename { old, new } => {
                    store.rename_subject(&old, &new)?;
                    Ok(json!({ "updated": true }))
                }
                SubjectAction::Delete { name } => {
                    let deleted = store.delete_subject(&name)?;
                    Ok(json!({ "subject": name, "deleted_faces": deleted }))
                }
            }
        }
        Commands::Faces { action } => {
            let store = open_store(config)?;
            match action {
                FaceAction::List { subject } => {
                    Ok(json!({ "faces": store.list_faces(subject.as_deref())? }))
                }
                FaceAction::Delete { id } => {
                    let subject = store.delete_face(id)?;
                    Ok(json!({ "image_id": id, "subject": subject }))
                }
                FaceAction::Purge { subject } => {
                    Ok(json!({ "deleted": store.delete_all_faces_of_subject(&subject)? }))
                }
                FaceAction::Image { id, out } => {
                    let image = store.face_image(id)?;
                    std::fs::write(&out, &image.bytes)
                        .with_context(|| format!("writing {}", out.display()))?;
                    Ok(json!({
                        "image_id": id,
                        "content_type": image.content_type,
                        "bytes": image.bytes.len(),
                        "path": out,
                    }))
                }
            }
        }
        Commands::Enroll {
            subject,
            image,
            faces,
            det_prob_threshold,
        } => {
            let engine = engine(config, &faces)?;
            let bytes = read_image(&image)?;
            let enrolled = engine.enroll(&subject, &bytes, EnrollOptions { det_prob_threshold })?;
            Ok(serde_json::to_value(enrolled)?)
        }
        Commands::Recognize {
            image,
            faces,
            limit,
            prediction_count,
            det_prob_threshold,
        } => {
            let engine = engine(config, &faces)?;
            let bytes = read_image(&image)?;
            let opts = RecognizeOptions {
                limit,
                det_prob_threshold,
                prediction_count,
            };
            Ok(json!({ "result": engine.recognize(&bytes, opts)? }))
        }
        Commands::Status => {
            let store = open_store(config)?;
            let stats = store.stats()?;
            Ok(json!({
                "status": "ok",
                "data_dir": config.data_dir,
                "similarity_threshold": config.similarity_threshold,
                "detection_threshold": config.detection_threshold,
                "total_subjects": stats.subjects,
                "total_faces": stats.faces,
                "embedding_dimension": stats.dimension,
            }))
        }
    }
}
