use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use clip_rust::core::config::default_threads;
use clip_rust::{ClipContext, ImageU8, LoadOptions, Scratch};

#[derive(Parser, Debug)]
#[command(name = "clip-rust")]
#[command(about = "CLIP text and image embeddings on the CPU")]
struct Args {
    /// Path to the ggml model file.
    #[arg(short, long, env = "CLIP_MODEL")]
    model: PathBuf,

    /// Worker threads for a forward pass.
    #[arg(short, long, env = "CLIP_THREADS", default_value_t = default_threads())]
    threads: usize,

    /// 0 = warnings only, 1 = load summary, 2 = per-tensor and timing detail.
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Zero-shot labeling: rank the texts as descriptions of the image.
    Zsl {
        #[arg(long)]
        image: PathBuf,
        /// Candidate labels, at least two.
        #[arg(long, num_args = 1.., required = true)]
        text: Vec<String>,
    },
    /// Write a text or image embedding as JSON.
    Extract {
        #[arg(long, conflicts_with = "image", required_unless_present = "image")]
        text: Option<String>,
        #[arg(long)]
        image: Option<PathBuf>,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Write the projection as is, without L2 normalization.
        #[arg(long)]
        raw: bool,
    },
    /// Similarity score between a text and an image.
    Compare {
        #[arg(long)]
        text: String,
        #[arg(long)]
        image: PathBuf,
    },
    /// Show token ids and the pieces they decode to.
    Tokenize { text: String },
}

#[derive(Serialize)]
struct Embedding<'a> {
    kind: &'a str,
    input: String,
    dim: usize,
    normalized: bool,
    embedding: Vec<f32>,
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(())
}

fn load_image(path: &Path) -> anyhow::Result<ImageU8> {
    ImageU8::load(path).with_context(|| format!("failed to load image {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let opts = LoadOptions {
        verbosity: args.verbose,
        ..Default::default()
    };
    let ctx = ClipContext::load_with(&args.model, &opts)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    let n_threads = args.threads;

    match args.command {
        Command::Zsl { image, text } => {
            if text.len() < 2 {
                bail!("zero-shot labeling needs at least two labels, got {}", text.len());
            }
            let img = load_image(&image)?;
            let start = Utc::now();
            let ranked = ctx.zero_shot(&img, &text, n_threads)?;
            for (label, prob) in &ranked {
                println!("{label} = {prob:.4}");
            }
            info!(ms = (Utc::now() - start).num_milliseconds(), "zero-shot labeling done");
        }
        Command::Extract { text, image, out, raw } => {
            let mut s = Scratch::new(&ctx);
            let normalized = !raw;
            let record = match (text, image) {
                (Some(text), _) => {
                    let ids = ctx.tokenize(&text);
                    let embedding = ctx.encode_text_with(&mut s, &ids, n_threads, normalized)?;
                    let dim = embedding.len();
                    Embedding { kind: "text", input: text, dim, normalized, embedding }
                }
                (None, Some(path)) => {
                    let img = ctx.preprocess(&load_image(&path)?)?;
                    let embedding = ctx.encode_image_with(&mut s, &img, n_threads, normalized)?;
                    let (input, dim) = (path.display().to_string(), embedding.len());
                    Embedding { kind: "image", input, dim, normalized, embedding }
                }
                (None, None) => bail!("extract needs --text or --image"),
            };
            let json = serde_json::to_string_pretty(&record)?;
            match out {
                Some(path) => {
                    fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), "embedding written");
                }
                None => println!("{json}"),
            }
        }
        Command::Compare { text, image } => {
            let img = load_image(&image)?;
            let score = ctx.compare_text_and_image(&text, &img, n_threads)?;
            println!("similarity = {score:.4}");
        }
        Command::Tokenize { text } => {
            let tokens = ctx.tokenize_detailed(&text);
            for &id in &tokens.ids {
                let piece = ctx.tokenizer.vocab.token(id).unwrap_or_default();
                println!("{id}\t{:?}", String::from_utf8_lossy(piece));
            }
            if !tokens.unknown.is_empty() {
                println!("skipped bytes: {}", serde_json::to_string(&tokens.unknown)?);
            }
            println!("decoded: {:?}", ctx.decode(&tokens.ids));
        }
    }
    Ok(())
}
