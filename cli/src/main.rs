mod review;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aviary_core::{
    browser::list_entries,
    config::Config,
    detection::{load_detections, Detector, SidecarDetector},
    rendering::OverlayRenderer,
    video::{
        writer::{segment_file_name, SegmentWriter, CAPTURE_FPS, DEFAULT_QSCALE},
        VideoSource,
    },
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "aviary",
    version,
    about = "Review bird-species footage and curate frames for the detection dataset",
    long_about = None
)]
struct Cli {
    /// TOML configuration file (default: nearest aviary.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root of the species/{species}/{date}/{file} tree
    #[arg(long, global = true)]
    species_root: Option<PathBuf>,

    /// Directory receiving curated frames and the index file
    #[arg(long, global = true)]
    dataset_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive review console: browse recordings and save frames.
    Review {
        /// Per-frame detection sidecar used by `show`
        #[arg(long)]
        detections: Option<PathBuf>,
    },

    /// Print frame count and dimensions of a recording.
    Probe {
        video: PathBuf,
    },

    /// Extract one frame as PNG, optionally with detection overlays.
    Frame {
        video: PathBuf,

        /// 0-based frame index
        #[arg(short = 'n', long, allow_hyphen_values = true)]
        index: i64,

        /// Output image path
        #[arg(short, long, default_value = "frame.png")]
        output: PathBuf,

        /// Per-frame detection sidecar
        #[arg(long)]
        detections: Option<PathBuf>,
    },

    /// Draw detections from a JSON file onto a still image.
    Annotate {
        image: PathBuf,

        /// Detections for this image (record list or column layout)
        #[arg(long)]
        detections: PathBuf,

        /// Output image path
        #[arg(short, long, default_value = "annotated.png")]
        output: PathBuf,
    },

    /// Assemble still images into an MJPEG segment under the species tree.
    Pack {
        images_dir: PathBuf,

        #[arg(long)]
        species: String,

        #[arg(long)]
        date: String,

        #[arg(long, default_value_t = CAPTURE_FPS)]
        fps: u32,

        /// MJPEG quantiser scale, 2 (best) to 31 (smallest)
        #[arg(long, default_value_t = DEFAULT_QSCALE)]
        qscale: u32,

        /// Segment start time "YYYY-MM-DD HH:MM:SS" (default: now)
        #[arg(long)]
        start: Option<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Commands::Review { detections } => review::run(&config, detections.as_deref()),
        Commands::Probe { video } => cmd_probe(&video),
        Commands::Frame {
            video,
            index,
            output,
            detections,
        } => cmd_frame(&config, &video, index, &output, detections.as_deref()),
        Commands::Annotate {
            image,
            detections,
            output,
        } => cmd_annotate(&config, &image, &detections, &output),
        Commands::Pack {
            images_dir,
            species,
            date,
            fps,
            qscale,
            start,
        } => cmd_pack(&config, &images_dir, &species, &date, fps, qscale, start.as_deref()),
    }
}

/// Config file first, then command-line overrides.
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config =
        Config::load_or_default(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(root) = &cli.species_root {
        config.species_root = root.clone();
    }
    if let Some(dir) = &cli.dataset_dir {
        config.dataset_dir = dir.clone();
    }
    Ok(config)
}

// ── probe / frame / annotate ─────────────────────────────────────────────────

fn cmd_probe(video: &Path) -> Result<()> {
    let source = VideoSource::open(video)
        .with_context(|| format!("failed to open video: {}", video.display()))?;
    let (width, height) = source.dimensions();
    println!("{}", video.display());
    println!("  frames     : {}", source.frame_count());
    println!("  dimensions : {width}x{height}");
    Ok(())
}

fn cmd_frame(
    config: &Config,
    video: &Path,
    index: i64,
    output: &Path,
    detections: Option<&Path>,
) -> Result<()> {
    let mut source = VideoSource::open(video)
        .with_context(|| format!("failed to open video: {}", video.display()))?;
    let mut frame = source
        .get_frame(index)
        .with_context(|| format!("failed to read frame {index}"))?;

    if let Some(sidecar) = detections {
        let mut detector = SidecarDetector::load(sidecar)?;
        let found = detector.detect(&frame)?;
        info!(count = found.len(), index, "drawing detections");
        let renderer = OverlayRenderer::new(config.render_config())?;
        frame = renderer.render(&frame, &found)?;
    }

    frame
        .to_image()?
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(index, output = %output.display(), "frame written");
    Ok(())
}

fn cmd_annotate(config: &Config, image: &Path, detections: &Path, output: &Path) -> Result<()> {
    let input = image::open(image)
        .with_context(|| format!("failed to read image: {}", image.display()))?
        .into_rgb8();
    let found = load_detections(detections)?;
    let renderer = OverlayRenderer::new(config.render_config())?;
    let annotated = renderer
        .render_image(&input, &found)
        .context("failed to draw detections")?;
    annotated
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(detections = found.len(), output = %output.display(), "annotated image written");
    Ok(())
}

// ── pack ─────────────────────────────────────────────────────────────────────

fn cmd_pack(
    config: &Config,
    images_dir: &Path,
    species: &str,
    date: &str,
    fps: u32,
    qscale: u32,
    start: Option<&str>,
) -> Result<()> {
    if fps == 0 {
        bail!("--fps must be positive");
    }
    let started = match start {
        Some(text) => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
            .with_context(|| format!("invalid --start {text:?}, expected YYYY-MM-DD HH:MM:SS"))?,
        None => Local::now().naive_local(),
    };

    let names = list_entries(images_dir)?;
    if names.is_empty() {
        bail!("no images in {}", images_dir.display());
    }

    let target_dir = config.species_root.join(species).join(date);
    std::fs::create_dir_all(&target_dir)
        .with_context(|| format!("failed to create {}", target_dir.display()))?;
    let target = target_dir.join(segment_file_name(started));
    if target.exists() {
        bail!("{} already exists", target.display());
    }

    info!(images = names.len(), fps, output = %target.display(), "packing segment");
    let pb = frame_bar(names.len() as u64);

    let mut writer: Option<SegmentWriter> = None;
    for name in &names {
        let path = images_dir.join(name);
        let frame = image::open(&path)
            .with_context(|| format!("failed to read image: {}", path.display()))?
            .into_rgb8();

        let w = match writer.as_mut() {
            Some(w) => w,
            None => writer.insert(
                SegmentWriter::create_with_qscale(
                    &target,
                    frame.width(),
                    frame.height(),
                    fps,
                    qscale,
                )?,
            ),
        };
        w.write_frame(&frame)
            .with_context(|| format!("failed to add {}", path.display()))?;
        pb.inc(1);
    }

    if let Some(w) = writer {
        let frames = w.frames_written();
        w.finish().context("failed to finalize segment")?;
        pb.finish_with_message(format!("Packed {frames} frames into {}", target.display()));
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn frame_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} frames {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#> "),
    );
    pb
}
