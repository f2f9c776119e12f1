//! CLI binary for doc2img-client.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `TrackerConfig`, renders tracker events and saves archives.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use doc2img_client::{
    Background, Document, Job, JobState, SubmitRequest, Tracker, TrackerConfig, TrackerEvent,
    TrackerObserver,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Terminal observer using indicatif ────────────────────────────────────────

/// Renders one progress bar over all submitted jobs plus a log line per
/// settled job. Jobs settle in any order.
struct CliObserver {
    bar: ProgressBar,
    settled: Mutex<Vec<String>>,
    aggregates: Mutex<Vec<String>>,
}

impl CliObserver {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} jobs  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            settled: Mutex::new(Vec::new()),
            aggregates: Mutex::new(Vec::new()),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn aggregates(&self) -> Vec<String> {
        self.aggregates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl TrackerObserver for CliObserver {
    fn on_job_updated(&self, job: &Job) {
        if !job.state.is_terminal() {
            self.bar
                .set_message(format!("{} {}", job.label(), dim(&job.state.to_string())));
            return;
        }
        {
            let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
            if settled.contains(&job.id) {
                return;
            }
            settled.push(job.id.clone());
        }
        if job.state == JobState::Completed {
            self.bar
                .println(format!("  {} {}  {}", green("✓"), job.label(), dim(&job.id)));
        } else {
            let detail = job.detail.as_deref().unwrap_or("conversion failed");
            self.bar
                .println(format!("  {} {}  {}", red("✗"), job.label(), red(detail)));
        }
        self.bar.inc(1);
    }

    fn on_aggregate_available(&self, batch_id: &str) {
        self.aggregates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch_id.to_string());
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Batch {batch_id} ready for download"))
        ));
    }

    fn on_session_expired(&self) {
        self.bar.println(format!(
            "{} {}",
            red("✘"),
            bold("Session expired; run `doc2img login` again")
        ));
    }

    fn on_poll_error(&self, job_id: &str, error: &str) {
        self.bar.println(format!(
            "  {} {}  {}",
            cyan("⚠"),
            dim(job_id),
            dim(&format!("{error} (retrying)"))
        ));
    }
}

/// Prints every event as one JSON line on stdout.
struct JsonObserver {
    aggregates: Mutex<Vec<String>>,
}

impl JsonObserver {
    fn print(&self, event: TrackerEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{line}");
        }
    }
}

impl TrackerObserver for JsonObserver {
    fn on_job_updated(&self, job: &Job) {
        self.print(TrackerEvent::JobUpdated { job: job.clone() });
    }

    fn on_aggregate_available(&self, batch_id: &str) {
        self.aggregates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch_id.to_string());
        self.print(TrackerEvent::AggregateAvailable {
            batch_id: batch_id.to_string(),
        });
    }

    fn on_session_expired(&self) {
        self.print(TrackerEvent::SessionExpired);
    }

    fn on_poll_error(&self, job_id: &str, error: &str) {
        self.print(TrackerEvent::PollError {
            job_id: job_id.to_string(),
            error: error.to_string(),
        });
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Log in once; the session is kept in the config directory
  doc2img login --user alice

  # Convert two documents and download the batch archive into ./out
  doc2img convert report.docx slides.pdf -o out

  # Solid background colour, higher resolution
  doc2img convert --background color --color '#ffffff' --dpi 300 scan.pdf

  # Image background
  doc2img convert --background image --image paper.png letter.docx

  # Submit only; check and download later
  doc2img convert --no-download report.docx
  doc2img status 4f1c2d
  doc2img download 4f1c2d -o out
  doc2img download --batch 9a7e01 -o out
  doc2img download --original 4f1c2d -o out

  # Machine-readable event stream
  doc2img --json convert a.pdf b.pdf

ENVIRONMENT VARIABLES:
  DOC2IMG_SERVER          Conversion service base URL
  DOC2IMG_IDENTITY_URL    Identity provider base URL
  DOC2IMG_SESSION_FILE    Where the session is persisted
  DOC2IMG_POLL_INTERVAL   Seconds between status checks
  DOC2IMG_USER            Login identifier
  DOC2IMG_PASSWORD        Login password
  RUST_LOG                Overrides the log filter
"#;

/// Convert documents to images with a remote conversion service.
#[derive(Parser, Debug)]
#[command(
    name = "doc2img",
    version,
    about = "Convert documents to images with a remote conversion service",
    long_about = "Submit documents to a document-to-image conversion service, follow every \
job until it completes and download the resulting archives. Multi-document submissions are \
tracked as a batch and downloaded as one archive.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Conversion service base URL.
    #[arg(long, global = true, env = "DOC2IMG_SERVER", default_value = "http://localhost:8000")]
    server: String,

    /// Identity provider base URL.
    #[arg(
        long,
        global = true,
        env = "DOC2IMG_IDENTITY_URL",
        default_value = "http://localhost:1337"
    )]
    identity_url: String,

    /// Session file (default: <config dir>/doc2img/session.json).
    #[arg(long, global = true, env = "DOC2IMG_SESSION_FILE")]
    session_file: Option<PathBuf>,

    /// Seconds between status checks.
    #[arg(long, global = true, env = "DOC2IMG_POLL_INTERVAL", default_value_t = 3,
          value_parser = clap::value_parser!(u64).range(1..=3600))]
    poll_interval: u64,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOC2IMG_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOC2IMG_QUIET")]
    quiet: bool,

    /// Print events and results as JSON lines.
    #[arg(long, global = true, env = "DOC2IMG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate and store the session.
    Login {
        /// Username or email.
        #[arg(short, long, env = "DOC2IMG_USER")]
        user: String,
        /// Password.
        #[arg(short, long, env = "DOC2IMG_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored session.
    Logout,
    /// Submit documents and follow them to completion.
    Convert(ConvertArgs),
    /// Fetch the current state of one job.
    Status {
        job_id: String,
    },
    /// Download the archive of a job or a batch.
    Download {
        /// Job id.
        #[arg(required_unless_present = "batch", conflicts_with = "batch")]
        job_id: Option<String>,
        /// Batch id.
        #[arg(long)]
        batch: Option<String>,
        /// Save the job's first page as rendered before the background (PNG).
        #[arg(long, requires = "job_id")]
        original: bool,
        /// Output directory.
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Documents to convert.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Background behind the rendered pages.
    #[arg(long, value_enum, default_value = "none")]
    background: BackgroundArg,

    /// Background colour, #RGB or #RRGGBB (with --background color).
    #[arg(long)]
    color: Option<String>,

    /// Background image (with --background image).
    #[arg(long)]
    image: Option<PathBuf>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "DOC2IMG_DPI", default_value_t = 144,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Output directory for archives.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Only submit and track; do not download archives.
    #[arg(long)]
    no_download: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BackgroundArg {
    None,
    Color,
    Image,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the feedback during `convert`, so library
    // INFO logs are hidden unless asked for.
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || cli.json || matches!(cli.command, Command::Convert(_)) {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    match cli.command {
        Command::Login { ref user, ref password } => {
            let tracker = Tracker::connect(config)?;
            let identity = tracker.login(user, password).await.context("Login failed")?;
            if cli.json {
                println!("{}", serde_json::to_string(&identity)?);
            } else if !cli.quiet {
                eprintln!("{} Logged in as {}", green("✔"), bold(&identity.username));
            }
        }
        Command::Logout => {
            let tracker = Tracker::connect(config)?;
            tracker.logout();
            if !cli.quiet && !cli.json {
                eprintln!("{} Logged out", green("✔"));
            }
        }
        Command::Status { ref job_id } => {
            let tracker = authenticated(config)?;
            let job = tracker
                .refresh(job_id)
                .await
                .with_context(|| format!("Failed to fetch job {job_id}"))?;
            print_job(&job, cli.json)?;
        }
        Command::Download {
            ref job_id,
            ref batch,
            original,
            ref output,
        } => {
            let tracker = authenticated(config)?;
            let path = match (job_id, batch) {
                (_, Some(batch_id)) => tracker.download_batch_to_file(batch_id, output).await,
                (Some(job_id), None) if original => {
                    tracker.download_original_to_file(job_id, output).await
                }
                (Some(job_id), None) => tracker.download_job_to_file(job_id, output).await,
                (None, None) => bail!("Give a job id or --batch <ID>"),
            }
            .context("Download failed")?;
            report_saved(&path, cli.quiet, cli.json);
        }
        Command::Convert(ref args) => convert(&cli, args, config).await?,
    }

    Ok(())
}

/// Map global CLI flags to `TrackerConfig`.
fn build_config(cli: &Cli) -> Result<TrackerConfig> {
    let session_file = match cli.session_file {
        Some(ref path) => path.clone(),
        None => dirs::config_dir()
            .context("No config directory on this platform; pass --session-file")?
            .join("doc2img")
            .join("session.json"),
    };
    let mut builder = TrackerConfig::builder()
        .server_url(&cli.server)
        .identity_url(&cli.identity_url)
        .poll_interval(Duration::from_secs(cli.poll_interval))
        .session_file(session_file);
    if let Command::Convert(ref args) = cli.command {
        builder = builder.dpi(args.dpi);
    }
    builder.build().context("Invalid configuration")
}

/// A tracker whose stored session is required to be present.
fn authenticated(config: TrackerConfig) -> Result<Tracker> {
    let tracker = Tracker::connect(config)?;
    if !tracker.session().is_valid() {
        bail!("Not logged in; run `doc2img login` first");
    }
    Ok(tracker)
}

async fn build_request(args: &ConvertArgs) -> Result<SubmitRequest> {
    let background = match args.background {
        BackgroundArg::None => Background::None,
        BackgroundArg::Color => {
            let color = args
                .color
                .as_deref()
                .context("--background color needs --color")?;
            Background::color(color)?
        }
        BackgroundArg::Image => {
            let image = args
                .image
                .as_ref()
                .context("--background image needs --image")?;
            Background::Image(
                Document::from_path(image)
                    .await
                    .context("Failed to read background image")?,
            )
        }
    };
    let request = SubmitRequest::from_paths(&args.files)
        .await
        .context("Failed to read documents")?
        .background(background)
        .dpi(args.dpi);
    request.validate()?;
    Ok(request)
}

async fn convert(cli: &Cli, args: &ConvertArgs, config: TrackerConfig) -> Result<()> {
    let request = build_request(args).await?;
    let show_progress = !cli.quiet && !cli.json;

    let bar = show_progress.then(|| CliObserver::new(request.documents.len()));
    let json = cli.json.then(|| {
        Arc::new(JsonObserver {
            aggregates: Mutex::new(Vec::new()),
        })
    });
    let mut builder = Tracker::builder(config);
    if let Some(ref bar) = bar {
        builder = builder.observer(bar.clone());
    } else if let Some(ref json) = json {
        builder = builder.observer(json.clone());
    }
    let tracker = builder.build()?;
    if !tracker.session().is_valid() {
        bail!("Not logged in; run `doc2img login` first");
    }

    let submission = tracker.submit(request).await.context("Submission failed")?;
    if let Some(ref bar) = bar {
        bar.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Submitted {} job(s)", submission.jobs.len()))
        ));
    }

    let expired = tracker.session().expired();
    tokio::select! {
        _ = tracker.wait_until_idle() => {}
        _ = expired.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            tracker.shutdown();
            if let Some(ref bar) = bar {
                bar.finish();
            }
            bail!("Interrupted");
        }
    }
    if let Some(ref bar) = bar {
        bar.finish();
    }
    if !tracker.session().is_valid() {
        bail!("Session expired; run `doc2img login` again");
    }

    let jobs: Vec<Job> = submission
        .jobs
        .iter()
        .filter_map(|j| tracker.job(&j.id))
        .collect();
    let completed = jobs.iter().filter(|j| j.state == JobState::Completed).count();
    let failed = jobs.len() - completed;

    if !cli.quiet && !cli.json {
        eprintln!(
            "{} {}/{} jobs completed{}",
            if failed == 0 { green("✔") } else { cyan("⚠") },
            bold(&completed.to_string()),
            jobs.len(),
            if failed > 0 {
                format!("  ({} failed)", red(&failed.to_string()))
            } else {
                String::new()
            }
        );
    }
    if args.no_download {
        return Ok(());
    }

    let ready = match (&bar, &json) {
        (Some(b), _) => b.aggregates(),
        (None, Some(j)) => j.aggregates.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        _ => submission
            .batch_id
            .iter()
            .filter(|id| tracker.batch(id).is_some_and(|b| b.aggregate_offered()))
            .cloned()
            .collect(),
    };

    if let Some(batch_id) = ready.first() {
        let path = tracker
            .download_batch_to_file(batch_id, &args.output)
            .await
            .context("Batch download failed")?;
        report_saved(&path, cli.quiet, cli.json);
        return Ok(());
    }

    // No aggregate: fetch whatever completed, one archive per job.
    let mut download_errors = 0;
    for job in jobs.iter().filter(|j| j.state == JobState::Completed) {
        match tracker.download_job_to_file(&job.id, &args.output).await {
            Ok(path) => report_saved(&path, cli.quiet, cli.json),
            Err(e) => {
                download_errors += 1;
                eprintln!("{} {}: {e}", red("✗"), job.label());
            }
        }
    }
    if download_errors > 0 {
        bail!("{download_errors} download(s) failed");
    }
    if completed == 0 {
        bail!("No job completed");
    }
    Ok(())
}

fn print_job(job: &Job, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(job).context("Failed to serialise job")?
        );
        return Ok(());
    }
    println!("Job:          {}", job.id);
    if let Some(ref name) = job.source_name {
        println!("Document:     {name}");
    }
    println!("State:        {}", job.state);
    if let Some(ref batch) = job.batch_id {
        println!("Batch:        {batch}");
    }
    if let Some(ref detail) = job.detail {
        println!("Detail:       {detail}");
    }
    if let Some(ref url) = job.download_url {
        println!("Download:     {url}");
    }
    if let Some(ref url) = job.batch_download_url {
        println!("Batch zip:    {url}");
    }
    if let Some(ref url) = job.original_snapshot_url {
        println!("Original:     {url}");
    }
    if let Some(ref expires) = job.expires_at {
        println!("Expires:      {expires}");
    }
    Ok(())
}

fn report_saved(path: &Path, quiet: bool, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "saved": path }));
    } else if !quiet {
        eprintln!("{}  →  {}", green("✔"), bold(&path.display().to_string()));
    }
}
