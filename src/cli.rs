use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arxiv_daily_dirs::DirType;
use clap::builder::styling::{AnsiColor, Color, Style, Styles};
use clap::{Args, ColorChoice, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::{Generator, Shell, generate};
use clap_complete_nushell::Nushell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde_json::{Map, Value};
use tracing::info;
use tracing_indicatif::indicatif_println;

use crate::cluster::{Assignment, ClustererParams, NOISE};
use crate::corpus::{most_recent_file, read_json_file, read_records, write_records};
use crate::embed::{ChunkedEmbedder, HttpEmbedder, RetryPolicy, embed_records};
use crate::fetch::{DEFAULT_FEED_URL, fetch_feed};
use crate::pipeline::{TrainingConfig, annotate_records, assign_records, train};
use crate::plot::{DescriptionMap, render_plot};
use crate::reduce::{Metric, ReducerParams};
use crate::store::ModelStore;
use crate::{AppError, AppResult};

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .error(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))))
    .literal(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Green))),
    )
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))))
    .valid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
    .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightRed))))
    .context(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Magenta))))
    .context_value(
        Style::new()
            .bold()
            .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
    );

/// Long-form CLI description shown in `--help`.
const LONG_ABOUT: &str = "Arxiv Daily - Topic clusters for the daily arXiv listing

Training fits, once, on the historical corpus of embedded articles:
- a manifold reducer that packs the embeddings into a few dense components
- a density-based clusterer on top of the reduced points
- a 2-D reducer used only for plotting

Every day the new batch is pushed through the frozen models and each article is assigned to a
known cluster or marked as noise. Nothing is refit during assignment.";

/// Arxiv Daily - Topic clusters for the daily arXiv listing.
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    propagate_version = true,
    about,
    long_about = Some(LONG_ABOUT),
    styles = STYLES
)]
pub struct Cli {
    /// Color choice for the output
    #[arg(long, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    /// Subcommand to run
    #[command(subcommand)]
    pub cmd: Cmd,
}

/// Top-level commands supported by the CLI.
#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Download the current arXiv listing of a section into the data directory
    Fetch {
        /// arXiv section, e.g. cs, math, stat, quant-ph, astro-ph
        #[arg(short, long, default_value = "cs")]
        section: String,

        /// Directory the listing is written to [default: ~/.local/share/arxiv-daily/data]
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Base URL of the per-section RSS feeds
        #[arg(long, default_value = DEFAULT_FEED_URL)]
        feed_url: String,

        /// Timeout of the request (e.g. `30s`, `2m`)
        #[arg(long, default_value = "60s")]
        timeout: String,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Fit the reducers and the clusterer on the historical corpus and commit them
    Train {
        /// Directory holding the daily record files [default: ~/.local/share/arxiv-daily/data]
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        manifold: ManifoldArgs,
        #[command(flatten)]
        visual: VisualArgs,
        #[command(flatten)]
        clusterer: ClustererArgs,

        /// Seed for both reducers
        ///
        /// Without a seed, repeated training runs are not expected to reproduce the same clusters
        #[arg(long)]
        seed: Option<u64>,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Assign a day's records to the trained clusters
    Assign {
        /// Record file to assign
        ///
        /// Defaults to the most recently modified file in the data directory
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Directory searched for the newest record file when no input is given
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[command(flatten)]
        model: ModelArgs,

        /// Write the records, annotated with cluster, strength and description, to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Render a 2-D scatter plot of the batch as SVG
        #[arg(long)]
        plot: Option<PathBuf>,

        /// JSON file mapping cluster ids to descriptions
        #[arg(long)]
        descriptions: Option<PathBuf>,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Embed the articles of a record file through an OpenAI-compatible server
    Embed {
        /// Record file with titles and abstracts
        input: PathBuf,

        /// Output file; defaults to rewriting the input
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        retry: RetryArgs,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Show the manifest of the committed model set
    Inspect {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },

    /// Generate shell completion for a given shell
    Completion {
        /// Output file to write the completion script to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The shell to generate the completion for
        #[arg(value_enum)]
        shell: CompletionShell,

        #[command(flatten)]
        verbosity: Verbosity<InfoLevel>,
    },
}

/// Supported completion targets for shell auto-completion.
#[derive(ValueEnum, Clone, Debug)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
    Nushell,
}

impl Display for CompletionShell {
    /// Render the canonical shell name string.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionShell::Bash => "bash",
            CompletionShell::Zsh => "zsh",
            CompletionShell::Fish => "fish",
            CompletionShell::PowerShell => "powershell",
            CompletionShell::Elvish => "elvish",
            CompletionShell::Nushell => "nushell",
        };
        write!(f, "{}", s)
    }
}

impl Generator for &CompletionShell {
    fn generate(&self, cmd: &clap::builder::Command, buf: &mut dyn Write) {
        match self {
            CompletionShell::Bash => Shell::Bash.generate(cmd, buf),
            CompletionShell::Zsh => Shell::Zsh.generate(cmd, buf),
            CompletionShell::Fish => Shell::Fish.generate(cmd, buf),
            CompletionShell::PowerShell => Shell::PowerShell.generate(cmd, buf),
            CompletionShell::Elvish => Shell::Elvish.generate(cmd, buf),
            CompletionShell::Nushell => Nushell.generate(cmd, buf),
        }
    }

    fn file_name(&self, name: &str) -> String {
        match self {
            CompletionShell::Bash => Shell::Bash.file_name(name),
            CompletionShell::Zsh => Shell::Zsh.file_name(name),
            CompletionShell::Fish => Shell::Fish.file_name(name),
            CompletionShell::PowerShell => Shell::PowerShell.file_name(name),
            CompletionShell::Elvish => Shell::Elvish.file_name(name),
            CompletionShell::Nushell => Nushell.file_name(name),
        }
    }
}

/// Where model sets live.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Model store directory [default: ~/.local/share/arxiv-daily/models]
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Name of the model set inside the store
    #[arg(long, default_value = "daily")]
    pub name: String,
}

impl ModelArgs {
    pub fn store(&self) -> AppResult<ModelStore> {
        Ok(ModelStore::new(DirType::Models.resolve(self.store.as_deref())?))
    }
}

/// Parameters of the reducer the clusterer works on.
#[derive(Args, Debug, Clone)]
pub struct ManifoldArgs {
    /// Neighbourhood size of the manifold reducer
    #[arg(long = "manifold-neighbors", default_value_t = 30)]
    pub n_neighbors: usize,

    /// Output dimensions of the manifold reducer
    #[arg(long = "manifold-components", default_value_t = 20)]
    pub n_components: usize,

    /// Minimum distance between packed points
    #[arg(long = "manifold-min-dist", default_value_t = 0.0)]
    pub min_dist: f64,

    /// Input-space distance
    #[arg(long = "manifold-metric", value_enum, default_value_t = Metric::Cosine)]
    pub metric: Metric,

    /// Layout epochs [default: 500 up to 10000 points, 200 above]
    #[arg(long = "manifold-epochs")]
    pub n_epochs: Option<usize>,
}

/// Parameters of the plotting reducer.
#[derive(Args, Debug, Clone)]
pub struct VisualArgs {
    /// Neighbourhood size of the visualization reducer
    #[arg(long = "visual-neighbors", default_value_t = 15)]
    pub n_neighbors: usize,

    /// Minimum distance between plotted points
    #[arg(long = "visual-min-dist", default_value_t = 0.1)]
    pub min_dist: f64,

    /// Input-space distance
    #[arg(long = "visual-metric", value_enum, default_value_t = Metric::Cosine)]
    pub metric: Metric,

    /// Layout epochs [default: 500 up to 10000 points, 200 above]
    #[arg(long = "visual-epochs")]
    pub n_epochs: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ClustererArgs {
    /// Smallest group of articles that counts as a cluster
    #[arg(long, default_value_t = 250)]
    pub min_cluster_size: usize,

    /// Neighbours used to estimate the density around a point
    #[arg(long, default_value_t = 5)]
    pub min_samples: usize,

    /// Clusters closer than this distance are merged
    #[arg(long, default_value_t = 0.0)]
    pub cluster_selection_epsilon: f64,
}

/// OpenAI-compatible embedding server.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Whether to use secure connection (HTTPS) to the embedding server
    /// Defaults to false for local servers (i.e. `localhost` and private subnets)
    /// Defaults to true for public IP addresses and hostnames
    /// Note: This is not a flag. You must provide a value (true or false) if you use this option.
    #[arg(long)]
    pub secure: Option<bool>,

    /// Host for the embedding server
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port for the embedding server
    #[arg(long, default_value_t = 1234)]
    pub port: u16,

    /// OpenAI API version for the embedding server
    ///
    /// Defaults to "v1" (the standard OpenAI API version)
    #[arg(long, default_value = "v1")]
    pub api_version: String,

    /// Embedding model to request
    #[arg(short, long, default_value = "text-embedding-nomic-embed-text-v1.5")]
    pub model: String,

    /// Timeout of a single request (e.g. `30s`, `2m`)
    #[arg(long, default_value = "60s")]
    pub timeout: String,
}

impl ServerArgs {
    fn is_local(&self) -> bool {
        self.host == "localhost"
            || self.host.ends_with(".local")
            || self.host.ends_with(".internal")
            || self.host.ends_with(".lan")
            || self.host.ends_with(".corp")
            || self.host.ends_with(".home.arpa")
            || self.host.ends_with(".private")
            || self.host.ends_with(".test")
            || self
                .host
                .parse::<std::net::Ipv4Addr>()
                .is_ok_and(|ip| ip.is_loopback() || ip.is_private() || ip.is_link_local())
            || self.host.parse::<std::net::Ipv6Addr>().is_ok_and(|ip| {
                ip.is_loopback() || ip.is_unique_local() || ip.is_unicast_link_local()
            })
    }

    pub fn base_url(&self) -> String {
        let schema = match self.secure {
            Some(true) => "https",
            Some(false) => "http",
            None if self.is_local() => "http",
            None => "https",
        };
        format!("{schema}://{}:{}/{}", self.host, self.port, self.api_version)
    }

    pub fn embedder(&self) -> AppResult<HttpEmbedder> {
        HttpEmbedder::new(self.base_url(), &self.model, humantime::parse_duration(&self.timeout)?)
    }
}

#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Articles sent per request
    #[arg(long, default_value_t = 100)]
    pub chunk_size: usize,

    /// Attempts per chunk before giving up
    #[arg(long, default_value_t = 3)]
    pub max_attempts: usize,

    /// Pause between attempts (e.g. `10s`, `500ms`)
    #[arg(long, default_value = "10s")]
    pub retry_delay: String,
}

impl RetryArgs {
    pub fn policy(&self) -> AppResult<RetryPolicy> {
        Ok(RetryPolicy {
            chunk_size: self.chunk_size,
            max_attempts: self.max_attempts,
            delay: humantime::parse_duration(&self.retry_delay)?,
        })
    }
}

/// Assemble the training configuration from the flags.
fn training_config(
    manifold: &ManifoldArgs,
    visual: &VisualArgs,
    clusterer: &ClustererArgs,
    seed: Option<u64>,
) -> TrainingConfig {
    TrainingConfig {
        manifold: ReducerParams {
            n_neighbors: manifold.n_neighbors,
            n_components: manifold.n_components,
            min_dist: manifold.min_dist,
            metric: manifold.metric,
            n_epochs: manifold.n_epochs,
            seed,
            ..ReducerParams::manifold()
        },
        visual: ReducerParams {
            n_neighbors: visual.n_neighbors,
            min_dist: visual.min_dist,
            metric: visual.metric,
            n_epochs: visual.n_epochs,
            seed,
            ..ReducerParams::visual()
        },
        clusterer: ClustererParams {
            min_cluster_size: clusterer.min_cluster_size,
            min_samples: clusterer.min_samples,
            cluster_selection_epsilon: clusterer.cluster_selection_epsilon,
        },
    }
}

/// Helper trait for accessing verbosity flags on commands.
pub trait GetVerbosity {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel>;
}

impl GetVerbosity for Cmd {
    fn get_verbosity(&self) -> &Verbosity<InfoLevel> {
        match self {
            Cmd::Fetch { verbosity, .. } => verbosity,
            Cmd::Train { verbosity, .. } => verbosity,
            Cmd::Assign { verbosity, .. } => verbosity,
            Cmd::Embed { verbosity, .. } => verbosity,
            Cmd::Inspect { verbosity, .. } => verbosity,
            Cmd::Completion { verbosity, .. } => verbosity,
        }
    }
}

/// Run CPU-bound work off the async runtime.
async fn blocking<T, F>(work: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Other(format!("worker task failed: {e}")))?
}

fn label_counts(labels: impl Iterator<Item = i32>) -> BTreeMap<i32, usize> {
    let mut counts = BTreeMap::new();
    for label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

fn resolve_input(input: Option<&Path>, data_dir: Option<&Path>) -> AppResult<PathBuf> {
    if let Some(path) = input {
        return Ok(path.to_path_buf());
    }
    let dir = DirType::Data.resolve(data_dir)?;
    most_recent_file(&dir)?
        .ok_or_else(|| AppError::Other(format!("no record files in {}", dir.display())))
}

impl Cmd {
    /// Execute the chosen top-level command.
    #[tracing::instrument(name = "Running command", level = "info", skip(self))]
    pub async fn run(&self) -> AppResult<()> {
        match self {
            Cmd::Fetch {
                section,
                data_dir,
                feed_url,
                timeout,
                ..
            } => {
                let data_dir = DirType::Data.resolve(data_dir.as_deref())?;
                let client = reqwest::Client::builder()
                    .timeout(humantime::parse_duration(timeout)?)
                    .build()?;
                let feed = fetch_feed(&client, feed_url, section).await?;
                let path = feed.write_to(&data_dir)?;
                indicatif_println!(
                    "Fetched {} articles of {} for {} -> {}",
                    feed.documents.len(),
                    section,
                    feed.published,
                    path.display()
                );
                Ok(())
            }
            Cmd::Train {
                data_dir,
                model,
                manifold,
                visual,
                clusterer,
                seed,
                ..
            } => {
                let data_dir = DirType::Data.resolve(data_dir.as_deref())?;
                let store = model.store()?;
                let name = model.name.clone();
                let config = training_config(manifold, visual, clusterer, *seed);
                let report = blocking(move || train(&data_dir, &store, &name, &config)).await?;

                indicatif_println!(
                    "Committed {} -- observations: {}; clusters: {}; noise: {}",
                    report.version,
                    report.observations,
                    report.clusters,
                    report.noise
                );
                for (label, count) in label_counts(report.labels.iter().copied()) {
                    indicatif_println!("{label:>4}: {count}");
                }
                Ok(())
            }
            Cmd::Assign {
                input,
                data_dir,
                model,
                output,
                plot,
                descriptions,
                ..
            } => {
                let input = resolve_input(input.as_deref(), data_dir.as_deref())?;
                info!("Assigning records from {}", input.display());
                let records = read_records(&input)?;
                let store = model.store()?;
                let name = model.name.clone();
                let descriptions = match descriptions {
                    Some(path) => DescriptionMap::load(path)?,
                    None => DescriptionMap::default(),
                };

                let plot = plot.clone();
                let (set, records, assignments, descriptions) = blocking(move || {
                    let mut records = records;
                    let set = store.load(&name)?;
                    let assignments: Vec<Assignment> = assign_records(&set, &records)?;
                    let descriptions = descriptions.for_model(&set.version);
                    if let Some(path) = &plot {
                        let batch: Vec<Vec<f32>> =
                            records.iter().map(|r| r.embedding.clone()).collect();
                        let labels: Vec<i32> = assignments.iter().map(|a| a.label).collect();
                        render_plot(&set, &batch, &labels, &descriptions, path)?;
                    }
                    annotate_records(&mut records, &assignments, &descriptions)?;
                    Ok((set, records, assignments, descriptions))
                })
                .await?;

                let noise = assignments.iter().filter(|a| a.label == NOISE).count();
                indicatif_println!(
                    "Model {} -- obs: {}; noise: {}",
                    set.version,
                    assignments.len(),
                    noise
                );
                for (label, count) in label_counts(assignments.iter().map(|a| a.label)) {
                    indicatif_println!("{label:>4} {count:>6}  {}", descriptions.describe(label));
                }
                if let Some(path) = output {
                    write_records(path, &records)?;
                    info!("Wrote annotated records to {}", path.display());
                }
                Ok(())
            }
            Cmd::Embed {
                input,
                output,
                server,
                retry,
                ..
            } => {
                let documents: Vec<Map<String, Value>> = read_json_file(input)?;
                let embedder = ChunkedEmbedder::new(server.embedder()?, retry.policy()?);
                let records = embed_records(&embedder, documents, &server.model).await?;
                let output = output.as_deref().unwrap_or(input);
                write_records(output, &records)?;
                info!("Wrote {} embedded records to {}", records.len(), output.display());
                Ok(())
            }
            Cmd::Inspect { model, .. } => {
                let manifest = model.store()?.manifest(&model.name)?;
                indicatif_println!("{}", serde_json::to_string_pretty(&manifest)?);
                Ok(())
            }
            Cmd::Completion { shell, output, .. } => {
                let mut cmd = Cli::command();
                if let Some(output_path) = output {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .create(true)
                        .open(output_path)?;
                    // Write completion script to the requested file.
                    generate(shell, &mut cmd, "arxiv-daily", &mut file);
                    info!(
                        "Generated completion script for {} at {}",
                        shell,
                        output_path.display()
                    );
                } else {
                    generate(shell, &mut cmd, "arxiv-daily", &mut std::io::stdout());
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str, secure: Option<bool>) -> ServerArgs {
        ServerArgs {
            secure,
            host: host.to_string(),
            port: 1234,
            api_version: "v1".into(),
            model: "m".into(),
            timeout: "5s".into(),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn local_hosts_default_to_http() {
        assert_eq!(server("localhost", None).base_url(), "http://localhost:1234/v1");
        assert_eq!(server("192.168.1.20", None).base_url(), "http://192.168.1.20:1234/v1");
        assert_eq!(server("api.example.com", None).base_url(), "https://api.example.com:1234/v1");
        assert_eq!(server("localhost", Some(true)).base_url(), "https://localhost:1234/v1");
    }

    #[test]
    fn train_flags_build_the_config() {
        let cli = Cli::try_parse_from([
            "arxiv-daily",
            "train",
            "--seed",
            "7",
            "--min-cluster-size",
            "100",
            "--visual-neighbors",
            "20",
        ])
        .unwrap();
        let Cmd::Train {
            manifold,
            visual,
            clusterer,
            seed,
            ..
        } = cli.cmd
        else {
            panic!("expected train");
        };
        let config = training_config(&manifold, &visual, &clusterer, seed);
        assert_eq!(config.manifold.n_neighbors, 30);
        assert_eq!(config.manifold.n_components, 20);
        assert_eq!(config.manifold.seed, Some(7));
        assert_eq!(config.visual.n_neighbors, 20);
        assert_eq!(config.visual.n_components, 2);
        assert_eq!(config.clusterer.min_cluster_size, 100);
    }

    #[test]
    fn fetch_defaults_to_the_cs_feed() {
        let cli = Cli::try_parse_from(["arxiv-daily", "fetch"]).unwrap();
        let Cmd::Fetch {
            section, feed_url, ..
        } = cli.cmd
        else {
            panic!("expected fetch");
        };
        assert_eq!(section, "cs");
        assert_eq!(feed_url, "https://rss.arxiv.org/rss");
    }

    #[test]
    fn retry_flags_parse_durations() {
        let retry = RetryArgs {
            chunk_size: 10,
            max_attempts: 2,
            retry_delay: "500ms".into(),
        };
        assert_eq!(retry.policy().unwrap().delay, Duration::from_millis(500));
        let bad = RetryArgs {
            retry_delay: "soon".into(),
            ..retry
        };
        assert!(matches!(bad.policy(), Err(AppError::DurationParse(_))));
    }

    #[test]
    fn explicit_input_wins() {
        let path = PathBuf::from("/tmp/day.json");
        assert_eq!(resolve_input(Some(&path), None).unwrap(), path);
    }
}
