use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use diagnostics::{Category, IpVersion};
use lookingglass::config::{self, Settings};
use lookingglass::{http, Jobs};
use results_sqlite::Db;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const LICENSE: &str = concat!("lookingglass is released under the license: ", env!("CARGO_PKG_LICENSE"));

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[derive(Debug, Parser)]
#[command(name = "lookingglass", version, about = "Network looking glass with shareable result links")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./lookingglass.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the result store (overrides storage.path)
    #[arg(long, global = true)]
    path: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Print license information
    License,
    /// Serve the HTTP looking glass
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(short, long)]
        bind: Option<String>,
        /// Key rate limits on the rightmost non-internal X-Forwarded-For address
        #[arg(long)]
        trust_proxy: bool,
    },
    /// Run one diagnostic, store it and print its id
    Run {
        category: Category,
        /// Target; dig and host accept several words
        #[arg(required = true, num_args = 1..)]
        target: Vec<String>,
        /// Force IPv4 or IPv6 (ping and traceroute only)
        #[arg(long, value_parser = ["4", "6"])]
        protocol_version: Option<String>,
    },
    /// Print a stored result
    Fetch { category: Category, id: String },
    /// List stored results of a category, newest first
    List {
        category: Category,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn format_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

fn open_store(settings: &Settings) -> Result<Arc<Db>> {
    Ok(Arc::new(Db::open_or_create(&settings.storage_path)?))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let loaded_cfg = config::load_config(cli.config.as_deref())?;
    let mut settings = Settings::resolve(loaded_cfg.as_ref())?;
    if let Some(p) = cli.path { settings.storage_path = p; }

    match cli.command {
        Commands::Version => {
            println!("lookingglass {} (core {})", env!("CARGO_PKG_VERSION"), lg_core::version());
        }
        Commands::License => println!("{LICENSE}"),
        Commands::Serve { bind, trust_proxy } => {
            if let Some(b) = bind { settings.bind = b; }
            settings.trust_proxy |= trust_proxy;
            let jobs = Arc::new(Jobs::from_settings(open_store(&settings)?, &settings));
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(http::serve(jobs, &settings.bind, settings.trust_proxy, settings.shutdown_grace))?;
        }
        Commands::Run { category, target, protocol_version } => {
            let version = IpVersion::parse(protocol_version.as_deref())?;
            let jobs = Jobs::from_settings(open_store(&settings)?, &settings);
            let rt = tokio::runtime::Runtime::new()?;
            let token = rt.block_on(jobs.run(category, &target.join(" "), version, "cli"))?;
            println!("/{category}/{token}");
            jobs.close();
        }
        Commands::Fetch { category, id } => {
            let store = open_store(&settings)?;
            let Some(body) = store.get(category.as_str(), &id)? else {
                bail!("no {category} result with id {id}");
            };
            let mut out = std::io::stdout().lock();
            out.write_all(&body)?;
            out.write_all(b"\n")?;
        }
        Commands::List { category, limit, format } => {
            let store = open_store(&settings)?;
            let rows = store.list(category.as_str(), limit)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&rows)?),
                OutputFormat::Text => {
                    for r in &rows {
                        println!("{}  {:>8}  {}", r.token, r.size, format_ms(r.stored_ms));
                    }
                    println!("{} of {} shown", rows.len(), store.count(category.as_str())?);
                }
            }
        }
    }
    Ok(())
}
