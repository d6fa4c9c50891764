use clap::{Args, Parser, Subcommand};
use shopchat::catalog::load_catalog;
use shopchat::config::Config;
use shopchat::{logging, runtime};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(
    name = "shopchat",
    version = VERSION,
    about = "Webhook chat assistant for shops on Facebook Messenger and LINE"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start the webhook server (default)
    Start,
    /// Parse a catalog and try lookups without starting the server
    Catalog(CatalogCommand),
    /// Show version
    Version,
}

#[derive(Debug, Args)]
struct CatalogCommand {
    /// Path or http(s) URL of the catalog CSV
    source: String,
    /// Lookup queries to resolve against the parsed catalog
    #[arg(short, long)]
    query: Vec<String>,
}

async fn inspect_catalog(cmd: CatalogCommand) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let snapshot = load_catalog(&cmd.source, &http).await?;
    println!("{} products", snapshot.len());
    if cmd.query.is_empty() {
        println!("{}", snapshot.render_lines());
        return Ok(());
    }
    for query in &cmd.query {
        match snapshot.lookup(query) {
            Some(record) => println!(
                "{query} => {} (group: {})",
                record.name,
                record.group_key().unwrap_or_else(|| "-".into())
            ),
            None => println!("{query} => no match"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(MainCommand::Start) => {}
        Some(MainCommand::Catalog(cmd)) => return inspect_catalog(cmd).await,
        Some(MainCommand::Version) => {
            println!("shopchat {VERSION}");
            return Ok(());
        }
    }

    let config = Config::load()?;
    if config.log_to_file {
        logging::init_logging(&config.data_dir)?;
    } else {
        logging::init_console_logging();
    }
    info!(
        model = %config.model,
        normalizer = %config.normalizer_model(),
        "Starting shopchat {VERSION}"
    );

    runtime::run(config).await
}
