use std::path::PathBuf;
use std::process::exit;

use blobtable::cli::{BlobtableCli, Command};
use blobtable::config::context::build_context;
use blobtable::config::schema::load_config;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(
    name = "blobtable",
    about = "Schema-validated document tables on top of an object store",
    version
)]
struct Args {
    #[clap(short, long = "config", default_value = "blobtable.toml", value_parser)]
    config_path: PathBuf,

    #[clap(long, action, help = "Log in JSON format")]
    json_logs: bool,

    #[clap(long, value_parser, help = "Name recorded as the actor of this run")]
    actor: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

fn prepare_tracing(json_logs: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blobtable=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json_logs {
        builder.json().init()
    } else {
        builder.init()
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    prepare_tracing(args.json_logs);

    info!("Starting blobtable {}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading the config from {:?}: {e}", args.config_path);
            exit(1);
        }
    };

    let mut context = match build_context(&config) {
        Ok(context) => context,
        Err(e) => {
            error!("Error building the blob store: {e}");
            exit(1);
        }
    };
    if let Some(actor) = &args.actor {
        context = context.with_actor(actor);
    }

    let cli = BlobtableCli::new(context);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = cli.run(args.command, &mut out).await {
        eprintln!("{e}");
        exit(1);
    }
}
