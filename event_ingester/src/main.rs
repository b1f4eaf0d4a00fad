//! Entrypoint of the event_ingester binary

use dotenvy::dotenv;
use event_ingester_clap_blocks::logging::LoggingConfig;

mod commands {
    pub(crate) mod common;
    pub(crate) mod generate;
    pub(crate) mod run;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "event_ingester",
    version,
    about = "Moves JSON events from a message queue into object storage in batches",
    long_about = r#"Moves JSON events from a message queue into object storage in batches

Examples:
    # Ingest from an SQS queue into a local directory, one object per received batch
    event_ingester run --queue-name events --object-store file --data-dir ~/.event_ingester

    # Ingest into S3, flushing every 5 non-empty poll cycles or every 2 minutes
    event_ingester run --queue-name events --object-store s3 --bucket my-bucket \
        --flush-cycles 5 --flush-max-age 2m

    # Print sample events, two per second
    event_ingester generate --rate 2

    # Send 1000 sample events to a local SQS compatible queue
    event_ingester generate --count 1000 --send --queue-name events \
        --queue-endpoint http://localhost:4566
"#
)]
struct Config {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Consume events from the queue and write them to the object store
    Run(commands::run::Config),

    /// Produce synthetic sample events
    Generate(commands::generate::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("event-ingester")
        .build()?;

    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Run(config)) => {
                init_logs(&config.logging_config);
                if let Err(e) = commands::run::command(config).await {
                    eprintln!("Run command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Generate(config)) => {
                init_logs(&config.logging_config);
                if let Err(e) = commands::generate::command(config).await {
                    eprintln!("Generate command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

fn init_logs(config: &LoggingConfig) {
    if let Err(e) = config.install_global_subscriber() {
        eprintln!("Initializing logs failed: {e}");
        std::process::exit(ReturnCode::Failure as _);
    }
}

/// Source the .env file before initialising the Config struct - this sets any envs in the
/// file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing env file is fine, defaults apply
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}
