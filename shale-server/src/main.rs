use clap::{Parser, Subcommand, ValueEnum};
use shale_core::{CasClient, ListMode, Result, ShaleError, StoreOptions};
use shale_server::cli::ListFilter;
use shale_server::{balance, cli, fsck, server};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "shale")]
#[command(about = "Content-addressed object storage")]
struct Cli {
    /// Server address as host:port; defaults to $SHALE_SERVER, then
    /// localhost:6001
    #[arg(long, global = true)]
    server: Option<String>,

    /// Skip objects smaller than this
    #[arg(long, global = true, default_value_t = 0)]
    min_size: u64,

    /// Skip objects not smaller than this
    #[arg(long, global = true, default_value_t = u64::MAX)]
    max_size: u64,

    /// Which objects listings return
    #[arg(long, global = true, value_enum, default_value_t = ListModeArg::Default)]
    list_mode: ListModeArg,

    /// Files of hex keys to leave out of an export
    #[arg(long, global = true)]
    exclude: Vec<PathBuf>,

    /// Refuse the rm command
    #[arg(long, global = true)]
    no_remove: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ListModeArg {
    Default,
    Garbage,
}

impl From<ListModeArg> for ListMode {
    fn from(mode: ListModeArg) -> Self {
        match mode {
            ListModeArg::Default => ListMode::Default,
            ListModeArg::Garbage => ListMode::Garbage,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a single storage repository
    Storage {
        /// Repository directory
        #[arg(default_value = ".")]
        path: String,

        #[arg(short, long, default_value = "0.0.0.0:6001")]
        bind: String,

        /// Do not allow read requests
        #[arg(long)]
        disable_read: bool,
    },
    /// Serve the cluster balancer
    Balancer {
        /// Path to the cluster configuration file
        #[arg(short, long, default_value = "balancer.yaml")]
        config: String,

        #[arg(short, long, default_value = "0.0.0.0:6001")]
        bind: String,
    },
    /// Verify repository integrity
    Fsck { paths: Vec<PathBuf> },
    /// Retrieve the given objects to standard output
    Get { keys: Vec<String> },
    /// Insert objects from standard input or the given files
    Put { paths: Vec<PathBuf> },
    /// Permanently remove the given objects
    Rm { keys: Vec<String> },
    /// List all objects, subject to filters
    List,
    /// Print capacity figures
    Capacity,
    /// Free disk space used by deleted objects
    Compact,
    /// Start a garbage collection cycle and print its id
    BeginGc,
    /// Mark objects as NOT garbage
    MarkGc { keys: Vec<String> },
    /// Remove all non-marked objects from the given cycle
    EndGc { id: u64 },
    /// Connect, then disconnect
    Ping,
    /// Ensure proper object placement after an outage
    Balance { config: String },
    /// Export objects listed on standard input or in the given file
    Export { path: Option<PathBuf> },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shale=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if cli.min_size >= cli.max_size {
        tracing::error!(
            "--min-size {} must be below --max-size {}",
            cli.min_size,
            cli.max_size
        );
        std::process::exit(1);
    }

    if let Err(error) = run(cli).await {
        tracing::error!("{}", error);
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let filter = ListFilter {
        mode: args.list_mode.into(),
        min_size: args.min_size,
        max_size: args.max_size,
    };

    match &args.command {
        Commands::Storage {
            path,
            bind,
            disable_read,
        } => {
            server::run_storage_server(
                path,
                bind,
                StoreOptions {
                    disable_read: *disable_read,
                },
            )
            .await
        }
        Commands::Balancer { config, bind } => server::run_balancer_server(config, bind).await,
        Commands::Fsck { paths } => fsck::run(paths),
        Commands::Balance { config } => balance::run(config, args.min_size, args.max_size).await,
        Commands::Get { keys } => cli::get(&client_for(&args), keys).await,
        Commands::Put { paths } => cli::put(&client_for(&args), paths).await,
        Commands::Rm { keys } => {
            if args.no_remove {
                return Err(ShaleError::InvalidRequest(
                    "the 'rm' command is disabled by --no-remove".to_string(),
                ));
            }
            cli::remove(&client_for(&args), keys).await
        }
        Commands::List => cli::list(&client_for(&args), filter).await,
        Commands::Capacity => cli::capacity(&client_for(&args)).await,
        Commands::Compact => cli::compact(&client_for(&args)).await,
        Commands::BeginGc => cli::begin_gc(&client_for(&args)).await,
        Commands::MarkGc { keys } => cli::mark_gc(&client_for(&args), keys).await,
        Commands::EndGc { id } => cli::end_gc(&client_for(&args), *id).await,
        Commands::Ping => cli::ping(&client_for(&args)).await,
        Commands::Export { path } => {
            cli::export(
                &client_for(&args),
                path.as_deref(),
                filter,
                &args.exclude,
            )
            .await
        }
    }
}

fn client_for(args: &Cli) -> CasClient {
    match &args.server {
        Some(addr) => CasClient::new(addr.clone()),
        None => CasClient::from_env(),
    }
}
