use std::path::PathBuf;
use std::process::ExitCode;

use axum::routing::get;
use axum::Router;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tower_http::trace::TraceLayer;

use panic_recovery::dispatch::{self, Dispatcher};
use panic_recovery::handler::{StackPrint, TracingHandler};
use panic_recovery::http::{self as recovery_http, RecoveryLayer};
use panic_recovery::logging::{init_logging, LoggingConfig};
use panic_recovery::settings::{self, Settings};
use panic_recovery::throw;

/// Stack rendering for reported faults
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliStackPrint {
    /// Message and full stack in one log line
    Full,
    /// Short message, stack in a `full` field
    Structured,
    /// Short message only
    None,
}

impl From<CliStackPrint> for StackPrint {
    fn from(mode: CliStackPrint) -> Self {
        match mode {
            CliStackPrint::Full => StackPrint::Full,
            CliStackPrint::Structured => StackPrint::Structured,
            CliStackPrint::None => StackPrint::None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "recovery-demo")]
#[command(version)]
#[command(about = "Demonstrates panic recovery for threads, tasks and HTTP handlers")]
struct Cli {
    /// Settings file (TOML); RECOVERY__* environment variables override it
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Override the stack rendering of reported faults
    #[arg(long, value_enum, global = true)]
    stack_print: Option<CliStackPrint>,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo HTTP application
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on
        #[arg(long, short, default_value = "3000")]
        port: u16,
    },
    /// Print the resolved settings as TOML
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut resolved = match &cli.config {
        Some(path) => Settings::load(path),
        None => Settings::from_env(),
    };
    if let (Ok(settings), Some(mode)) = (&mut resolved, cli.stack_print) {
        settings.stack_print = mode.into();
    }
    let settings = match resolved {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Config => match settings.to_toml() {
            Ok(rendered) => {
                print!("{}", rendered);
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: {}", err);
                ExitCode::FAILURE
            }
        },
        Command::Serve { bind, port } => {
            if let Err(err) = init_logging(LoggingConfig::from_verbosity(cli.verbose)) {
                eprintln!("error: {}", err);
                return ExitCode::FAILURE;
            }
            if let Err(err) = settings::install(settings) {
                eprintln!("error: {}", err);
                return ExitCode::FAILURE;
            }
            serve(&bind, port)
        }
    }
}

fn serve(bind: &str, port: u16) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let address = format!("{}:{}", bind, port);
    let result = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&address).await?;
        tracing::info!(%address, "listening");
        axum::serve(listener, app()).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server stopped");
            ExitCode::FAILURE
        }
    }
}

fn app() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/panic", get(panic_route))
        .route("/throw", get(throw_route))
        .route("/abort", get(abort_route))
        .route("/spawn", get(spawn_route))
        .layer(RecoveryLayer::with_reporter(TracingHandler::from_settings()))
        .layer(TraceLayer::new_for_http())
}

async fn panic_route() -> &'static str {
    let orders: Vec<u32> = Vec::new();
    let _first = orders[0];
    "unreachable"
}

async fn throw_route() -> &'static str {
    throw(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "order 7 not found",
    ))
}

async fn abort_route() -> &'static str {
    recovery_http::abort()
}

async fn spawn_route() -> &'static str {
    Dispatcher::new_shared(dispatch::default_handler())
        .named("background")
        .spawn(async { panic!("background job failed") });
    "spawned"
}
