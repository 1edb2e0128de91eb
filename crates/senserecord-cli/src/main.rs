//! SenseRecord CLI
//!
//! Command-line interface for recording biosensor boards into BIDS-style
//! source data. Records interactively from the terminal or serves the HTTP
//! control API.

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use senserecord_core::events::StdoutEventSink;
use senserecord_core::{
    AppConfig, BoardDescriptor, BoardIdentity, ConflictPolicy, ConnectionParams, DriverRegistry,
    EventSink, IdentifierInput, RecordError, SessionController, StartParams,
};

mod http_api;
mod prompt;

/// SenseRecord - record data streams from biosensor hardware
#[derive(Parser, Debug)]
#[command(name = "senserecord")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ./senserecord.yml, then the user config dir)
    #[arg(short, long, env = "SENSERECORD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a board and report whether it is ready
    Status {
        /// Board name, e.g. SYNTHETIC_BOARD
        board: String,
    },

    /// Record from a board until told to stop
    Start(StartArgs),

    /// Run the HTTP control server
    Serve {
        /// Bind address (defaults to the config value)
        #[arg(long)]
        host: Option<String>,

        /// Port (defaults to the config value)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Board name, e.g. SYNTHETIC_BOARD
    #[arg(short, long)]
    board: Option<String>,

    /// Root directory of the project
    #[arg(long)]
    bidsroot: Option<PathBuf>,

    /// Subject label
    #[arg(long)]
    sub: Option<String>,

    /// Session label
    #[arg(long)]
    ses: Option<String>,

    /// Task label
    #[arg(long)]
    task: Option<String>,

    /// Run number
    #[arg(long)]
    run: Option<String>,

    #[arg(long)]
    data_type: Option<String>,

    #[arg(long)]
    modality: Option<String>,

    /// Acquisition label
    #[arg(long)]
    acq: Option<String>,

    #[arg(long)]
    serial_port: Option<String>,

    #[arg(long)]
    ip_address: Option<String>,

    #[arg(long)]
    ip_port: Option<u16>,

    #[arg(long)]
    ip_protocol: Option<u8>,

    /// Connection timeout in seconds
    #[arg(long)]
    timeout: Option<u32>,

    #[arg(long)]
    mac_address: Option<String>,

    #[arg(long)]
    serial_number: Option<String>,

    #[arg(long)]
    other_info: Option<String>,

    /// Playback file for file-backed boards
    #[arg(long)]
    file: Option<String>,

    /// What to do when the data file already exists
    #[arg(long, value_enum)]
    on_conflict: Option<ConflictArg>,

    /// Fail instead of prompting for missing fields
    #[arg(long)]
    no_input: bool,

    /// Output format for recording events
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,
}

impl StartArgs {
    fn into_params(self, board: String) -> StartParams {
        StartParams {
            board_name: board,
            identifiers: IdentifierInput {
                sub: self.sub,
                ses: self.ses,
                task: self.task,
                run: self.run,
                data_type: self.data_type,
                modality: self.modality,
                acq: self.acq,
            },
            root: self.bidsroot,
            connection: ConnectionParams {
                serial_port: self.serial_port,
                ip_address: self.ip_address,
                ip_port: self.ip_port,
                ip_protocol: self.ip_protocol,
                timeout: self.timeout,
                mac_address: self.mac_address,
                serial_number: self.serial_number,
                other_info: self.other_info,
                file: self.file,
            },
            on_conflict: self.on_conflict.map(ConflictPolicy::from),
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ConflictArg {
    Abort,
    Overwrite,
    Append,
}

impl From<ConflictArg> for ConflictPolicy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Abort => ConflictPolicy::Abort,
            ConflictArg::Overwrite => ConflictPolicy::Overwrite,
            ConflictArg::Append => ConflictPolicy::Append,
        }
    }
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Process exit code for a failure kind
fn exit_code(error: &RecordError) -> u8 {
    match error {
        RecordError::InvalidIdentifier { .. } => 2,
        RecordError::UnknownBoard(_) => 3,
        RecordError::AlreadyRecording(_) => 4,
        RecordError::NotRecording(_) => 5,
        RecordError::InvalidTransition { .. } => 6,
        RecordError::ConnectionError { .. } => 7,
        RecordError::PathConflict(_) => 8,
        RecordError::IoError(_) => 9,
        RecordError::ConfigError(_) => 10,
        RecordError::SerializationError(_) => 11,
    }
}

fn report(error: &RecordError) {
    eprintln!("{} {error}", "Error:".red().bold());
}

fn fail(error: &RecordError) -> ExitCode {
    report(error);
    ExitCode::from(exit_code(error))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match AppConfig::discover(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return fail(&e),
    };

    match args.command {
        Command::Status { board } => cmd_status(&config, board).await,
        Command::Start(start) => cmd_start(&config, start).await,
        Command::Serve { host, port } => cmd_serve(config, host, port).await,
    }
}

async fn cmd_status(config: &AppConfig, board: String) -> ExitCode {
    let defaults = match config.defaults_for(None, &board) {
        Ok(defaults) => defaults,
        Err(e) => return fail(&e),
    };
    let descriptor = BoardDescriptor::new(board.clone()).with_connection(defaults.connection);
    let controller = SessionController::new(DriverRegistry::default(), config.board_identity);

    match controller.probe(&descriptor).await {
        Ok(status) if status.is_recording => {
            println!("{}", format!("{board} is recording").yellow());
            ExitCode::SUCCESS
        }
        Ok(status) if status.is_ready => {
            println!("{}", format!("{board} is ready").green());
            ExitCode::SUCCESS
        }
        Ok(_) => {
            println!("{}", format!("{board} is not ready").yellow());
            ExitCode::FAILURE
        }
        Err(e) => fail(&e),
    }
}

async fn cmd_start(config: &AppConfig, args: StartArgs) -> ExitCode {
    let json_output = matches!(args.format, OutputFormat::Json);
    let interactive = !args.no_input;

    let board = match args.board.clone() {
        Some(board) => board,
        None if interactive => match ask(prompt::board_name).await {
            Ok(board) => board,
            Err(e) => return fail(&e),
        },
        None => {
            return fail(&RecordError::InvalidIdentifier {
                field: "board".to_string(),
                reason: "value is required".to_string(),
            })
        }
    };
    if let Err(e) = board.parse::<senserecord_core::BoardKind>() {
        return fail(&e);
    }

    let mut params = args.into_params(board.clone());
    let defaults = match config.defaults_for(params.identifiers.task.as_deref(), &board) {
        Ok(defaults) => defaults,
        Err(e) => return fail(&e),
    };

    let missing: Vec<&'static str> = params.missing_fields(&defaults);
    if !missing.is_empty() && interactive {
        params = match ask(move || {
            let mut params = params;
            prompt::fill_missing(&mut params, &missing).map(|_| params)
        })
        .await
        {
            Ok(params) => params,
            Err(e) => return fail(&e),
        };
    }

    let request = match params.resolve(&defaults) {
        Ok(request) => request,
        Err(e) => return fail(&e),
    };

    let controller = SessionController::with_events(
        DriverRegistry::default(),
        config.board_identity,
        StdoutEventSink::new(json_output),
    );
    let identity = controller.identity_for(&request.descriptor);

    match controller.start_recording(request).await {
        Ok(handle) => {
            println!(
                "{}",
                format!(
                    "Now recording from {board} to {}",
                    handle.data_path().display()
                )
                .green()
            );
        }
        Err(e) => {
            eprintln!("{}", format!("Failed to start recording from {board}").red());
            return fail(&e);
        }
    }

    let (stopped, interrupted) =
        stop_when_asked(&controller, &identity, &board, next_stop_request).await;
    if interrupted {
        // The confirm prompt still holds a blocking thread on the terminal
        let code = match &stopped {
            Ok(()) => INTERRUPTED_EXIT,
            Err(e) => {
                report(e);
                exit_code(e)
            }
        };
        std::process::exit(i32::from(code));
    }
    match stopped {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

/// Exit status after Ctrl-C ended a recording cleanly
const INTERRUPTED_EXIT: u8 = 130;

/// What the user asked for while a recording runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Confirmed,
    Declined,
    Interrupted,
}

async fn next_stop_request() -> StopRequest {
    tokio::select! {
        answer = ask(prompt::confirm_stop) => match answer {
            Ok(true) => StopRequest::Confirmed,
            Ok(false) => StopRequest::Declined,
            Err(e) => {
                // No terminal left to ask; stop rather than record forever
                tracing::warn!("{e}");
                StopRequest::Confirmed
            }
        },
        () = interrupted() => StopRequest::Interrupted,
    }
}

/// Stop the recording once asked to, retrying while it is still running
///
/// Returns the stop outcome and whether Ctrl-C ended the loop.
async fn stop_when_asked<E, F, Fut>(
    controller: &SessionController<E>,
    identity: &BoardIdentity,
    board: &str,
    mut next_request: F,
) -> (senserecord_core::Result<()>, bool)
where
    E: EventSink,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StopRequest>,
{
    loop {
        let request = next_request().await;
        if request == StopRequest::Declined {
            continue;
        }
        let interrupted = request == StopRequest::Interrupted;
        if interrupted {
            eprintln!("{}", "Interrupted, stopping the recording".yellow());
        }

        match controller.stop_recording(identity).await {
            Ok(_) => {
                println!("{}", format!("Stopped recording from {board}").green());
                return (Ok(()), interrupted);
            }
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("Failed to stop recording from {board}\n{e}").red()
                );
                if interrupted || !controller.query_status(identity).await.is_recording {
                    return (Err(e), interrupted);
                }
            }
        }
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

async fn cmd_serve(config: AppConfig, host: Option<String>, port: Option<u16>) -> ExitCode {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let controller = Arc::new(SessionController::new(
        DriverRegistry::default(),
        config.board_identity,
    ));
    let state = http_api::ApiState {
        controller,
        config: Arc::new(config),
    };

    tracing::info!("Starting SenseRecord control server on {}:{}", host, port);

    let shutdown = async {
        interrupted().await;
        tracing::info!("Shutdown requested");
    };

    match http_api::run_server(state, &host, port, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Run a blocking prompt off the async worker threads
async fn ask<T, F>(prompt: F) -> senserecord_core::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> senserecord_core::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(prompt)
        .await
        .map_err(|e| RecordError::IoError(format!("Prompt task failed: {e}")))?
}
