use std::env;
use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use podspawn::authkeys;
use podspawn::config::{APP_NAME, AppConfig, LoggingConfig, default_log_file};
use podspawn::identity::Identity;
use podspawn::runtime::{DockerRuntime, Runtime};
use podspawn::session::{FAILURE_EXIT_CODE, Session};

/// Environment variable sshd sets to the client's requested command.
const ORIGINAL_COMMAND_ENV: &str = "SSH_ORIGINAL_COMMAND";

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if swallow_parse_error(&err, env::args_os()) => {
            // sshd's key lookup must always see exit 0
            let _ = write!(io::stderr(), "{err}");
            std::process::exit(0);
        }
        Err(err) => err.exit(),
    };

    let common = &cli.common;
    let code = match cli.command {
        Command::Spawn(cmd) => spawn_main(common, cmd),
        Command::AuthKeys(cmd) => auth_keys_main(common, cmd),
        Command::Stop(cmd) => admin_main(common, |config| handle_stop(config, cmd)),
        Command::Config => admin_main(common, |config| handle_config(common, config)),
        Command::Completions { shell } => admin_main(common, |_| handle_completions(shell)),
    };

    std::process::exit(code);
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Podspawn - ephemeral per-user dev containers behind sshd.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce logging to errors only
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -v)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit JSON (logs, and `config` output)
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a session for a user (sshd ForceCommand entry point)
    Spawn(SpawnCommand),
    /// Print authorized_keys lines for a user (sshd AuthorizedKeysCommand)
    AuthKeys(AuthKeysCommand),
    /// Stop and remove a user's sandbox
    Stop(StopCommand),
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct SpawnCommand {
    /// User whose sandbox to enter
    #[arg(long = "user", visible_alias = "identity", value_name = "USER")]
    user: String,
}

#[derive(Debug, Args)]
struct AuthKeysCommand {
    /// User sshd is authenticating (%u)
    user: String,
    /// Offered key type (%t), ignored
    key_type: Option<String>,
    /// Offered key data (%k), ignored
    key_data: Option<String>,
    /// Anything else sshd was configured to pass, ignored
    #[arg(hide = true)]
    extra: Vec<String>,
}

#[derive(Debug, Args)]
struct StopCommand {
    /// User whose sandbox to stop
    user: String,
}

/// Argument errors on an `auth-keys` command line are reported but not
/// turned into a failing exit status. Help and version output is unaffected.
fn swallow_parse_error(err: &clap::Error, args: impl IntoIterator<Item = OsString>) -> bool {
    err.use_stderr()
        && args
            .into_iter()
            .skip(1)
            .any(|arg| arg.as_os_str() == OsStr::new("auth-keys"))
}

/// The client's requested command. Undecodable bytes are replaced rather
/// than dropped, so a one-shot request never turns into a shell.
fn original_command(value: Option<OsString>) -> Option<String> {
    let value = value?;
    match value.into_string() {
        Ok(command) => Some(command),
        Err(raw) => {
            warn!("{ORIGINAL_COMMAND_ENV} is not valid UTF-8, decoding lossily");
            Some(raw.to_string_lossy().into_owned())
        }
    }
}

/// Where log output goes.
enum LogTarget {
    Stderr,
    File(PathBuf),
    Discard,
}

impl CommonOpts {
    fn effective_log_level(&self, configured: &str) -> String {
        let level = if self.quiet {
            "error"
        } else if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            match self.verbose {
                0 => configured,
                1 => "debug",
                _ => "trace",
            }
        };
        level.to_string()
    }

    fn init_logging(&self, logging: &LoggingConfig, target: LogTarget) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level(&logging.level);
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        let writer = match target {
            LogTarget::Stderr => BoxMakeWriter::new(io::stderr),
            LogTarget::File(path) => match open_log_file(&path) {
                Ok(file) => BoxMakeWriter::new(Mutex::new(file)),
                Err(_) => BoxMakeWriter::new(io::sink),
            },
            LogTarget::Discard => BoxMakeWriter::new(io::sink),
        };

        if self.json || logging.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .ok();
        }
    }

    fn load_config(&self) -> Result<AppConfig> {
        AppConfig::load(self.config.as_deref()).context("loading configuration")
    }
}

fn open_log_file(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

/// Cancel `token` on SIGTERM, SIGHUP or SIGINT.
fn cancel_on_signals(token: CancellationToken) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut hup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
            _ = int.recv() => "SIGINT",
        };
        info!(signal = name, "signal received, cancelling session");
        token.cancel();
    });
    Ok(())
}

/// `ForceCommand` side. stdout and stderr belong to the SSH client, so
/// everything diagnostic goes to the log file only.
fn spawn_main(common: &CommonOpts, cmd: SpawnCommand) -> i32 {
    let config = common.load_config();
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    let target = logging
        .file
        .clone()
        .map(PathBuf::from)
        .or_else(default_log_file)
        .map_or(LogTarget::Discard, LogTarget::File);
    common.init_logging(&logging, target);

    let result = config.and_then(|config| handle_spawn(&config, cmd));
    match result {
        Ok(code) => code,
        Err(err) => {
            error!(stage = "setup", "spawn failed: {err:#}");
            FAILURE_EXIT_CODE
        }
    }
}

fn handle_spawn(config: &AppConfig, cmd: SpawnCommand) -> Result<i32> {
    let identity = Identity::parse(&cmd.user)?;
    let command = original_command(env::var_os(ORIGINAL_COMMAND_ENV));
    let socket = config.engine_socket();
    debug!(identity = %identity, socket = %socket.display(), "starting session");

    let runtime = build_runtime()?;
    let code = runtime.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_signals(cancel.clone())?;

        let engine: Arc<dyn Runtime> = Arc::new(DockerRuntime::new(socket)?);
        let mut session = Session::new(identity, engine, config.session.to_session_config())
            .with_command(command);
        Ok::<_, anyhow::Error>(session.run_and_cleanup(&cancel).await)
    })?;

    // A blocking stdin read may still be parked on a runtime thread
    runtime.shutdown_background();
    Ok(code)
}

/// `AuthorizedKeysCommand` side. Always exits 0: sshd reads a failure as
/// "no keys" anyway, and stdout must carry nothing but key lines.
fn auth_keys_main(common: &CommonOpts, cmd: AuthKeysCommand) -> i32 {
    let config = common.load_config();
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    common.init_logging(&logging, LogTarget::Stderr);

    if let Err(err) = config.and_then(|config| handle_auth_keys(&config, &cmd)) {
        error!(user = %cmd.user, "auth-keys failed: {err:#}");
    }
    0
}

fn handle_auth_keys(config: &AppConfig, cmd: &AuthKeysCommand) -> Result<()> {
    debug!(
        user = %cmd.user,
        key_type = cmd.key_type.as_deref().unwrap_or(""),
        "key lookup"
    );

    let binary = match config.auth.binary.as_ref() {
        Some(path) => PathBuf::from(path),
        None => env::current_exe().context("resolving own executable path")?,
    };
    let key_dir = PathBuf::from(&config.auth.key_dir);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match authkeys::lookup(&cmd.user, &key_dir, &binary, &mut out) {
        Ok(0) => {
            debug!(user = %cmd.user, key_dir = %key_dir.display(), "no keys");
            Ok(())
        }
        Ok(n) => {
            info!(user = %cmd.user, keys = n, "keys emitted");
            Ok(())
        }
        Err(err) => {
            if err.written() > 0 {
                warn!(user = %cmd.user, written = err.written(), "partial key output");
            }
            Err(err.into())
        }
    }
}

/// Operator commands: logs and errors go to stderr, exit 1 on failure.
fn admin_main(common: &CommonOpts, handler: impl FnOnce(&AppConfig) -> Result<()>) -> i32 {
    let result = common.load_config().and_then(|config| {
        common.init_logging(&config.logging, LogTarget::Stderr);
        handler(&config)
    });
    match result {
        Ok(()) => 0,
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            1
        }
    }
}

fn handle_stop(config: &AppConfig, cmd: StopCommand) -> Result<()> {
    let identity = Identity::parse(&cmd.user)?;
    let session = config.session.to_session_config();
    let sandbox = identity.sandbox_name(&session.sandbox_prefix);
    let engine = DockerRuntime::new(config.engine_socket())?;

    let runtime = build_runtime()?;
    runtime.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_signals(cancel.clone())?;

        if !engine.exists(&cancel, &sandbox).await? {
            println!("no sandbox for {identity}");
            return Ok(());
        }
        engine
            .stop(&cancel, &sandbox, session.stop_timeout)
            .await
            .with_context(|| format!("stopping {sandbox}"))?;
        engine
            .remove(&cancel, &sandbox)
            .await
            .with_context(|| format!("removing {sandbox}"))?;
        info!(identity = %identity, sandbox = %sandbox, "sandbox stopped");
        println!("removed {sandbox}");
        Ok(())
    })
}

fn handle_config(common: &CommonOpts, config: &AppConfig) -> Result<()> {
    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(config).context("serializing config to JSON")?
        );
    } else {
        print!("{}", config.to_toml().context("serializing config to TOML")?);
    }
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
