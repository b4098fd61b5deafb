//! certctl - certificate lifecycle manager
//!
//! Issue, renew, revoke and inspect X.509 certificates.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use certctl::cli::{self, OutputFormat};
use certctl::request::wildcard_pair;
use certctl::{CertManager, IssueRequest};
use certctl_common::{CertError, CertResult, Identity, KeyAlgorithm};
use certctl_config::{Config, LogFormat, LoggingConfig};

/// certctl - certificate lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "certctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTCTL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory (overrides the configuration)
    #[arg(long = "store", env = "CERTCTL_STORE", global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Human, global = true)]
    output: OutputFormat,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Log format (overrides the configuration)
    #[arg(long = "log-format", value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue a certificate
    Issue {
        /// Subject name; becomes the certificate identity
        #[arg(long)]
        subject: String,

        /// Additional subject alternative name (repeatable)
        #[arg(long = "san")]
        sans: Vec<String>,

        /// Key algorithm: ecdsa-p256, ecdsa-p384 or ed25519
        #[arg(long = "key-alg", default_value = "ecdsa-p256")]
        key_alg: String,

        /// Reissue even if a matching certificate is still valid
        #[arg(long)]
        force: bool,

        /// Issue for the subject's root domain and its wildcard
        #[arg(long)]
        wildcard: bool,

        /// Check names and policy and show the request without issuing
        #[arg(long, conflicts_with = "out")]
        dry_run: bool,

        /// Also write <DIR>/<identity>/<identity>.pem and .key
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// Renew one certificate now, or every certificate that is due
    Renew {
        #[arg(long)]
        identity: Option<String>,

        /// Also write each renewed certificate and key under <DIR>
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// Write a stored certificate and its key as PEM files
    Export {
        #[arg(long)]
        identity: String,

        /// Files go to <DIR>/<identity>/<identity>.pem and .key
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },
    /// Revoke a certificate at its authority
    Revoke {
        #[arg(long)]
        identity: String,
    },
    /// List stored certificates
    List,
    /// Show one stored certificate
    Inspect {
        #[arg(long)]
        identity: String,
    },
    /// Run the renewal scheduler until interrupted
    Run,
    /// Validate the configuration and exit
    CheckConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = cli.output;

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => return config_failure(&e, format),
    };
    init_logging(&cli, &config.logging);

    if let Commands::CheckConfig = cli.command {
        return check_config(&cli, &config);
    }
    if let Err(e) = validate_config(&config) {
        return config_failure(&e, format);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let error = CertError::InternalStore(format!("failed to start runtime: {}", e));
            return emit_error(&error, format);
        }
    };

    runtime.block_on(async move {
        let cancel = CancellationToken::new();
        spawn_interrupt_handler(cancel.clone());

        match execute(cli.command, config, format, &cancel).await {
            Ok((output, code)) => {
                print_stdout(&output);
                ExitCode::from(code)
            }
            Err(e) => emit_error(&e, format),
        }
    })
}

/// Load configuration with priority: `--config` / `CERTCTL_CONFIG` >
/// default path > built-in defaults. `--store` overrides the store path.
fn load_config(args: &Cli) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(store) = &args.store {
        config.store.path = store.clone();
    }
    Ok(config)
}

/// Refuse to run on a configuration with validation errors.
fn validate_config(config: &Config) -> Result<()> {
    let result = config
        .validate()
        .into_result()
        .context("Configuration validation failed")?;
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging(args: &Cli, logging: &LoggingConfig) {
    let level = if args.verbose {
        "debug"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = match args.log_format {
        Some(LogFormatArg::Json) => true,
        Some(LogFormatArg::Text) => false,
        None => logging.format == LogFormat::Json,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(args: &Cli, config: &Config) -> ExitCode {
    let path = args
        .config
        .clone()
        .or_else(Config::default_path)
        .filter(|p| p.exists())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(built-in defaults)".to_string());

    let result = config.validate();
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    info!(
        authority = config.authority.kind.as_str(),
        challenge = %config.authority.challenge,
        store = %config.store.path.display(),
        "Configuration checked"
    );

    print_stdout(&cli::render_validation(&path, &result, args.output));
    if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn execute(
    command: Commands,
    config: Config,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> CertResult<(String, u8)> {
    let manager = CertManager::from_config(config).await?;

    match command {
        Commands::Issue {
            subject,
            sans,
            key_alg,
            force,
            wildcard,
            dry_run,
            out,
        } => {
            let key_algorithm: KeyAlgorithm = key_alg.parse()?;
            let (subject, sans) = if wildcard {
                let [root, star] = wildcard_pair(&subject)?;
                let mut names = vec![star];
                names.extend(sans);
                (root, names)
            } else {
                (subject, sans)
            };

            let request = IssueRequest {
                subject,
                sans,
                key_algorithm,
                force,
            };
            if dry_run {
                let plan = manager.plan_issue(&request)?;
                return Ok((cli::render_plan(&plan, format), 0));
            }

            let outcome = manager.issue(request, cancel).await?;
            let exported = match &out {
                Some(dir) => vec![manager.export(&outcome.certificate().identity, dir)?],
                None => Vec::new(),
            };
            Ok((cli::render_issue(&outcome, &exported, format), 0))
        }
        Commands::Renew {
            identity: Some(identity),
            out,
        } => {
            let identity = Identity::new(identity)?;
            let renewed = manager.renew(&identity, cancel).await?;
            let exported = match &out {
                Some(dir) => vec![manager.export(&identity, dir)?],
                None => Vec::new(),
            };
            Ok((cli::render_renewed(&renewed, &exported, format), 0))
        }
        Commands::Renew {
            identity: None,
            out,
        } => {
            let report = manager.renew_due(cancel).await?;
            let mut exported = Vec::new();
            if let Some(dir) = &out {
                for identity in &report.renewed {
                    exported.push(manager.export(identity, dir)?);
                }
            }
            let code = report.first_error().map_or(0, exit_code);
            Ok((cli::render_report(&report, &exported, format), code))
        }
        Commands::Export { identity, out } => {
            let identity = Identity::new(identity)?;
            let files = manager.export(&identity, &out)?;
            Ok((cli::render_exports(&[files], format), 0))
        }
        Commands::Revoke { identity } => {
            let identity = Identity::new(identity)?;
            let outcome = manager.revoke(&identity, cancel).await?;
            Ok((cli::render_revoke(&outcome, format), 0))
        }
        Commands::List => Ok((cli::render_list(&manager.list()?, format), 0)),
        Commands::Inspect { identity } => {
            let identity = Identity::new(identity)?;
            Ok((cli::render_certificate(&manager.inspect(&identity)?, format), 0))
        }
        Commands::Run => {
            manager.scheduler().run(cancel.clone()).await;
            Ok((String::new(), 0))
        }
        Commands::CheckConfig => Ok((String::new(), 0)),
    }
}

/// Ctrl-C cancels in-flight work; pending authority steps see the token.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, cancelling");
                cancel.cancel();
            }
            Err(e) => debug!(error = %e, "Interrupt handler unavailable"),
        }
    });
}

fn exit_code(error: &CertError) -> u8 {
    u8::try_from(error.exit_code()).unwrap_or(1)
}

fn emit_error(error: &CertError, format: OutputFormat) -> ExitCode {
    let rendered = cli::render_error(error, format);
    if rendered.to_stderr {
        eprintln!("{}", rendered.text);
    } else {
        print_stdout(&rendered.text);
    }
    ExitCode::from(exit_code(error))
}

/// Configuration errors exit as validation failures.
fn config_failure(error: &anyhow::Error, format: OutputFormat) -> ExitCode {
    let message = format!("{:#}", error);
    match format {
        OutputFormat::Human => eprintln!("error[Config]: {}", message),
        OutputFormat::Json => print_stdout(&format!(
            "{}\n",
            serde_json::json!({
                "error": { "kind": "Config", "message": message, "exit_code": 1 }
            })
        )),
    }
    ExitCode::from(1)
}

fn print_stdout(text: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}
