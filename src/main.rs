use clap::Parser;
use gsheet_export::auth::{ClientSecret, TokenCache};
use gsheet_export::cli::{
    exit_code, export_ids, export_output_dir, write_report, AuthAction, Cli, Command,
    CredentialArgs, ExportArgs, SheetsAction,
};
use gsheet_export::error::Result;
use gsheet_export::{AuthContext, Config, Exporter, InstalledAppFlow, Registry, SheetsClient};
use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, Level};
use tracing_subscriber::EnvFilter;

/// Main entry point for the application.
///
/// # Steps
/// 1. Parses the command line
/// 2. Initializes logging to stderr, honoring `RUST_LOG` and `--verbose`
/// 3. Loads settings and dispatches the subcommand
///
/// Exits non-zero if the command fails or any export in the batch fails.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("command failed: {}", e);
            eprintln!("error: {}", e);
            if e.kind().is_retryable() {
                eprintln!("this looks transient; running the command again may succeed");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings_path = cli.settings.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&settings_path)?;
    debug!("settings loaded from {:?}", settings_path);

    match cli.command {
        Command::Export(args) => run_export(config, args).await,
        Command::Sheets { action } => {
            run_sheets(&config, action)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Auth { action } => {
            run_auth(config, action).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn apply_credential_args(config: &mut Config, args: &CredentialArgs) {
    if let Some(path) = &args.credentials {
        config.credentials_path = path.clone();
    }
    if let Some(path) = &args.token {
        config.token_path = path.clone();
    }
}

fn credential_flow(config: &Config) -> Result<InstalledAppFlow> {
    InstalledAppFlow::new(&config.credentials_path, &config.token_path)
        .interactive(config.interactive_auth)
        .with_timeout(Duration::from_secs(config.request_timeout_secs))
}

/// Runs one export batch and reports per-job results.
///
/// # Processing Flow
/// 1. Resolves ids from the arguments or the saved registry
/// 2. Obtains a credential once, before any job starts
/// 3. Runs the batch and prints a summary plus each failure
async fn run_export(mut config: Config, args: ExportArgs) -> Result<ExitCode> {
    apply_credential_args(&mut config, &args.credentials);
    if args.no_browser {
        config.interactive_auth = false;
    }
    if args.max_concurrent.is_some() {
        config.max_concurrent_exports = args.max_concurrent;
    }

    let registry = Registry::load(&config.registry_path);
    let ids = export_ids(&args, &registry)?;
    let output_dir = export_output_dir(args.output_dir.clone(), &config, &registry);

    let flow = credential_flow(&config)?;
    let auth = AuthContext::obtain(&flow).await?;
    let client = SheetsClient::new(auth, &config)?;
    let exporter = Exporter::new(Arc::new(client), config);

    let deadline = args.timeout.map(Duration::from_secs);
    let result = exporter
        .run_batch_with_deadline(&ids, output_dir.as_deref(), deadline)
        .await?;

    write_report(&result, &mut io::stdout().lock(), &mut io::stderr().lock())?;

    let code = exit_code(&result);
    if let Err(e) = result.into_result() {
        error!("{}", e);
    }
    Ok(code)
}

fn run_sheets(config: &Config, action: SheetsAction) -> Result<()> {
    let mut registry = Registry::load(&config.registry_path);

    match action {
        SheetsAction::List => {
            if registry.entries().is_empty() {
                println!("No saved spreadsheets.");
            }
            for entry in registry.entries() {
                println!("{}\t{}\t{}", entry.id, entry.display_name(), entry.url);
            }
            println!("Output directory: {}", registry.output_dir().display());
        }
        SheetsAction::Add { url, name } => {
            if registry.add(&url, &name)? {
                println!("Added {}", url);
            } else {
                println!("Already saved: {}", url);
            }
        }
        SheetsAction::Edit { id, url, name } => {
            let entry = registry.edit(&id, url.as_deref(), name.as_deref())?;
            println!("Updated {} ({})", entry.id, entry.display_name());
        }
        SheetsAction::Remove { id } => {
            let entry = registry.remove(&id)?;
            println!("Removed {}", entry.display_name());
        }
        SheetsAction::OutputDir { dir } => {
            registry.set_output_dir(&dir)?;
            println!("Output directory set to {}", dir.display());
        }
    }
    Ok(())
}

async fn run_auth(mut config: Config, action: AuthAction) -> Result<()> {
    match action {
        AuthAction::Status { credentials } => {
            apply_credential_args(&mut config, &credentials);
            let has_secret = config.credentials_path.exists();
            println!(
                "Client secret: {} ({})",
                config.credentials_path.display(),
                if has_secret { "present" } else { "missing" }
            );
            match TokenCache::new(&config.token_path).load() {
                Some(token) if token.is_expired() => println!(
                    "Token: {} (expired{})",
                    config.token_path.display(),
                    if token.refresh_token.is_some() { ", refreshable" } else { "" }
                ),
                Some(_) => println!("Token: {} (valid)", config.token_path.display()),
                None => println!("Token: {} (missing)", config.token_path.display()),
            }
        }
        AuthAction::Login { credentials } => {
            apply_credential_args(&mut config, &credentials);
            config.interactive_auth = true;
            let flow = credential_flow(&config)?;
            AuthContext::obtain(&flow).await?;
            println!("Authenticated; token cached at {}", config.token_path.display());
        }
        AuthAction::Logout { credentials } => {
            apply_credential_args(&mut config, &credentials);
            if TokenCache::new(&config.token_path).clear()? {
                println!("Removed cached token {}", config.token_path.display());
            } else {
                println!("No cached token to remove.");
            }
        }
        AuthAction::Import { file, credentials } => {
            apply_credential_args(&mut config, &credentials);
            ClientSecret::from_file(&file)?;
            if let Some(parent) = config.credentials_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&file, &config.credentials_path)?;
            info!("client secret imported from {:?}", file);
            println!("Client secret installed at {}", config.credentials_path.display());
        }
    }
    Ok(())
}
