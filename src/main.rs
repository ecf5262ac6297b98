use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use cody::client::reindex::BackendReindexRunner;
use cody::client::watcher::NotifyWatcher;
use cody::client::{
    BackendClient, ChatOptions, ChatSession, ManualTrigger, ReindexTrigger, RequestOutcome,
    TriggerConfig, WatchFilter,
};
use cody::config::{self, ClientSettings, ServerConfig};
use cody::protocol::{FixBugRequest, GenerateRequest};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "cody",
    about = "Retrieval-augmented coding assistant: backend server and command-line client",
    version
)]
struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP backend
    Serve {
        /// Optional cody.toml; environment variables override it
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Generate code from an instruction
    Generate {
        prompt: String,
        #[arg(short, long, default_value = "python")]
        language: String,
        /// File whose content is sent as the current selection
        #[arg(short, long)]
        context: Option<PathBuf>,
    },
    /// Ask a question about a file, optionally receiving edits
    Ask {
        prompt: String,
        #[arg(short, long, default_value = "python")]
        language: String,
        /// File the question is about (workspace-relative)
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Ask the backend for whole-file edits
        #[arg(long)]
        edits: bool,
    },
    /// Fix a bug given the failing code and its error message
    Fix {
        file: PathBuf,
        #[arg(short, long)]
        error: String,
        #[arg(short, long, default_value = "python")]
        language: String,
    },
    /// Watch a project and reindex it after enough changes settle
    Watch {
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Changed files needed before a reindex fires
        #[arg(long)]
        threshold: Option<usize>,
        /// Quiet period in seconds
        #[arg(long)]
        debounce: Option<u64>,
        /// Reindex once at startup
        #[arg(long)]
        now: bool,
    },
    /// Show or change client settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Set the backend URL
    SetUrl { url: String },
    /// Set retry count (clamped to 1..=5)
    SetRetries { retries: u32 },
    /// Set request timeout in milliseconds (clamped to 5000..=60000)
    SetTimeout { millis: u64 },
    /// Store the OpenAI API key in the system keychain
    SetKey { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = ClientSettings::load();
    let server_config = match &cli.command {
        Command::Serve { config } => Some(ServerConfig::load(config.as_deref())?),
        _ => None,
    };
    let debug = cli.debug
        || settings.debug_mode
        || server_config.as_ref().is_some_and(|c| c.debug);
    cody::logging::init(debug);

    match cli.command {
        Command::Serve { .. } => {
            let server_config = server_config.unwrap_or_default();
            server_config.validate()?;
            cody::server::serve(server_config).await
        }
        Command::Generate {
            prompt,
            language,
            context,
        } => {
            let client = BackendClient::new(settings);
            let context = context.map(read_file).transpose()?;
            let request = GenerateRequest {
                prompt,
                language,
                context,
            };
            let response = settle(client.generate(&request).await)?;
            println!("{}", response.code);
            Ok(())
        }
        Command::Ask {
            prompt,
            language,
            file,
            edits,
        } => {
            let client = BackendClient::new(settings);
            let options = ChatOptions {
                language,
                context: file.as_ref().map(read_file).transpose()?,
                include_code_edits: edits,
                current_file: file.map(|f| f.to_string_lossy().replace('\\', "/")),
            };
            let mut session = ChatSession::new();
            let response = settle(client.chat(&mut session, &prompt, &options).await)?;
            println!("{}", response.response);
            for edit in response.code_edits.unwrap_or_default() {
                println!("\n--- proposed edit: {} ---\n{}", edit.file, edit.new_text);
            }
            Ok(())
        }
        Command::Fix {
            file,
            error,
            language,
        } => {
            let client = BackendClient::new(settings);
            let request = FixBugRequest {
                code: read_file(&file)?,
                error_message: error,
                language,
            };
            let response = settle(client.fix_bug(&request).await)?;
            println!("{}", response.fixed_code);
            Ok(())
        }
        Command::Watch {
            path,
            threshold,
            debounce,
            now,
        } => watch(settings, path, threshold, debounce, now).await,
        Command::Config { action } => configure(settings, action),
    }
}

fn read_file(path: impl AsRef<std::path::Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn settle<T>(outcome: RequestOutcome<T>) -> Result<T> {
    outcome.into_result().map_err(|e| anyhow!(e))
}

async fn watch(
    settings: ClientSettings,
    path: PathBuf,
    threshold: Option<usize>,
    debounce: Option<u64>,
    now: bool,
) -> Result<()> {
    let root = path
        .canonicalize()
        .with_context(|| format!("cannot watch {}", path.display()))?;
    let client = BackendClient::new(settings);
    let runner = BackendReindexRunner::new(client, root.to_string_lossy());

    let defaults = TriggerConfig::default();
    let config = TriggerConfig {
        threshold: threshold.unwrap_or(defaults.threshold),
        debounce: debounce.map(Duration::from_secs).unwrap_or(defaults.debounce),
    };
    let trigger = ReindexTrigger::new(
        Arc::new(runner),
        WatchFilter::default().with_root(&root),
        config,
    );
    let _watcher = NotifyWatcher::start(&root, Arc::new(trigger.clone()))
        .with_context(|| format!("failed to watch {}", root.display()))?;

    eprintln!(
        "Watching {} (reindex after {} change(s) and {}s of quiet). Ctrl-C to stop.",
        root.display(),
        config.threshold,
        config.debounce.as_secs()
    );
    if now && trigger.trigger_now() == ManualTrigger::Started {
        trigger.wait_until_settled().await;
        report_reindex(&trigger);
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    trigger.wait_until_settled().await;
    Ok(())
}

fn report_reindex(trigger: &ReindexTrigger) {
    match trigger.last_outcome() {
        Some(RequestOutcome::Success { data }) => eprintln!("{}", data.output),
        Some(RequestOutcome::Failure { error }) => eprintln!("Reindex failed: {}", error),
        None => {}
    }
}

fn configure(mut settings: ClientSettings, action: Option<ConfigAction>) -> Result<()> {
    let Some(action) = action else {
        println!("Settings: {}", ClientSettings::location());
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    };
    match action {
        ConfigAction::SetUrl { url } => {
            let candidate = ClientSettings {
                backend_url: url,
                ..settings.clone()
            }
            .normalized();
            candidate.validate()?;
            settings = candidate;
        }
        ConfigAction::SetRetries { retries } => {
            settings.max_retries = retries;
            settings = settings.normalized();
        }
        ConfigAction::SetTimeout { millis } => {
            settings.request_timeout = millis;
            settings = settings.normalized();
        }
        ConfigAction::SetKey { key } => {
            config::store_api_key(key.trim()).context("failed to store key in keychain")?;
            println!("API key stored in the system keychain");
            return Ok(());
        }
    }
    settings.save()?;
    println!("Saved {}", ClientSettings::location());
    Ok(())
}
