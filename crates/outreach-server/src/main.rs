//! Outreach - Bulk send and follow-up entry point

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use outreach_common::config::{Config, LoggingConfig};
use outreach_common::types::{email_key, ContactStatus};
use outreach_core::{
    AccountPool, Dispatcher, FollowUpEngine, MessageTemplate, ProgressEvent, SmtpTransport,
};
use outreach_storage::{JsonFileStore, RecordStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "outreach")]
#[command(about = "Rotating-account bulk email sender with rule-driven follow-ups")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./outreach.toml, ./config.toml, /etc/outreach/config.toml)
    #[arg(short, long, global = true, env = "OUTREACH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a campaign to stored contacts
    Send {
        /// Subject template
        #[arg(short, long)]
        subject: String,

        /// Plain text body template file
        #[arg(short, long)]
        body: PathBuf,

        /// HTML body template file
        #[arg(long)]
        html: Option<PathBuf>,

        /// Send to at most this many contacts
        #[arg(short, long)]
        max_emails: Option<usize>,

        /// Only contacts with this status: pending, sent, failed
        #[arg(long, default_value = "pending")]
        status: ContactStatus,
    },

    /// Send follow-ups that are due under the configured rules
    FollowUp {
        /// List due follow-ups without sending
        #[arg(long)]
        dry_run: bool,
    },

    /// Schedule the next follow-up for one contact
    Schedule {
        /// Contact email
        #[arg(short, long)]
        email: String,

        /// Follow-up rule name
        #[arg(short, long)]
        rule: String,
    },

    /// Show the configured sending accounts
    Accounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    init_logging(&config.logging);

    config.resolve_accounts()?;
    config.validate()?;

    // Initialize record store
    let store = JsonFileStore::new(&config.storage.path)?;

    // Initialize account pool and dispatcher
    let transport = SmtpTransport::new(config.pool.hello_name.clone())
        .with_timeout(config.dispatch.send_timeout());
    let pool = Arc::new(
        AccountPool::new(config.accounts.clone(), Arc::new(transport))
            .with_max_failures(config.pool.max_failures)
            .with_session_timeout(config.dispatch.send_timeout()),
    );
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), config.dispatch.clone()));
    info!("Loaded {} sending accounts", pool.len());

    // Ctrl-C cancels the running batch between contacts
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, stopping after the current contact");
                cancel.cancel();
            }
        });
    }

    let result = match cli.command {
        Commands::Send {
            subject,
            body,
            html,
            max_emails,
            status,
        } => {
            let template = MessageTemplate {
                subject,
                body: read_template(&body).await?,
                html: match html {
                    Some(path) => Some(read_template(&path).await?),
                    None => None,
                },
            };
            send(&store, &dispatcher, &template, max_emails, status, &cancel).await
        }
        Commands::FollowUp { dry_run } => {
            let engine = FollowUpEngine::new(dispatcher.clone()).with_rules(config.rules.clone());
            follow_up(&store, &engine, dry_run, &cancel).await
        }
        Commands::Schedule { email, rule } => {
            let engine = FollowUpEngine::new(dispatcher.clone()).with_rules(config.rules.clone());
            schedule(&store, &engine, &email, &rule).await
        }
        Commands::Accounts => {
            println!("{}", serde_json::to_string_pretty(&pool.account_stats())?);
            Ok(())
        }
    };

    pool.close_all().await;
    result
}

async fn read_template(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read template {}", path.display()))
}

fn report(event: ProgressEvent<'_>) {
    let outcome = event.outcome;
    match outcome.error() {
        None => info!(
            "[{}/{}] {} sent via {}",
            event.index,
            event.total,
            outcome.recipient(),
            outcome.account()
        ),
        Some(e) => warn!(
            "[{}/{}] {} failed: {}",
            event.index,
            event.total,
            outcome.recipient(),
            e
        ),
    }
}

async fn send(
    store: &JsonFileStore,
    dispatcher: &Dispatcher,
    template: &MessageTemplate,
    max_emails: Option<usize>,
    status: ContactStatus,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut contacts = store.load_contacts().await?;

    let indices: Vec<usize> = contacts
        .iter()
        .enumerate()
        .filter(|(_, contact)| contact.status == status)
        .map(|(index, _)| index)
        .collect();
    let mut selected: Vec<_> = indices.iter().map(|&i| contacts[i].clone()).collect();
    info!("{} of {} contacts are {}", selected.len(), contacts.len(), status);

    let mut progress = report;
    let stats = dispatcher
        .send_campaign(&mut selected, template, max_emails, cancel, Some(&mut progress))
        .await?;

    for (index, contact) in indices.into_iter().zip(selected) {
        contacts[index] = contact;
    }
    store.save_contacts(&contacts).await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn follow_up(
    store: &JsonFileStore,
    engine: &FollowUpEngine,
    dry_run: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut contacts = store.load_contacts().await?;
    let mut history = store.load_history().await?;
    let now = Utc::now();

    if dry_run {
        for (contact, rule) in engine.find_due(&contacts, &history, now) {
            println!("{}\t{}", contact.email, rule.name);
        }
        return Ok(());
    }

    let mut progress = report;
    let stats = engine
        .run(&mut contacts, &mut history, now, cancel, Some(&mut progress))
        .await?;

    store.save_contacts(&contacts).await?;
    store.save_history(&history).await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn schedule(
    store: &JsonFileStore,
    engine: &FollowUpEngine,
    email: &str,
    rule: &str,
) -> Result<()> {
    let mut contacts = store.load_contacts().await?;
    let key = email_key(email);

    let contact = contacts
        .iter_mut()
        .find(|contact| contact.key() == key)
        .with_context(|| format!("No contact with email {}", email))?;
    let at = engine.schedule(contact, rule, Utc::now())?;

    store.save_contacts(&contacts).await?;
    println!("{}\t{}", email, at.to_rfc3339());
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},outreach=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
