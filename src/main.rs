use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tracing::{info, warn};

use mailbot::config::{AppConfig, prompt_password, resolve_cache_dir, resolve_password};
use mailbot::engine::{Collaborators, relay_shutdown, run_forever, run_single_pass};
use mailbot::mailbox::imap::ImapTransport;
use mailbot::outbound::SmtpSender;
use mailbot::proxy::{ContentProxy, HttpFetcher, UrlCache};

/// Watch an IMAP mailbox and act on new mail according to a rule table.
#[derive(Debug, Parser)]
#[command(name = "mailbot", version)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, default_value = "mailbot.yaml")]
    config: PathBuf,

    /// Account password. `EMAIL_PASSWORD` takes precedence.
    #[arg(long)]
    password: Option<String>,

    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,

    /// Validate the configuration, print the rule table and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    let config = AppConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let table = config.rule_table().context("building rule table")?;

    if cli.check {
        for rule in table.rules() {
            println!(
                "#{} {} -> {} | {}{}",
                rule.index,
                rule.name,
                rule.handler.kind(),
                rule.compiled.criterion.to_imap(),
                if rule.compiled.exact { "" } else { " (widened)" }
            );
        }
        return Ok(());
    }

    let password = resolve_password(
        std::env::var("EMAIL_PASSWORD").ok(),
        cli.password.clone(),
        || prompt_password(&config.imap.user),
    )?;

    let sender = Arc::new(SmtpSender::new(
        &config.smtp,
        SecretString::from(password.expose_secret().to_owned()),
    ));
    let mut collaborators = Collaborators::new(sender);
    if let Some(proxy_config) = &config.proxy {
        let cache_dir = resolve_cache_dir(
            std::env::var("CACHE_PREFIX").ok(),
            config.cache_dir.as_deref(),
            std::env::var_os("HOME").map(PathBuf::from),
        );
        info!(cache = %cache_dir.display(), "content proxy enabled");
        let fetcher = Arc::new(HttpFetcher::new(&proxy_config.user_agent)?);
        let proxy = ContentProxy::new(proxy_config.settings(), UrlCache::new(cache_dir), fetcher);
        collaborators = collaborators.with_proxy(Arc::new(proxy));
    }

    let transport = ImapTransport::new(
        config.imap.clone(),
        password,
        config.engine.capabilities(),
    );

    if cli.once {
        let report = run_single_pass(&transport, &table, &collaborators).await?;
        info!(
            processed = report.processed.len(),
            matched = report.matched,
            "single pass finished"
        );
        if let Some(failure) = report.failure {
            bail!("pass halted: {failure}");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(relay_shutdown(tokio::signal::ctrl_c(), shutdown_tx));

    let state = run_forever(
        &transport,
        &table,
        &collaborators,
        &config.engine.loop_settings(),
        shutdown_rx,
    )
    .await;
    info!(passes = state.passes, "bye");
    Ok(())
}
