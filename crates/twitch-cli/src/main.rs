use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use twitch_auth::{DeviceAuthFlow, DeviceFlowOutcome, OAuthClient, TokenAuthority, TokenStore};
use twitch_core::{ClientConfig, ClientEvent, Condition, ObserverBus};
use twitch_eventsub::{EventSubClient, Notification};

const OBSERVER_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "twitchify")]
#[command(about = "Twitch EventSub listener")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./twitchify.toml when present)
    #[arg(long, short, env = "TWITCHIFY_CONFIG")]
    config: Option<PathBuf>,

    /// Where the token is kept between runs
    #[arg(long, env = "TWITCHIFY_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize this device and store the token
    Login {
        /// Scopes to request, in addition to the configured ones
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<String>,
    },
    /// Connect and log notifications until Ctrl-C
    Listen {
        /// Event aliases, e.g. stream_online,raid
        #[arg(long, value_delimiter = ',', default_value = "stream_online,stream_offline")]
        events: Vec<String>,

        /// Watch this user instead of the authenticated one
        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .with_file(false),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ClientConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let store = match cli.token_file {
        Some(path) => TokenStore::new(path),
        None => TokenStore::default_location()?,
    };

    match cli.command {
        Commands::Login { scopes } => login(config, store, scopes).await,
        Commands::Listen { events, user } => listen(config, store, events, user).await,
    }
}

async fn login(config: ClientConfig, store: TokenStore, extra: Vec<String>) -> anyhow::Result<()> {
    let mut scopes = config.scopes.clone();
    for scope in extra {
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }

    let oauth = Arc::new(OAuthClient::new(&config)?);
    let flow = DeviceAuthFlow::new(oauth.clone(), scopes);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let pending = flow.request_code().await?;
    println!(
        "Open {} and enter the code {}",
        pending.verification_uri.cyan(),
        pending.user_code.bold().green()
    );

    let grant = match flow.poll_until_authorized(&cancel).await? {
        DeviceFlowOutcome::Authorized(grant) => grant,
        DeviceFlowOutcome::Cancelled => {
            println!("{}", "Login cancelled".yellow());
            return Ok(());
        }
    };

    let authority = TokenAuthority::new(oauth, &config).with_store(store.clone());
    authority.authenticate(grant).await?;
    let login = authority
        .grant()
        .and_then(|grant| grant.login)
        .unwrap_or_else(|| "unknown user".to_string());
    println!(
        "{} as {}, token saved to {}",
        "Authorized".green(),
        login.bold(),
        store.path().display()
    );
    Ok(())
}

async fn listen(
    config: ClientConfig,
    store: TokenStore,
    events: Vec<String>,
    user: Option<String>,
) -> anyhow::Result<()> {
    let Some(grant) = store.load()? else {
        bail!("no stored token at {}, run `twitchify login` first", store.path().display());
    };

    let (bus, observed) = ObserverBus::new(OBSERVER_CAPACITY);
    let observer = tokio::spawn(log_client_events(observed));

    let oauth = Arc::new(OAuthClient::new(&config)?);
    let authority = Arc::new(
        TokenAuthority::new(oauth, &config)
            .with_store(store)
            .with_event_channel(bus.clone()),
    );
    authority.authenticate(grant).await?;

    let cancel = CancellationToken::new();
    let refresh = authority.spawn_refresh_cycle(cancel.child_token());

    let client = Arc::new(
        EventSubClient::builder(config, authority.clone())
            .event_channel(bus)
            .build()?,
    );

    let log = |n: Arc<Notification>| async move {
        info!(
            subscription = %n.subscription_type(),
            message_id = %n.message_id,
            "{}",
            n.event
        );
        anyhow::Ok(())
    };
    for alias in &events {
        match &user {
            Some(target) => {
                client
                    .add_custom_event(alias, target, log, Condition::new())
                    .await?;
            }
            None => client.on(alias, log)?,
        }
    }

    let stopper = client.clone();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            stopper.shutdown();
            shutdown.cancel();
        }
    });

    let outcome = client.run().await;
    cancel.cancel();
    if let Err(e) = refresh.await {
        warn!("Refresh cycle ended abnormally: {}", e);
    }
    observer.abort();

    outcome?;
    Ok(())
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

async fn log_client_events(mut rx: mpsc::Receiver<ClientEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ClientEvent::Connected { session_id } => info!("Connected, session {}", session_id),
            ClientEvent::Ready { session_id } => {
                println!("{} (session {})", "Listening".green().bold(), session_id)
            }
            ClientEvent::Disconnected { reason, will_retry } => {
                warn!("Disconnected: {} (retry: {})", reason, will_retry)
            }
            ClientEvent::RawFrame { text } => info!("<< {}", text),
            ClientEvent::TokenRefreshed { expires_at } => {
                info!("Token refreshed, valid until {}", expires_at)
            }
            ClientEvent::SubscriptionFailed {
                subscription_type,
                error,
                ..
            } => warn!("Subscription {} failed: {}", subscription_type, error),
            ClientEvent::SubscriptionRevoked {
                subscription_type,
                reason,
                ..
            } => warn!("Subscription {} revoked: {}", subscription_type, reason),
            ClientEvent::Error {
                event_name,
                error,
                context,
            } => error!(
                "{} failed: {} {}",
                event_name,
                error,
                context.unwrap_or_default()
            ),
            ClientEvent::AuthCodeIssued { .. } | ClientEvent::AuthGranted { .. } => {}
        }
    }
}
