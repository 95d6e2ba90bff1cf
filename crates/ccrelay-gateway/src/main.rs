use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use ccrelay_auth::authority::TokenAuthority;
use ccrelay_auth::oauth::{authorize_url, pkce_pair, OAuthClient};
use ccrelay_core::config::{config_dir, RelayConfig};
use ccrelay_upstream::client::UpstreamClient;

mod admission;
mod app;
mod http;
mod localauth;
mod stream;
mod telemetry;
mod watcher;

#[derive(Parser)]
#[command(name = "ccrelay", version, about = "Local reverse proxy for the Anthropic API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy (default).
    Serve {
        /// Bind host, overriding config.json.
        #[arg(long)]
        host: Option<String>,
        /// Bind port, overriding config.json.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Authorize via the browser OAuth flow and store the credential.
    Login,
    /// Delete the stored credential.
    Logout,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ccrelay=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        None => serve(None, None).await,
        Some(Command::Serve { host, port }) => serve(host, port).await,
        Some(Command::Login) => login().await,
        Some(Command::Logout) => logout(),
    };

    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn serve(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let dir = config_dir();
    let config = RelayConfig::load(&dir)?;

    let authority = Arc::new(TokenAuthority::new(&dir));
    if !authority.is_authenticated() {
        anyhow::bail!("not authenticated — run `ccrelay login` first");
    }

    let config_watcher = watcher::ConfigWatcher::spawn(dir.clone())
        .map_err(|e| anyhow::anyhow!("config watcher failed: {e}"))?;

    let admission = Arc::new(admission::Admission::new());
    admission.spawn_sweeper();

    let state = Arc::new(app::AppState {
        upstream: UpstreamClient::new(authority.clone()),
        authority,
        admission,
        models: config_watcher.models.clone(),
        api_key: config_watcher.api_key.clone(),
        telemetry: Arc::new(telemetry::LogSink),
    });
    let router = app::build_router(state);

    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("ccrelay listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("drained, shutting down");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM so in-flight requests drain before exit.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
}

/// The PKCE authorization-code flow: open the printed URL, paste the code
/// the callback page shows, and the triple lands in `auth.json`.
async fn login() -> anyhow::Result<()> {
    let pkce = pkce_pair().map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("Open this URL in your browser and authorize:\n");
    println!("  {}\n", authorize_url(&pkce));
    print!("Paste the code shown on the callback page: ");
    std::io::stdout().flush()?;

    let mut code = String::new();
    std::io::stdin().read_line(&mut code)?;
    let code = code.trim();
    if code.is_empty() {
        anyhow::bail!("no code entered");
    }

    let record = OAuthClient::default()
        .exchange_code(code, &pkce.verifier)
        .await?;
    let authority = TokenAuthority::new(&config_dir());
    authority.install(&record)?;
    println!("Logged in. Credential saved to {}", config_dir().join("auth.json").display());
    Ok(())
}

fn logout() -> anyhow::Result<()> {
    let authority = TokenAuthority::new(&config_dir());
    authority.clear()?;
    println!("Logged out.");
    Ok(())
}
