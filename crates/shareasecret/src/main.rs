use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "shareasecret",
    about = "Share a client-encrypted secret through a one-time link",
    version
)]
struct Cli {
    /// Server URL for client commands ($SHAREASECRET_SERVER)
    #[arg(long, env = "SHAREASECRET_SERVER", default_value = "http://127.0.0.1:8994")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and the expiry reaper
    Serve {
        /// Port to listen on (default: $SHAREASECRET_PORT or 8994)
        #[arg(long, env = "SHAREASECRET_PORT", default_value = "8994")]
        port: u16,
        /// Host to bind (default: $SHAREASECRET_HOST or 127.0.0.1)
        #[arg(long, env = "SHAREASECRET_HOST", default_value = "127.0.0.1")]
        host: String,
    },
    /// Store an already-encrypted secret (`content.salt.iv`)
    Create {
        /// Encrypted secret as produced by the client
        cipher_text: String,
        /// Minutes until the secret expires
        #[arg(long, default_value = "30")]
        ttl: String,
        /// Views allowed before the secret deletes itself (0 = unlimited)
        #[arg(long, default_value = "1")]
        max_views: String,
    },
    /// Spend one view of a secret and print its cipher text
    Open {
        /// Access id from the share link
        access_id: String,
    },
    /// Show the share link for a secret you created
    Manage {
        /// Management id returned by `create`
        management_id: String,
    },
    /// Delete a secret you created
    Delete {
        /// Management id returned by `create`
        management_id: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; a malformed one is not.
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(e) if e.not_found() => {}
        Err(e) => return Err(e).context("load .env file"),
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SHAREASECRET_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/');

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Create {
            cipher_text,
            ttl,
            max_views,
        } => cmd_create(server, &cipher_text, &ttl, &max_views).await,
        Commands::Open { access_id } => cmd_open(server, &access_id).await,
        Commands::Manage { management_id } => cmd_manage(server, &management_id).await,
        Commands::Delete { management_id } => cmd_delete(server, &management_id).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = shareasecret_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    shareasecret_server::run(cfg).await
}

async fn cmd_create(server: &str, cipher_text: &str, ttl: &str, max_views: &str) -> Result<()> {
    let resp = Client::new()
        .post(format!("{server}/secrets"))
        .form(&[
            ("encryptedSecret", cipher_text),
            ("ttl", ttl),
            ("maxViews", max_views),
        ])
        .send()
        .await
        .context("HTTP request failed")?;

    let json = expect_success(resp).await?;
    println!("management id: {}", str_field(&json, "management_id")?);
    println!("manage at:     {}", str_field(&json, "manage_url")?);
    Ok(())
}

async fn cmd_open(server: &str, access_id: &str) -> Result<()> {
    let client = Client::new();

    let resp = client
        .post(format!("{server}/secrets/{access_id}/views"))
        .send()
        .await
        .context("HTTP request failed")?;
    let issued = expect_success(resp).await?;
    let viewing_key = str_field(&issued, "viewing_key")?;

    let resp = client
        .post(format!("{server}/secrets/{access_id}/views/{viewing_key}"))
        .send()
        .await
        .context("HTTP request failed")?;
    let view = expect_success(resp).await?;

    println!("{}", str_field(&view, "cipher_text")?);
    if view["maximum_views_reached"].as_bool().unwrap_or(false) {
        eprintln!("that was the last view; the secret is now deleted");
    }
    Ok(())
}

async fn cmd_manage(server: &str, management_id: &str) -> Result<()> {
    let resp = Client::new()
        .get(format!("{server}/manage-secret/{management_id}"))
        .send()
        .await
        .context("HTTP request failed")?;

    let json = expect_success(resp).await?;
    println!("{}", str_field(&json, "share_url")?);
    Ok(())
}

async fn cmd_delete(server: &str, management_id: &str) -> Result<()> {
    let resp = Client::new()
        .delete(format!("{server}/manage-secret/{management_id}"))
        .send()
        .await
        .context("HTTP request failed")?;

    expect_success(resp).await?;
    println!("✓ deleted");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn expect_success(resp: Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {error}");
    }
    Ok(json)
}

fn str_field<'a>(json: &'a Value, field: &str) -> Result<&'a str> {
    json[field]
        .as_str()
        .with_context(|| format!("server response is missing `{field}`"))
}
