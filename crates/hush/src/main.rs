use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "hush", about = "hush — share end-to-end encrypted secrets by link", version)]
struct Cli {
    /// hush server URL (default: http://localhost:5000 or $HUSH_SERVER)
    #[arg(long, env = "HUSH_SERVER", default_value = "http://localhost:5000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hush HTTP server
    Serve {
        /// Port to listen on (default: $HUSH_PORT or 5000)
        #[arg(long, env = "HUSH_PORT", default_value = "5000")]
        port: u16,
        /// Host to bind (default: $HUSH_HOST or 0.0.0.0)
        #[arg(long, env = "HUSH_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Run the email notification consumer in-process ($HUSH_MAILER)
        #[arg(long, env = "HUSH_MAILER")]
        with_mailer: bool,
    },
    /// Store an already-encrypted secret and print its links
    Create {
        /// Ciphertext of the secret (encrypt before calling; the server
        /// never sees plaintext)
        ciphertext: String,
        /// Views allowed before access is refused (0 = unlimited)
        #[arg(long)]
        max_views: Option<u32>,
        /// Password required on retrieval
        #[arg(long)]
        password: Option<String>,
        /// Expiration as RFC 3339, e.g. 2026-09-01T12:00:00Z
        #[arg(long)]
        expires: Option<String>,
        /// Restrict retrieval to this IP (repeatable)
        #[arg(long = "ip")]
        ips: Vec<String>,
        /// Email address notified on every granted access
        #[arg(long)]
        notify: Option<String>,
    },
    /// Retrieve a secret by its share identifier
    Get {
        identifier: String,
        /// Password, if the secret requires one
        #[arg(long)]
        password: Option<String>,
    },
    /// Delete a secret using its creator identifier
    Delete {
        creator_identifier: String,
    },
    /// Show the access log for a secret
    Logs {
        creator_identifier: String,
    },
    /// Show aggregate access stats for a secret
    Stats {
        creator_identifier: String,
    },
    /// Show the server's creation defaults
    Defaults,
    /// Print the shareable URL for a secret
    Share {
        identifier: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HUSH_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            with_mailer,
        } => cmd_serve(host, port, with_mailer).await,

        Commands::Create {
            ciphertext,
            max_views,
            password,
            expires,
            ips,
            notify,
        } => {
            cmd_create(
                &cli.server,
                &ciphertext,
                max_views,
                password.as_deref(),
                expires.as_deref(),
                &ips,
                notify.as_deref(),
            )
            .await
        }

        Commands::Get {
            identifier,
            password,
        } => cmd_get(&cli.server, &identifier, password.as_deref()).await,

        Commands::Delete { creator_identifier } => {
            cmd_delete(&cli.server, &creator_identifier).await
        }

        Commands::Logs { creator_identifier } => cmd_logs(&cli.server, &creator_identifier).await,

        Commands::Stats { creator_identifier } => cmd_stats(&cli.server, &creator_identifier).await,

        Commands::Defaults => cmd_defaults(&cli.server).await,

        Commands::Share { identifier } => {
            println!("{}", share_url(&cli.server, &identifier));
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16, with_mailer: bool) -> Result<()> {
    let cfg = hush_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };

    let store = hush_server::open_store(cfg.data_dir.as_ref())?;

    if with_mailer {
        let mailer_cfg = hush_mailer::MailerConfig::from_env()?;
        let smtp_cfg = hush_mailer::SmtpConfig::from_env()?;
        let workers: usize = std::env::var("HUSH_MAILER_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        for n in 0..workers {
            let smtp = hush_mailer::SmtpMailer::new(smtp_cfg.clone())?;
            let consumer =
                hush_mailer::MailConsumer::new(store.clone(), smtp, mailer_cfg.clone());
            if n == 0 {
                consumer.quota().spawn_reset();
            }
            tokio::spawn(async move {
                if let Err(e) = consumer.run().await {
                    tracing::error!(worker = n, error = %e, "mail consumer exited");
                }
            });
        }
    }

    hush_server::run_with_store(cfg, store).await
}

#[allow(clippy::too_many_arguments)]
async fn cmd_create(
    server: &str,
    ciphertext: &str,
    max_views: Option<u32>,
    password: Option<&str>,
    expires: Option<&str>,
    ips: &[String],
    notify: Option<&str>,
) -> Result<()> {
    let expiration_date = expires
        .map(|s| {
            s.parse::<DateTime<Utc>>()
                .with_context(|| format!("invalid expiration date: {s}"))
        })
        .transpose()?;

    let body = serde_json::json!({
        "encryptedSecret": ciphertext,
        "maxViews": max_views,
        "secretPassword": password,
        "expirationDate": expiration_date,
        "ipRestrictions": ips,
        "emailNotification": notify,
    });

    let resp = Client::new()
        .post(format!("{}/api/secrets/", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!("{}", json["error"].as_str().unwrap_or("unknown error"));
    }

    let identifier = json["data"]["identifier"].as_str().unwrap_or("");
    let creator = json["data"]["creatorIdentifier"].as_str().unwrap_or("");
    println!("share:   {}", share_url(server, identifier));
    println!("manage:  {creator}  (keep this private)");
    Ok(())
}

async fn cmd_get(server: &str, identifier: &str, password: Option<&str>) -> Result<()> {
    let mut req = Client::new().get(format!(
        "{}/api/secrets/{}",
        server.trim_end_matches('/'),
        identifier
    ));
    if let Some(pw) = password {
        req = req.query(&[("secretPassword", pw)]);
    }

    let resp = req.send().await.context("HTTP request failed")?;
    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;

    if status.is_success() {
        println!("{}", json["data"]["secret"].as_str().unwrap_or(""));
    } else {
        anyhow::bail!("{}", json["error"].as_str().unwrap_or("unknown error"));
    }
    Ok(())
}

async fn cmd_delete(server: &str, creator_identifier: &str) -> Result<()> {
    let resp = Client::new()
        .delete(format!(
            "{}/api/secrets/{}",
            server.trim_end_matches('/'),
            creator_identifier
        ))
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status().is_success() {
        println!("✓ deleted");
    } else {
        let status = resp.status();
        let json: Value = resp.json().await.unwrap_or_default();
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_logs(server: &str, creator_identifier: &str) -> Result<()> {
    let json = fetch_data(
        server,
        &format!("/api/secrets/logs/{creator_identifier}"),
    )
    .await?;

    let logs = json["logs"].as_array().cloned().unwrap_or_default();
    if logs.is_empty() {
        println!("(no accesses yet)");
        return Ok(());
    }
    for entry in &logs {
        let when = entry["accessDate"]
            .as_i64()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "?".into());
        let verdict = if entry["accessGranted"].as_bool().unwrap_or(false) {
            "granted"
        } else {
            "denied"
        };
        println!(
            "  {when} — {} — {verdict}",
            entry["ipAddress"].as_str().unwrap_or("?")
        );
    }
    Ok(())
}

async fn cmd_stats(server: &str, creator_identifier: &str) -> Result<()> {
    let json = fetch_data(
        server,
        &format!("/api/secrets/stats/{creator_identifier}"),
    )
    .await?;

    println!("attempts: {}", json["totalAttempts"].as_u64().unwrap_or(0));
    println!("granted:  {}", json["grantedAttempts"].as_u64().unwrap_or(0));
    println!("views:    {}", json["currentViews"].as_u64().unwrap_or(0));
    println!("ips:      {}", json["distinctIps"].as_u64().unwrap_or(0));
    Ok(())
}

async fn cmd_defaults(server: &str) -> Result<()> {
    let json = fetch_data(server, "/api/secrets/defaults").await?;
    println!("maxViews:                {}", json["maxViews"].as_u64().unwrap_or(0));
    println!(
        "defaultExpirationLength: {}s",
        json["defaultExpirationLength"].as_i64().unwrap_or(0)
    );
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn share_url(server: &str, identifier: &str) -> String {
    format!("{}/api/secrets/{}", server.trim_end_matches('/'), identifier)
}

/// GET a path and unwrap the `data` field of the response envelope.
async fn fetch_data(server: &str, path: &str) -> Result<Value> {
    let resp = Client::new()
        .get(format!("{}{path}", server.trim_end_matches('/')))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!("{}", json["error"].as_str().unwrap_or("unknown error"));
    }
    Ok(json["data"].clone())
}
