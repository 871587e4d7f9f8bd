use anyhow::{Context, Result};
use reqwest::Method;
use std::sync::Arc;

use session_client::config::{self, Command, Config};
use session_client::store::{
    CredentialStore, Lookup, SqliteStorage, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
use session_client::{LoginRedirect, SessionClient};

/// Tells the terminal user to log in again
struct ConsoleRedirect;

impl LoginRedirect for ConsoleRedirect {
    fn redirect_to_login(&self) {
        eprintln!("Session expired. Run `session-client login` to sign in again.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;
    tracing::debug!("Backend: {}", config.base_url()?);

    let storage = SqliteStorage::open(&config.session_db_file).with_context(|| {
        format!(
            "Failed to open session database: {}",
            config.session_db_file.display()
        )
    })?;
    let store = CredentialStore::new(Arc::new(storage)).with_ttl(config.token_ttl());

    let client = SessionClient::new(config.client_options()?, store)
        .context("Failed to create HTTP client")?
        .with_redirect(Arc::new(ConsoleRedirect));

    match command {
        Command::Login {
            access_token,
            refresh_token,
            user_id,
        } => {
            let record = config::prompt_credentials(access_token, refresh_token, user_id)?;
            client.login(&record);
            println!("✅ Session stored in {}", config.session_db_file.display());
        }
        Command::Logout => {
            client.logout();
            println!("👋 Logged out");
        }
        Command::Status => print_status(client.store()),
        Command::Refresh => {
            let token = client.refresh().await.context("Token refresh failed")?;
            println!("✅ Access token refreshed ({}...)", token_preview(&token));
        }
        Command::Request { method, path, data } => {
            let method: Method = method
                .to_uppercase()
                .parse()
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut builder = client.request(method, &path)?;
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                builder = builder.json(&body);
            }

            let response = client.execute(builder.build()?).await?;
            let body = match response.json::<serde_json::Value>() {
                Ok(json) => serde_json::to_string_pretty(&json).unwrap_or_default(),
                Err(_) => response.text(),
            };

            println!("HTTP {}", response.status());
            println!("{}", body);
        }
    }

    Ok(())
}

/// Print which credentials are cached and when they expire
fn print_status(store: &CredentialStore) {
    for (label, key) in [
        ("Access token", ACCESS_TOKEN_KEY),
        ("Refresh token", REFRESH_TOKEN_KEY),
    ] {
        match store.expiry_of(key) {
            Lookup::Hit(Some(expires)) => {
                println!("  {:<14} valid until {}", label, expires.to_rfc3339())
            }
            Lookup::Hit(None) => println!("  {:<14} valid (no expiry)", label),
            Lookup::Miss => println!("  {:<14} missing", label),
            Lookup::Unavailable => println!("  {:<14} storage unavailable", label),
        }
    }

    match store.user_id() {
        Lookup::Hit(id) => println!("  {:<14} {}", "User id", id),
        _ => println!("  {:<14} -", "User id"),
    }
}

/// Leading characters of a token, safe for any UTF-8 input
fn token_preview(token: &str) -> String {
    token.chars().take(12).collect()
}
