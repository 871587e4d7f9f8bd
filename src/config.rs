use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{CredentialRecord, ResultCodes};
use crate::http_client::{ClientOptions, DEFAULT_TIMEOUT_MS};
use crate::store::{TokenTtl, DEFAULT_ACCESS_TTL_MINUTES, DEFAULT_REFRESH_TTL_MINUTES};

/// Longest accepted token lifetime (ten years)
const MAX_TTL_MINUTES: u64 = 10 * 365 * 24 * 60;

/// Session Client - authenticated REST client with shared token refresh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend domain (host[:port]) serving the REST API under /api/
    #[arg(short = 'D', long, env = "API_DOMAIN")]
    pub domain: Option<String>,

    /// Use https to reach the backend
    #[arg(long, env = "API_HTTPS")]
    pub https: bool,

    /// Request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Path to the session database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Store a credential pair issued by the login page
    Login {
        #[arg(long)]
        access_token: Option<String>,
        #[arg(long)]
        refresh_token: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Clear the stored session
    Logout,
    /// Show which credentials are cached
    Status,
    /// Exchange the refresh token for a new access token now
    Refresh,
    /// Send an authenticated request and print the response
    Request {
        /// HTTP method
        method: String,
        /// Path relative to the API root, e.g. v1/user/getUserInfo
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_domain: String,
    pub api_https: bool,
    pub request_timeout_ms: u64,

    // Session storage
    pub session_db_file: PathBuf,
    pub access_ttl_minutes: u64,
    pub refresh_ttl_minutes: u64,

    // Result codes
    pub codes: ResultCodes,

    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    /// Build configuration from parsed arguments and the environment
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let defaults = ResultCodes::default();

        let config = Config {
            api_domain: args
                .domain
                .clone()
                .or_else(|| std::env::var("API_DOMAIN").ok())
                .context("API_DOMAIN is required (use -D or set API_DOMAIN env var)")?,

            api_https: args.https,

            request_timeout_ms: args.timeout_ms,

            session_db_file: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_db_path),

            access_ttl_minutes: env_or("ACCESS_TOKEN_TTL_MINUTES", DEFAULT_ACCESS_TTL_MINUTES),

            refresh_ttl_minutes: env_or("REFRESH_TOKEN_TTL_MINUTES", DEFAULT_REFRESH_TTL_MINUTES),

            codes: ResultCodes {
                ok: env_or("STATUS_OK", defaults.ok),
                token_expired: env_or("STATUS_TOKEN_EXPIRED", defaults.token_expired),
                login_again: env_or("STATUS_LOGIN_AGAIN", defaults.login_again),
            },

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_domain.trim().is_empty() {
            anyhow::bail!("API_DOMAIN must not be empty");
        }

        self.base_url()?;

        if self.access_ttl_minutes == 0 || self.refresh_ttl_minutes == 0 {
            anyhow::bail!("Token TTLs must be greater than zero");
        }

        if self.access_ttl_minutes > MAX_TTL_MINUTES || self.refresh_ttl_minutes > MAX_TTL_MINUTES {
            anyhow::bail!("Token TTLs must not exceed {} minutes", MAX_TTL_MINUTES);
        }

        if self.access_ttl_minutes >= self.refresh_ttl_minutes {
            tracing::warn!(
                "Access token TTL ({} min) is not shorter than refresh token TTL ({} min)",
                self.access_ttl_minutes,
                self.refresh_ttl_minutes
            );
        }

        let codes = self.codes;
        if codes.ok == codes.token_expired
            || codes.ok == codes.login_again
            || codes.token_expired == codes.login_again
        {
            anyhow::bail!("Result codes must be distinct: {:?}", codes);
        }

        Ok(())
    }

    /// API root, e.g. `https://example.com/api/`
    pub fn base_url(&self) -> Result<Url> {
        let scheme = if self.api_https { "https" } else { "http" };
        let domain = self.api_domain.trim().trim_end_matches('/');
        let raw = format!("{}://{}/api/", scheme, domain);
        Url::parse(&raw).with_context(|| format!("Invalid API base URL: {}", raw))
    }

    pub fn client_options(&self) -> Result<ClientOptions> {
        Ok(ClientOptions {
            base_url: self.base_url()?,
            timeout: Duration::from_millis(self.request_timeout_ms),
            codes: self.codes,
        })
    }

    pub fn token_ttl(&self) -> TokenTtl {
        TokenTtl {
            access_minutes: self.access_ttl_minutes,
            refresh_minutes: self.refresh_ttl_minutes,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("session-client").join("session.sqlite3"))
        .unwrap_or_else(|| PathBuf::from(".session.sqlite3"))
}

// === Interactive Login ===

/// Fill in credentials missing from the command line by prompting for them
pub fn prompt_credentials(
    access_token: Option<String>,
    refresh_token: Option<String>,
    user_id: Option<String>,
) -> Result<CredentialRecord> {
    let access_token = match access_token {
        Some(token) => token,
        None => Password::new()
            .with_prompt("Access token")
            .interact()
            .context("Failed to read access token")?,
    };

    let refresh_token = match refresh_token {
        Some(token) => token,
        None => Password::new()
            .with_prompt("Refresh token")
            .interact()
            .context("Failed to read refresh token")?,
    };

    if access_token.is_empty() || refresh_token.is_empty() {
        anyhow::bail!("Access token and refresh token cannot be empty");
    }

    let user_id = match user_id {
        Some(id) => Some(id),
        None => {
            let id: String = Input::new()
                .with_prompt("User id (optional)")
                .allow_empty(true)
                .interact_text()
                .context("Failed to read user id")?;
            Some(id).filter(|id| !id.is_empty())
        }
    };

    Ok(CredentialRecord {
        access_token,
        refresh_token,
        user_id,
    })
}
