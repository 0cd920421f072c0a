use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use ticketbridge_core::{CredentialConfig, Sensitive, UserCacheConfig};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "ticketbridge-gateway",
    version,
    about = "MCP gateway in front of the NSP ticketing API"
)]
pub struct Args {
    /// Listen address for the MCP endpoint and management API.
    #[arg(long, env = "TICKETBRIDGE_HTTP_ADDR", default_value = "127.0.0.1:5000")]
    pub http_addr: SocketAddr,

    /// HTTP path for the MCP endpoint.
    #[arg(long, env = "TICKETBRIDGE_MCP_HTTP_PATH", default_value = "/mcp")]
    pub http_path: String,

    /// Seconds an MCP session may stay unused before its binding is dropped.
    #[arg(
        long,
        env = "TICKETBRIDGE_MCP_SESSION_IDLE_SECS",
        default_value_t = 3600,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub mcp_session_idle_secs: u64,

    /// Maximum number of live MCP sessions.
    #[arg(
        long,
        env = "TICKETBRIDGE_MCP_MAX_SESSIONS",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub mcp_max_sessions: u64,

    /// Also serve MCP over stdin/stdout.
    #[arg(long, env = "TICKETBRIDGE_MCP_STDIO", default_value_t = false)]
    pub stdio: bool,

    /// NSP Public API base URL.
    #[arg(
        long,
        env = "NSP_BASE_URL",
        default_value = "http://localhost:1900/api/PublicApi/"
    )]
    pub nsp_base_url: String,

    #[arg(long, env = "NSP_USERNAME")]
    pub nsp_username: String,

    #[arg(long, env = "NSP_PASSWORD", hide_env_values = true)]
    pub nsp_password: String,

    /// Per-request timeout for backend calls.
    #[arg(long, env = "NSP_TIMEOUT_SECS", default_value_t = 30)]
    pub nsp_timeout_secs: u64,

    /// Authenticate at startup and keep the token warm.
    #[arg(
        long,
        env = "PREWARMING_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub prewarming_enabled: bool,

    /// Minutes before expiry at which the token is refreshed.
    #[arg(long, env = "PREWARMING_REFRESH_BUFFER", default_value_t = 5)]
    pub prewarming_refresh_buffer_minutes: u64,

    /// Minutes to wait after a failed refresh.
    #[arg(
        long,
        env = "PREWARMING_RETRY_MINUTES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub prewarming_retry_minutes: u64,

    #[arg(long, env = "USER_CACHE_TTL_SECS", default_value_t = 3600)]
    pub user_cache_ttl_secs: u64,

    #[arg(
        long,
        env = "USER_CACHE_MAX_SIZE",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub user_cache_max_size: u64,

    /// Comma-separated emails loaded into the user cache after startup.
    #[arg(long, env = "CACHE_WARM_EMAILS", value_delimiter = ',')]
    pub warm_emails: Vec<String>,
}

/// Backend connection settings.
#[derive(Debug, Clone)]
pub struct NspConfig {
    pub base_url: Url,
    pub username: String,
    pub password: Sensitive<String>,
    pub timeout: Duration,
}

impl NspConfig {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            username: username.to_string(),
            password: Sensitive(password.to_string()),
            timeout,
        })
    }
}

/// Endpoint names are joined relative to the base, so it must end in `/`.
pub fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("parse NSP base url {raw:?}"))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn minutes(what: &str, n: u64) -> anyhow::Result<Duration> {
    n.checked_mul(60)
        .map(Duration::from_secs)
        .with_context(|| format!("{what} of {n} minutes is too large"))
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_addr: SocketAddr,
    pub http_path: String,
    pub session_idle_ttl: Duration,
    pub max_sessions: usize,
    pub stdio: bool,
    pub nsp: NspConfig,
    pub prewarming_enabled: bool,
    pub credentials: CredentialConfig,
    pub user_cache: UserCacheConfig,
    pub warm_emails: Vec<String>,
}

impl GatewayConfig {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let http_path = if args.http_path.starts_with('/') {
            args.http_path
        } else {
            format!("/{}", args.http_path)
        };
        let nsp = NspConfig::new(
            &args.nsp_base_url,
            &args.nsp_username,
            &args.nsp_password,
            Duration::from_secs(args.nsp_timeout_secs),
        )?;
        let warm_emails = args
            .warm_emails
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();

        Ok(Self {
            http_addr: args.http_addr,
            http_path,
            session_idle_ttl: Duration::from_secs(args.mcp_session_idle_secs),
            max_sessions: usize::try_from(args.mcp_max_sessions).unwrap_or(usize::MAX),
            stdio: args.stdio,
            nsp,
            prewarming_enabled: args.prewarming_enabled,
            credentials: CredentialConfig {
                refresh_buffer: minutes(
                    "prewarming refresh buffer",
                    args.prewarming_refresh_buffer_minutes,
                )?,
                retry_backoff: minutes("prewarming retry", args.prewarming_retry_minutes)?,
            },
            user_cache: UserCacheConfig {
                ttl: Duration::from_secs(args.user_cache_ttl_secs),
                max_size: usize::try_from(args.user_cache_max_size).unwrap_or(usize::MAX),
            },
            warm_emails,
        })
    }
}
