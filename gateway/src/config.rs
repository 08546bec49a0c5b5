//! Configuration for the gateway process.
//!
//! Compile-time constants live at the top; everything operator-tunable comes
//! in through [`Args`] (flags or environment variables) and is folded into
//! the runtime [`Config`] handed to every subsystem.

use clap::Parser;

// ============================================================================
// Constants
// ============================================================================

/// Upstream chunk size for `upload.getFile` (1 MiB).
///
/// The RPC requires a power of two no larger than this, with the offset
/// aligned to it. Every fetch the reader issues uses exactly this size.
pub const CHUNK_SIZE: i64 = 1024 * 1024;

/// How long the pool keeps handing out the same worker before rescanning
/// for the least-loaded one. Stickiness over seconds keeps the upstream
/// session caches of the hot worker warm.
pub const REBALANCE_WINDOW_SECS: u64 = 30;

/// Attempts per chunk before a transient upstream failure is surfaced.
pub const FETCH_MAX_ATTEMPTS: u32 = 3;

/// Base delay for chunk retry backoff (doubles per attempt).
pub const FETCH_RETRY_BASE_DELAY_MS: u64 = 250;

/// Drain window for in-flight responses on shutdown.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Deadline for credit ledger calls.
pub const CREDIT_CALL_TIMEOUT_SECS: u64 = 5;

/// `Cache-Control: max-age` for the landing and player pages.
pub const PAGE_CACHE_MAX_AGE_SECS: u64 = 1200;

/// Name of the signed access-grant cookie.
pub const AUTH_COOKIE: &str = "fsb_auth";

/// `ENVIRONMENT` value that switches on plain-http links and debug logs.
pub const ENVIRONMENT_LOCAL: &str = "local";

// ============================================================================
// Runtime configuration
// ============================================================================

/// Command-line / environment options.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    pub http_port: u16,

    /// Absolute URL host used in generated links (e.g. "https://files.example.com")
    #[arg(long, env = "FQDN")]
    pub fqdn: String,

    /// "local" enables debug logging and http:// links; anything else means https
    #[arg(long, env = "ENVIRONMENT", default_value = "production")]
    pub environment: String,

    /// Display name used on rendered pages
    #[arg(long, env = "APP_NAME", default_value = "Stream Gateway")]
    pub app_name: String,

    /// Channel that stores the uploaded files; also the fallback for short paths
    #[arg(long, env = "DB_CHANNEL_ID")]
    pub db_channel_id: i64,

    /// Public channel advertised on the landing page
    #[arg(long, env = "MAIN_CHANNEL_USERNAME")]
    pub main_channel_username: String,

    /// Numeric id of the public channel (0 disables invite-link resolution)
    #[arg(long, env = "MAIN_CHANNEL_ID", default_value = "0")]
    pub main_channel_id: i64,

    /// Admin user notified when workers come up
    #[arg(long, env = "ADMIN_ID", default_value = "0")]
    pub admin_id: i64,

    /// MTProto application id
    #[arg(long, env = "APP_KEY")]
    pub api_id: i32,

    /// MTProto application hash
    #[arg(long, env = "APP_HASH", hide_env_values = true)]
    pub api_hash: String,

    /// Whitespace-separated bot tokens; one worker per token
    #[arg(long, env = "BOT_TOKENS", hide_env_values = true)]
    pub bot_tokens: String,

    /// HMAC secret for the access-grant cookie
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Cookie lifetime in seconds
    #[arg(long, env = "JWT_EXPIRATION", default_value = "86400")]
    pub jwt_expiration: u64,

    /// Ephemeral grant lifetime in seconds
    #[arg(long, env = "UUID_EXPIRATION", default_value = "600")]
    pub uuid_expiration: u64,

    /// URL-shortener endpoint; empty disables the interactive gate
    #[arg(long, env = "SHORTNER_URL", default_value = "")]
    pub shortner_url: String,

    /// Bearer token for the URL shortener
    #[arg(long, env = "SHORTNER_API", default_value = "", hide_env_values = true)]
    pub shortner_api: String,

    /// Redis connection string
    #[arg(long, env = "REDIS_DBSTRING")]
    pub redis_url: String,

    /// Enable the referral credit policy on the bot side
    #[arg(long, env = "REF")]
    pub ref_enabled: bool,

    /// Minimum credits a user needs before the bot accepts a file
    #[arg(long, env = "MIN_CREDITS_REQUIRED", default_value = "1")]
    pub min_credits_required: i64,

    /// Credits granted to a first-time user
    #[arg(long, env = "INITIAL_CREDITS", default_value = "10")]
    pub initial_credits: i64,

    /// Credits granted per referral / daily top-up
    #[arg(long, env = "INCREMENT_CREDITS", default_value = "5")]
    pub increment_credits: i64,

    /// Credits debited per generated link
    #[arg(long, env = "DECREMENT_CREDITS", default_value = "1")]
    pub decrement_credits: i64,

    /// Ceiling a user's balance never exceeds
    #[arg(long, env = "MAX_CREDITS", default_value = "50")]
    pub max_credits: i64,
}

/// Resolved process configuration shared across subsystems.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub http_port: u16,
    pub fqdn: String,
    pub environment: String,
    pub scheme: &'static str,
    pub db_channel_id: i64,
    pub main_channel_id: i64,
    pub main_channel_username: String,
    pub admin_id: i64,
    pub api_id: i32,
    pub api_hash: String,
    pub bot_tokens: Vec<String>,
    pub jwt_secret: String,
    pub jwt_expiration: u64,
    pub uuid_expiration: u64,
    pub shortner_url: String,
    pub shortner_api: String,
    pub redis_url: String,
    pub ref_enabled: bool,
    pub min_credits_required: i64,
    pub initial_credits: i64,
    pub increment_credits: i64,
    pub decrement_credits: i64,
    pub max_credits: i64,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let scheme = if args.environment == ENVIRONMENT_LOCAL {
            "http"
        } else {
            "https"
        };
        let bot_tokens = args
            .bot_tokens
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Self {
            app_name: args.app_name,
            http_port: args.http_port,
            fqdn: args.fqdn.trim_end_matches('/').to_string(),
            environment: args.environment,
            scheme,
            db_channel_id: args.db_channel_id,
            main_channel_id: args.main_channel_id,
            main_channel_username: args.main_channel_username,
            admin_id: args.admin_id,
            api_id: args.api_id,
            api_hash: args.api_hash,
            bot_tokens,
            jwt_secret: args.jwt_secret,
            jwt_expiration: args.jwt_expiration,
            uuid_expiration: args.uuid_expiration,
            shortner_url: args.shortner_url,
            shortner_api: args.shortner_api,
            redis_url: args.redis_url,
            ref_enabled: args.ref_enabled,
            min_credits_required: args.min_credits_required,
            initial_credits: args.initial_credits,
            increment_credits: args.increment_credits,
            decrement_credits: args.decrement_credits,
            max_credits: args.max_credits,
        }
    }

    pub fn is_local(&self) -> bool {
        self.environment == ENVIRONMENT_LOCAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            http_port: 8080,
            fqdn: "https://files.example.com/".to_string(),
            environment: "production".to_string(),
            app_name: "Stream Gateway".to_string(),
            db_channel_id: 1234567890,
            main_channel_username: "example".to_string(),
            main_channel_id: 0,
            admin_id: 0,
            api_id: 1,
            api_hash: "hash".to_string(),
            bot_tokens: " 111:aaa  222:bbb ".to_string(),
            jwt_secret: "secret".to_string(),
            jwt_expiration: 86400,
            uuid_expiration: 600,
            shortner_url: String::new(),
            shortner_api: String::new(),
            redis_url: "redis://localhost".to_string(),
            ref_enabled: false,
            min_credits_required: 1,
            initial_credits: 10,
            increment_credits: 5,
            decrement_credits: 1,
            max_credits: 50,
        }
    }

    #[test]
    fn test_token_splitting_ignores_extra_whitespace() {
        let cfg = Config::from_args(base_args());
        assert_eq!(cfg.bot_tokens, vec!["111:aaa", "222:bbb"]);
    }

    #[test]
    fn test_scheme_follows_environment() {
        let cfg = Config::from_args(base_args());
        assert_eq!(cfg.scheme, "https");

        let mut args = base_args();
        args.environment = ENVIRONMENT_LOCAL.to_string();
        let cfg = Config::from_args(args);
        assert_eq!(cfg.scheme, "http");
        assert!(cfg.is_local());
    }

    #[test]
    fn test_fqdn_trailing_slash_is_stripped() {
        let cfg = Config::from_args(base_args());
        assert_eq!(cfg.fqdn, "https://files.example.com");
    }
}
