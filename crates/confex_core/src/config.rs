use std::env;
use std::path::PathBuf;

pub const DEFAULT_USER_AGENT: &str = "confex/0.1";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Connection settings for the content service.
///
/// Credentials come from the caller; HTTP tuning knobs resolve env-first
/// with conservative defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub username: String,
    pub token: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl ClientConfig {
    pub fn new(base_url: &str, username: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            token: token.to_string(),
            user_agent: env_value("CONFEX_USER_AGENT", DEFAULT_USER_AGENT),
            timeout_ms: env_value_u64("CONFEX_HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            max_retries: env_value_usize("CONFEX_HTTP_RETRIES", DEFAULT_RETRIES),
            retry_delay_ms: env_value_u64("CONFEX_HTTP_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// What the export pass writes and whether attachments come along.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub out_dir: PathBuf,
    pub skip_attachments: bool,
}

fn env_value(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::ClientConfig;

    #[test]
    fn trailing_slash_is_trimmed_from_base_url() {
        let config = ClientConfig::new("https://example.atlassian.net/wiki/", "user", "token");
        assert_eq!(config.base_url, "https://example.atlassian.net/wiki");
    }

    #[test]
    fn tuning_defaults_are_conservative() {
        let config = ClientConfig::new("https://example.atlassian.net/wiki", "user", "token");
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_delay_ms, 500);
    }
}
