//! Client configuration.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::transport::normalize_base;

pub const DEFAULT_BASE_URL: &str = "https://brjobsedu.com/girls_course/girls_course_backend/";

/// Connection and persistence settings, shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct PortalConfig {
    /// Backend base URL; endpoint paths are joined beneath it
    #[arg(long, env = "PORTAL_BASE_URL", default_value = DEFAULT_BASE_URL, value_parser = parse_base_url)]
    pub base_url: Url,

    /// File the session tokens are persisted to between runs
    #[arg(long, env = "PORTAL_SESSION_FILE", default_value = ".course-portal-session.json")]
    pub session_file: PathBuf,

    /// Request timeout in seconds
    #[arg(long = "timeout-secs", env = "PORTAL_TIMEOUT_SECS", default_value = "30", value_parser = parse_timeout)]
    pub timeout: Duration,
}

fn parse_base_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid base URL {}: {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(normalize_base(url)),
        other => Err(format!("unsupported scheme: {}", other)),
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let secs: u64 = raw
        .parse()
        .map_err(|e| format!("invalid timeout {}: {}", raw, e))?;
    if secs == 0 {
        return Err("timeout must be at least 1 second".to_string());
    }
    Ok(Duration::from_secs(secs))
}
