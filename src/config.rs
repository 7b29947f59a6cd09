use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub apns: ApnsConfig,

    #[command(flatten)]
    pub dispatcher: DispatcherConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Args)]
pub struct ApnsConfig {
    /// App bundle identifier, used as the notification topic
    #[arg(long = "apns-bundle-id", env = "APNS_BUNDLE_ID")]
    pub bundle_id: String,

    /// Apple developer team identifier
    #[arg(long = "apns-team-id", env = "APNS_TEAM_ID")]
    pub team_id: String,

    /// Identifier of the APNs signing key
    #[arg(long = "apns-key-id", env = "APNS_KEY_ID")]
    pub key_id: String,

    /// PKCS#8 PEM contents of the APNs signing key
    #[arg(long = "apns-signing-key", env = "APNS_SIGNING_KEY", hide_env_values = true)]
    pub signing_key: Option<String>,

    /// Path to the APNs signing key (.p8), used when the key is not given inline
    #[arg(long = "apns-signing-key-path", env = "APNS_SIGNING_KEY_PATH")]
    pub signing_key_path: Option<PathBuf>,

    /// Send to the APNs development gateway instead of production
    #[arg(long = "apns-sandbox", env = "APNS_SANDBOX", default_value_t = false)]
    pub sandbox: bool,

    /// Timeout for a single request to APNs
    #[arg(long = "apns-request-timeout-secs", env = "APNS_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,
}

impl ApnsConfig {
    pub const PRODUCTION_HOST: &'static str = "api.push.apple.com";
    pub const SANDBOX_HOST: &'static str = "api.sandbox.push.apple.com";

    pub const fn host(&self) -> &'static str {
        if self.sandbox { Self::SANDBOX_HOST } else { Self::PRODUCTION_HOST }
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the signing key PEM, reading it from disk when only a path is configured.
    ///
    /// # Errors
    /// Returns an error if neither source is set or the key file cannot be read.
    pub fn signing_key_pem(&self) -> anyhow::Result<Vec<u8>> {
        if let Some(pem) = &self.signing_key {
            return Ok(pem.as_bytes().to_vec());
        }
        let path = self
            .signing_key_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("APNs signing key not configured"))?;
        std::fs::read(path).map_err(|e| anyhow::anyhow!("Failed to read APNs signing key at {}: {e}", path.display()))
    }
}

#[derive(Clone, Debug, Args)]
pub struct DispatcherConfig {
    /// Maximum number of push submissions in flight at once
    #[arg(long, env = "APNS_WORKER_CONCURRENCY", default_value_t = 64)]
    pub worker_concurrency: usize,

    /// How long stop waits for in-flight pushes before closing the connection
    #[arg(long, env = "APNS_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { worker_concurrency: 64, shutdown_timeout_secs: 10 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, Args)]
pub struct TelemetryConfig {
    /// Log output format
    #[arg(long, env = "APNS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// OTLP collector endpoint; traces, metrics and logs are exported when set
    #[arg(long, env = "APNS_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 7] =
        ["apns-dispatcher", "--apns-bundle-id", "org.example.app", "--apns-team-id", "TEAM123456", "--apns-key-id", "KEY1234567"];

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(REQUIRED).unwrap();

        assert_eq!(config.apns.bundle_id, "org.example.app");
        assert!(!config.apns.sandbox);
        assert_eq!(config.apns.host(), "api.push.apple.com");
        assert_eq!(config.apns.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.dispatcher.worker_concurrency, 64);
        assert_eq!(config.dispatcher.shutdown_timeout_secs, 10);
        assert_eq!(config.telemetry.log_format, LogFormat::Text);
        assert!(config.telemetry.otlp_endpoint.is_none());
    }

    #[test]
    fn test_sandbox_and_json_logs() {
        let args = REQUIRED.into_iter().chain(["--apns-sandbox", "--log-format", "json", "--worker-concurrency", "8"]);
        let config = Config::try_parse_from(args).unwrap();

        assert_eq!(config.apns.host(), "api.sandbox.push.apple.com");
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
        assert_eq!(config.dispatcher.worker_concurrency, 8);
    }

    #[test]
    fn test_missing_signing_key() {
        let config = Config::try_parse_from(REQUIRED).unwrap();
        assert!(config.apns.signing_key_pem().is_err());
    }

    #[test]
    fn test_inline_signing_key_wins() {
        let args = REQUIRED.into_iter().chain(["--apns-signing-key", "pem", "--apns-signing-key-path", "/nonexistent"]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.apns.signing_key_pem().unwrap(), b"pem");
    }
}
