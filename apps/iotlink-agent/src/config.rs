use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use iotlink_core::{BrokerConfig, ConnectionConfig};
use iotlink_log::UploaderConfig;

use crate::telemetry::DEFAULT_LOG_FILTER;

#[derive(Debug, Parser)]
#[command(
    name = "iotlink-agent",
    author,
    version,
    about = "Keeps a device connected to its cloud IoT registry and uploads remote logs"
)]
pub struct Cli {
    /// Broker device id. Derived from the model and a persisted serial when unset.
    #[arg(long, env = "IOTLINK_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Hardware model reported in device state and used for derived ids.
    #[arg(long, env = "IOTLINK_DEVICE_MODEL", default_value = "generic")]
    pub model: String,

    /// PEM private key (RSA or P-256) used to sign session tokens.
    #[arg(long, env = "IOTLINK_PRIVATE_KEY")]
    pub private_key: PathBuf,

    /// PEM certificate for the private key, sent on registration.
    #[arg(long, env = "IOTLINK_CERTIFICATE")]
    pub certificate: PathBuf,

    /// JSON file holding the cached registration.
    #[arg(long, env = "IOTLINK_SETTINGS", default_value = "iotlink-settings.json")]
    pub settings: PathBuf,

    /// Base URL of the registration service.
    #[arg(long, env = "IOTLINK_REGISTRATION_URL")]
    pub registration_url: Option<String>,

    /// Value of the Authorization header sent to the registration service.
    #[arg(long, env = "IOTLINK_REGISTRATION_TOKEN", default_value = "")]
    pub registration_token: String,

    #[arg(long, env = "IOTLINK_BROKER_HOST", default_value = "mqtt.googleapis.com")]
    pub broker_host: String,

    #[arg(long, env = "IOTLINK_BROKER_PORT", default_value_t = 8883)]
    pub broker_port: u16,

    #[arg(long, env = "IOTLINK_REGION", default_value = "us-central1")]
    pub region: String,

    /// Failed connects tolerated before giving up; 0 retries forever.
    #[arg(long, env = "IOTLINK_MAX_RECONNECT_RETRIES", default_value_t = 0)]
    pub max_reconnect_retries: u32,

    #[arg(long, env = "IOTLINK_RECONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub reconnect_timeout_ms: u64,

    /// Seconds between device state publishes.
    #[arg(long, env = "IOTLINK_STATE_INTERVAL_SECS", default_value_t = 20)]
    pub state_interval_secs: u64,

    /// Telemetry subfolder for log batches; empty publishes to the events root.
    #[arg(long, env = "IOTLINK_LOG_SUBTOPIC", default_value = "")]
    pub log_subtopic: String,

    /// Tracing filter directive.
    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEndpoint {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: Option<String>,
    pub model: String,
    pub private_key: PathBuf,
    pub certificate: PathBuf,
    pub settings: PathBuf,
    pub registration: Option<RegistrationEndpoint>,
    pub connection: ConnectionConfig,
    pub uploader: UploaderConfig,
    pub state_interval: Duration,
}

impl TryFrom<Cli> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.state_interval_secs == 0 {
            bail!("state interval must be greater than zero");
        }
        if cli.reconnect_timeout_ms == 0 {
            bail!("reconnect timeout must be greater than zero");
        }
        let device_id = cli.device_id.filter(|id| !id.trim().is_empty());
        let registration = cli
            .registration_url
            .filter(|url| !url.is_empty())
            .map(|url| {
                reqwest::Url::parse(&url)
                    .with_context(|| format!("invalid registration url: {url}"))?;
                Ok::<_, anyhow::Error>(RegistrationEndpoint {
                    base_url: url,
                    token: cli.registration_token.clone(),
                })
            })
            .transpose()?;

        let connection = ConnectionConfig {
            broker: BrokerConfig {
                host: cli.broker_host,
                port: cli.broker_port,
                region: cli.region,
                ..BrokerConfig::default()
            },
            reconnect_timeout: Duration::from_millis(cli.reconnect_timeout_ms),
            max_reconnect_retries: cli.max_reconnect_retries,
            ..ConnectionConfig::default()
        };
        let uploader = UploaderConfig {
            subtopic: cli.log_subtopic,
            ..UploaderConfig::default()
        };

        Ok(AgentConfig {
            device_id,
            model: cli.model,
            private_key: cli.private_key,
            certificate: cli.certificate,
            settings: cli.settings,
            registration,
            connection,
            uploader,
            state_interval: Duration::from_secs(cli.state_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<AgentConfig> {
        let mut args = vec![
            "iotlink-agent",
            "--private-key",
            "key.pem",
            "--certificate",
            "cert.pem",
        ];
        args.extend_from_slice(extra);
        AgentConfig::try_from(Cli::try_parse_from(args)?)
    }

    #[test]
    fn defaults_match_the_library_constants() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.connection.broker, BrokerConfig::default());
        assert_eq!(config.connection.reconnect_timeout, Duration::from_millis(5_000));
        assert_eq!(config.connection.max_reconnect_retries, 0);
        assert_eq!(config.state_interval, Duration::from_secs(20));
        assert_eq!(config.uploader.batch_size, 10);
        assert!(config.registration.is_none());
    }

    #[test]
    fn registration_endpoint_is_validated() {
        let config = parse(&[
            "--registration-url",
            "https://functions.example.com/api",
            "--registration-token",
            "secret",
        ])
        .unwrap();
        assert_eq!(
            config.registration,
            Some(RegistrationEndpoint {
                base_url: "https://functions.example.com/api".into(),
                token: "secret".into(),
            })
        );

        assert!(parse(&["--registration-url", "not a url"]).is_err());
    }

    #[test]
    fn zero_state_interval_is_rejected() {
        assert!(parse(&["--state-interval-secs", "0"]).is_err());
    }

    #[test]
    fn blank_device_id_falls_back_to_derivation() {
        let config = parse(&["--device-id", "  "]).unwrap();
        assert!(config.device_id.is_none());
    }
}
