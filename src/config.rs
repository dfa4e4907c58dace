use crate::log_entry::LabelSet;
use clap::Parser;
use std::time::Duration;

/// Forwards WeatherFlow UDP broadcasts to Loki.
///
/// Every flag configures the Loki client; the UDP port is fixed.
#[derive(Parser, Debug)]
#[clap(name = "weatherfloki", version, about)]
pub struct Cli {
    /// Loki push endpoint, e.g. http://localhost:3100/loki/api/v1/push
    #[arg(long = "client.url")]
    pub url: Option<String>,

    /// Maximum time to wait before sending a batch
    #[arg(long = "client.batch-wait", default_value = "1s", value_parser = humantime::parse_duration)]
    pub batch_wait: Duration,

    /// Maximum batch size to accrue before sending
    #[arg(long = "client.batch-size-bytes", default_value_t = 1024 * 1024)]
    pub batch_size_bytes: usize,

    /// Initial backoff time between retries
    #[arg(long = "client.min-backoff", default_value = "500ms", value_parser = humantime::parse_duration)]
    pub min_backoff: Duration,

    /// Maximum backoff time between retries
    #[arg(long = "client.max-backoff", default_value = "5m", value_parser = humantime::parse_duration)]
    pub max_backoff: Duration,

    /// Maximum number of attempts per batch
    #[arg(long = "client.max-retries", default_value_t = 10)]
    pub max_retries: u32,

    /// Maximum time to wait for the server to respond to a request
    #[arg(long = "client.timeout", default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Tenant ID sent as X-Scope-OrgID
    #[arg(long = "client.tenant-id")]
    pub tenant_id: Option<String>,

    /// Labels added to every stream, as name=value,name=value
    #[arg(long = "client.external-labels", default_value = "", value_parser = LabelSet::parse)]
    pub external_labels: LabelSet,

    /// Basic auth username
    #[arg(long = "client.username")]
    pub username: Option<String>,

    /// Basic auth password
    #[arg(long = "client.password")]
    pub password: Option<String>,

    /// Bearer token, used when no basic auth username is set
    #[arg(long = "client.bearer-token")]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Option<String>,
    pub batch_wait: Duration,
    pub batch_size_bytes: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    pub timeout: Duration,
    pub tenant_id: Option<String>,
    pub external_labels: LabelSet,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            batch_wait: Duration::from_secs(1),
            batch_size_bytes: 1024 * 1024,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5 * 60),
            max_retries: 10,
            timeout: Duration::from_secs(10),
            tenant_id: None,
            external_labels: LabelSet::new(),
            username: None,
            password: None,
            bearer_token: None,
        }
    }
}

impl From<Cli> for ClientConfig {
    fn from(cli: Cli) -> Self {
        Self {
            url: cli.url,
            batch_wait: cli.batch_wait,
            batch_size_bytes: cli.batch_size_bytes,
            min_backoff: cli.min_backoff,
            max_backoff: cli.max_backoff,
            max_retries: cli.max_retries,
            timeout: cli.timeout,
            tenant_id: cli.tenant_id,
            external_labels: cli.external_labels,
            username: cli.username,
            password: cli.password,
            bearer_token: cli.bearer_token,
        }
    }
}
