//! Client for the Loki push API.
//!
//! Entries handed to [`LokiClient::handle`] are queued for a background task
//! that groups them into batches and POSTs them as JSON to the configured
//! endpoint, retrying transient failures with exponential backoff.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::log_entry::{Entry, LabelSet};
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

const ENTRY_QUEUE_CAPACITY: usize = 1024;
const MIN_TICK: Duration = Duration::from_millis(10);
const USER_AGENT: &str = concat!("weatherfloki/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    streams: Vec<PushStream<'a>>,
}

#[derive(Debug, Serialize)]
struct PushStream<'a> {
    stream: &'a LabelSet,
    values: Vec<[String; 2]>,
}

/// Entries accumulated for one push, grouped into streams by label set.
#[derive(Debug, Default)]
struct Batch {
    streams: BTreeMap<LabelSet, Vec<(DateTime<Utc>, String)>>,
    bytes: usize,
    entries: usize,
    created: Option<Instant>,
}

impl Batch {
    fn add(&mut self, entry: Entry) {
        if self.created.is_none() {
            self.created = Some(Instant::now());
        }
        self.bytes += entry.line.len();
        self.entries += 1;
        self.streams
            .entry(entry.labels)
            .or_default()
            .push((entry.timestamp, entry.line));
    }

    fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn size_bytes_after(&self, entry: &Entry) -> usize {
        self.bytes + entry.line.len()
    }

    fn age(&self) -> Duration {
        self.created.map(|c| c.elapsed()).unwrap_or_default()
    }

    fn request(&self) -> PushRequest<'_> {
        let streams = self
            .streams
            .iter()
            .map(|(labels, lines)| PushStream {
                stream: labels,
                values: lines
                    .iter()
                    .map(|(ts, line)| {
                        [
                            ts.timestamp_nanos_opt().unwrap_or_default().to_string(),
                            line.clone(),
                        ]
                    })
                    .collect(),
            })
            .collect();
        PushRequest { streams }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

/// Sends encoded batches to Loki.
struct Pusher {
    http: reqwest::Client,
    url: reqwest::Url,
    tenant_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    bearer_token: Option<String>,
    min_backoff: Duration,
    max_backoff: Duration,
    max_retries: u32,
}

impl Pusher {
    async fn push(&self, request: &PushRequest<'_>) -> Result<(), ClientError> {
        let mut builder = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(request);

        if let Some(ref tenant) = self.tenant_id {
            builder = builder.header("X-Scope-OrgID", tenant);
        }
        if let Some(ref username) = self.username {
            builder = builder.basic_auth(username, self.password.as_ref());
        } else if let Some(ref token) = self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }

    async fn send_batch(&self, batch: Batch) {
        let request = batch.request();
        let mut backoff = self.min_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.push(&request).await {
                Ok(()) => {
                    debug!(entries = batch.entries, bytes = batch.bytes; "batch sent");
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(error:% = e, attempt = attempt, backoff:? = backoff; "error sending batch, will retry");
                    sleep(backoff).await;
                    backoff = next_backoff(backoff, self.max_backoff);
                }
                Err(e) => {
                    error!(error:% = e, attempt = attempt, entries = batch.entries; "final error sending batch");
                    return;
                }
            }
        }
    }
}

/// Handle to the Loki batching task.
pub struct LokiClient {
    tx: mpsc::Sender<Entry>,
    external_labels: LabelSet,
    #[cfg(test)]
    task: tokio::task::JoinHandle<()>,
}

impl LokiClient {
    /// Validates `config` and spawns the batching task. Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| ClientError::Config("client.url is required".into()))?;
        let url = reqwest::Url::parse(url)
            .map_err(|e| ClientError::Config(format!("invalid client.url {:?}: {}", url, e)))?;
        if config.batch_size_bytes == 0 {
            return Err(ClientError::Config(
                "client.batch-size-bytes must be positive".into(),
            ));
        }
        if config.min_backoff > config.max_backoff {
            return Err(ClientError::Config(format!(
                "client.min-backoff ({:?}) exceeds client.max-backoff ({:?})",
                config.min_backoff, config.max_backoff
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        let pusher = Pusher {
            http,
            url,
            tenant_id: config.tenant_id,
            username: config.username,
            password: config.password,
            bearer_token: config.bearer_token,
            min_backoff: config.min_backoff,
            max_backoff: config.max_backoff,
            max_retries: config.max_retries,
        };

        if !config.external_labels.is_empty() {
            debug!(labels:% = config.external_labels; "adding external labels to every stream");
        }

        let (tx, rx) = mpsc::channel(ENTRY_QUEUE_CAPACITY);
        let task = tokio::spawn(run_batches(
            rx,
            pusher,
            config.batch_wait,
            config.batch_size_bytes,
        ));
        // The task ends by itself, flushing, once every sender is dropped.
        #[cfg(not(test))]
        drop(task);

        Ok(Self {
            tx,
            external_labels: config.external_labels,
            #[cfg(test)]
            task,
        })
    }

    /// Queues one line for delivery. Fails only once the batching task has gone away.
    pub async fn handle(
        &self,
        labels: &LabelSet,
        timestamp: DateTime<Utc>,
        line: String,
    ) -> Result<(), ClientError> {
        let mut labels = labels.clone();
        labels.merge_missing(&self.external_labels);
        self.tx
            .send(Entry::new(labels, timestamp, line))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Flushes whatever is batched and waits for the task to finish.
    #[cfg(test)]
    pub async fn stop(self) {
        let LokiClient { tx, task, .. } = self;
        drop(tx);
        if let Err(e) = task.await {
            error!(error:% = e; "batching task failed");
        }
    }
}

async fn run_batches(
    mut rx: mpsc::Receiver<Entry>,
    pusher: Pusher,
    batch_wait: Duration,
    batch_size_bytes: usize,
) {
    let mut batch = Batch::default();
    let mut ticker = interval(std::cmp::max(batch_wait / 10, MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(entry) = received else {
                    if !batch.is_empty() {
                        pusher.send_batch(batch).await;
                    }
                    return;
                };
                if !batch.is_empty() && batch.size_bytes_after(&entry) > batch_size_bytes {
                    pusher.send_batch(std::mem::take(&mut batch)).await;
                }
                batch.add(entry);
            }
            _ = ticker.tick() => {
                if !batch.is_empty() && batch.age() >= batch_wait {
                    pusher.send_batch(std::mem::take(&mut batch)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[derive(Debug)]
    struct Request {
        path: String,
        headers: Vec<(String, String)>,
        body: serde_json::Value,
    }

    impl Request {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    /// Minimal HTTP/1.1 server standing in for Loki. Answers with `statuses`
    /// in order, then 204 for everything after.
    async fn fake_loki(statuses: Vec<u16>) -> (String, mpsc::UnboundedReceiver<Request>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let statuses = std::sync::Arc::new(std::sync::Mutex::new(
            statuses.into_iter().collect::<std::collections::VecDeque<_>>(),
        ));

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let tx = tx.clone();
                let statuses = statuses.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    loop {
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let path = request_line
                            .split_whitespace()
                            .nth(1)
                            .unwrap_or_default()
                            .to_string();

                        let mut headers = Vec::new();
                        loop {
                            let mut line = String::new();
                            reader.read_line(&mut line).await.unwrap();
                            let line = line.trim_end();
                            if line.is_empty() {
                                break;
                            }
                            if let Some((name, value)) = line.split_once(':') {
                                headers.push((name.trim().to_string(), value.trim().to_string()));
                            }
                        }

                        let length = headers
                            .iter()
                            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                            .and_then(|(_, v)| v.parse::<usize>().ok())
                            .unwrap_or(0);
                        let mut body = vec![0; length];
                        reader.read_exact(&mut body).await.unwrap();

                        let status = statuses.lock().unwrap().pop_front().unwrap_or(204);
                        let _ = tx.send(Request {
                            path,
                            headers,
                            body: serde_json::from_slice(&body).unwrap_or_default(),
                        });
                        let response =
                            format!("HTTP/1.1 {} Status\r\ncontent-length: 0\r\n\r\n", status);
                        reader.get_mut().write_all(response.as_bytes()).await.unwrap();
                    }
                });
            }
        });

        (format!("http://{}/loki/api/v1/push", addr), rx)
    }

    fn test_config(url: String) -> ClientConfig {
        ClientConfig {
            url: Some(url),
            batch_wait: Duration::from_secs(60),
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_retries: 3,
            ..ClientConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Request>) -> Vec<Request> {
        let mut requests = Vec::new();
        while let Ok(request) = rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    #[test]
    fn batch_groups_entries_by_label_set() {
        let ts = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        let wf = LabelSet::new().with("job", "weatherflow");
        let other = LabelSet::new().with("job", "other");

        let mut batch = Batch::default();
        batch.add(Entry::new(wf.clone(), ts, "a".into()));
        batch.add(Entry::new(other, ts, "bb".into()));
        batch.add(Entry::new(wf, ts, "ccc".into()));

        assert_eq!(batch.entries, 3);
        assert_eq!(batch.bytes, 6);

        let body = serde_json::to_value(batch.request()).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "streams": [
                    {
                        "stream": {"job": "other"},
                        "values": [["1700000000000000005", "bb"]]
                    },
                    {
                        "stream": {"job": "weatherflow"},
                        "values": [
                            ["1700000000000000005", "a"],
                            ["1700000000000000005", "ccc"]
                        ]
                    }
                ]
            })
        );
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let max = Duration::from_secs(5);
        assert_eq!(next_backoff(Duration::from_millis(500), max), Duration::from_secs(1));
        assert_eq!(next_backoff(Duration::from_secs(4), max), max);
        assert_eq!(next_backoff(Duration::MAX, Duration::MAX), Duration::MAX);
        assert_eq!(
            next_backoff(Duration::from_secs(u64::MAX / 2 + 1), Duration::MAX),
            Duration::MAX
        );
    }

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let missing = LokiClient::new(ClientConfig::default());
        assert!(matches!(missing, Err(ClientError::Config(_))));

        let bad_url = LokiClient::new(ClientConfig {
            url: Some("not a url".into()),
            ..ClientConfig::default()
        });
        assert!(matches!(bad_url, Err(ClientError::Config(_))));

        let backoff = LokiClient::new(ClientConfig {
            url: Some("http://localhost:3100/loki/api/v1/push".into()),
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..ClientConfig::default()
        });
        assert!(matches!(backoff, Err(ClientError::Config(_))));

        let size = LokiClient::new(ClientConfig {
            url: Some("http://localhost:3100/loki/api/v1/push".into()),
            batch_size_bytes: 0,
            ..ClientConfig::default()
        });
        assert!(matches!(size, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn stop_flushes_pending_entries() {
        let (url, mut requests) = fake_loki(vec![]).await;
        let mut config = test_config(url);
        config.tenant_id = Some("home".into());
        config.external_labels = LabelSet::new().with("host", "pi").with("job", "ignored");

        let client = LokiClient::new(config).unwrap();
        let labels = LabelSet::new().with("job", "weatherflow");
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        client
            .handle(&labels, ts, "Rapid_wind,wind_speed_mph=5.3".into())
            .await
            .unwrap();
        client.stop().await;

        let requests = drain(&mut requests);
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.path, "/loki/api/v1/push");
        assert_eq!(request.header("x-scope-orgid"), Some("home"));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(
            request.body,
            serde_json::json!({
                "streams": [{
                    "stream": {"host": "pi", "job": "weatherflow"},
                    "values": [["1700000000000000000", "Rapid_wind,wind_speed_mph=5.3"]]
                }]
            })
        );
    }

    #[tokio::test]
    async fn batch_wait_triggers_a_push() {
        let (url, mut requests) = fake_loki(vec![]).await;
        let mut config = test_config(url);
        config.batch_wait = Duration::from_millis(50);

        let client = LokiClient::new(config).unwrap();
        client
            .handle(&LabelSet::new().with("job", "weatherflow"), Utc::now(), "obs".into())
            .await
            .unwrap();

        let request = tokio::time::timeout(Duration::from_secs(5), requests.recv())
            .await
            .expect("batch was not pushed after batch wait")
            .unwrap();
        assert_eq!(request.body["streams"][0]["values"][0][1], "obs");
        client.stop().await;
        assert!(drain(&mut requests).is_empty());
    }

    #[tokio::test]
    async fn full_batch_is_sent_before_adding_more() {
        let (url, mut requests) = fake_loki(vec![]).await;
        let mut config = test_config(url);
        config.batch_size_bytes = 8;

        let client = LokiClient::new(config).unwrap();
        let labels = LabelSet::new().with("job", "weatherflow");
        for line in ["12345", "678", "9abcd"] {
            client.handle(&labels, Utc::now(), line.into()).await.unwrap();
        }
        client.stop().await;

        let requests = drain(&mut requests);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].body["streams"][0]["values"].as_array().unwrap().len(), 2);
        assert_eq!(requests[1].body["streams"][0]["values"][0][1], "9abcd");
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (url, mut requests) = fake_loki(vec![500, 503]).await;
        let client = LokiClient::new(test_config(url)).unwrap();
        client
            .handle(&LabelSet::new().with("job", "weatherflow"), Utc::now(), "x".into())
            .await
            .unwrap();
        client.stop().await;

        assert_eq!(drain(&mut requests).len(), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_max_retries() {
        let (url, mut requests) = fake_loki(vec![500, 500, 500, 500, 500]).await;
        let client = LokiClient::new(test_config(url)).unwrap();
        client
            .handle(&LabelSet::new().with("job", "weatherflow"), Utc::now(), "x".into())
            .await
            .unwrap();
        client.stop().await;

        assert_eq!(drain(&mut requests).len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, mut requests) = fake_loki(vec![400]).await;
        let client = LokiClient::new(test_config(url)).unwrap();
        client
            .handle(&LabelSet::new().with("job", "weatherflow"), Utc::now(), "x".into())
            .await
            .unwrap();
        client.stop().await;

        assert_eq!(drain(&mut requests).len(), 1);
    }

    #[tokio::test]
    async fn basic_auth_is_sent() {
        let (url, mut requests) = fake_loki(vec![]).await;
        let mut config = test_config(url);
        config.username = Some("user".into());
        config.password = Some("secret".into());
        config.bearer_token = Some("unused".into());

        let client = LokiClient::new(config).unwrap();
        client
            .handle(&LabelSet::new().with("job", "weatherflow"), Utc::now(), "x".into())
            .await
            .unwrap();
        client.stop().await;

        let requests = drain(&mut requests);
        assert_eq!(requests[0].header("authorization"), Some("Basic dXNlcjpzZWNyZXQ="));
    }
}
