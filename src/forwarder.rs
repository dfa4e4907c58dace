use crate::error::ClientError;
use crate::listener::PayloadSource;
use crate::log_entry::LabelSet;
use crate::loki_client::LokiClient;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use std::time::Duration as StdDuration;
use tokio::time::sleep;

pub const JOB: &str = "weatherflow";

const READ_RETRY_DELAY: StdDuration = StdDuration::from_secs(1);

/// Accepts log lines for delivery to the backend.
pub trait LogSink {
    async fn handle(
        &self,
        labels: &LabelSet,
        timestamp: DateTime<Utc>,
        line: String,
    ) -> Result<(), ClientError>;
}

impl LogSink for LokiClient {
    async fn handle(
        &self,
        labels: &LabelSet,
        timestamp: DateTime<Utc>,
        line: String,
    ) -> Result<(), ClientError> {
        LokiClient::handle(self, labels, timestamp, line).await
    }
}

/// Tracks when the next "heartbeat" line is due.
///
/// The threshold advances by a fixed interval from its previous value, so a
/// long stretch without successful sends leaves it behind and the following
/// sends each fire until it catches up.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    next: DateTime<Utc>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            next: start,
            interval: Duration::minutes(1),
        }
    }

    pub fn next(&self) -> DateTime<Utc> {
        self.next
    }

    /// Returns true, and moves the threshold forward, if `now` is past it.
    pub fn check(&mut self, now: DateTime<Utc>) -> bool {
        if now > self.next {
            self.next += self.interval;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    SentWithHeartbeat,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Forwarder<S> {
    client: Result<S, String>,
    labels: LabelSet,
    heartbeat: Heartbeat,
    clock: Clock,
}

impl<S: LogSink> Forwarder<S> {
    /// Wraps the backend client. A client that failed to initialise is kept as
    /// its error; every forward then fails.
    pub fn new(client: Result<S, ClientError>, start: DateTime<Utc>) -> Self {
        Self {
            client: client.map_err(|e| e.to_string()),
            labels: LabelSet::new().with("job", JOB),
            heartbeat: Heartbeat::new(start),
            clock: Box::new(Utc::now),
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    async fn submit(&self, payload: String, received: DateTime<Utc>) -> Result<(), ClientError> {
        match self.client {
            Ok(ref client) => client.handle(&self.labels, received, payload).await,
            Err(ref reason) => Err(ClientError::NotInitialised(reason.clone())),
        }
    }

    /// Sends one payload stamped with `received`. The heartbeat is checked
    /// against the clock once the client has accepted the entry.
    pub async fn forward(
        &mut self,
        payload: String,
        received: DateTime<Utc>,
    ) -> Result<Outcome, ClientError> {
        self.submit(payload, received).await?;

        if self.heartbeat.check((self.clock)()) {
            Ok(Outcome::SentWithHeartbeat)
        } else {
            Ok(Outcome::Sent)
        }
    }
}

/// Receive-and-forward loop. Never returns; read errors pause briefly and
/// retry, failed submissions are logged and the record dropped.
pub async fn run<P: PayloadSource, S: LogSink>(mut source: P, mut forwarder: Forwarder<S>) {
    loop {
        let payload = match source.recv().await {
            Ok(payload) => payload,
            Err(e) => {
                error!(error:% = e; "could not read from socket");
                sleep(READ_RETRY_DELAY).await;
                continue;
            }
        };
        debug!(payload:% = payload; "received packet");

        match forwarder.forward(payload, Utc::now()).await {
            Ok(Outcome::SentWithHeartbeat) => {
                info!(next:% = forwarder.heartbeat().next(); "heartbeat");
            }
            Ok(Outcome::Sent) => {}
            Err(e) => {
                error!(error:% = e; "failed to hand entry to client");
            }
        }
    }
}
