use crate::distributor::Distributor;
use ffp_core::{
    classify, AlarmCodes, Classification, CookiePair, FeedConfig, FeedError, OperationalCode,
    RetryConfig,
};
use ffp_locate::{AddressResolver, MapParams};
use reqwest::{header, Client};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const TRANSIENT_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Where each cycle's payload comes from.
#[derive(Debug, Clone)]
pub enum FeedSource {
    Http(HttpFeed),
    Snapshot(PathBuf),
}

impl FeedSource {
    pub fn from_config(feed: &FeedConfig) -> Result<Self, FeedError> {
        match &feed.testdata {
            Some(path) => Ok(FeedSource::Snapshot(path.clone())),
            None => Ok(FeedSource::Http(HttpFeed::new(feed)?)),
        }
    }

    pub async fn fetch(&self) -> Result<Value, FeedError> {
        match self {
            FeedSource::Http(feed) => feed.fetch().await,
            FeedSource::Snapshot(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| FeedError::Snapshot(format!("{}: {err}", path.display())))?;
                serde_json::from_str(&raw).map_err(|err| FeedError::Body(err.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFeed {
    client: Client,
    url: String,
    cookie: Option<CookiePair>,
    retry: RetryConfig,
}

impl HttpFeed {
    pub fn new(feed: &FeedConfig) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(feed.timeout())
            .build()
            .map_err(|err| FeedError::Network(err.to_string()))?;
        Ok(Self {
            client,
            url: feed.url.clone(),
            cookie: feed.cookie.clone(),
            retry: feed.retry.clone(),
        })
    }

    /// One GET, retrying 5xx gateway-style failures with exponential backoff.
    pub async fn fetch(&self) -> Result<Value, FeedError> {
        let max_backoff = Duration::from_millis(self.retry.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.retry.initial_backoff_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.get(&self.url);
            if let Some(cookie) = &self.cookie {
                request = request.header(header::COOKIE, cookie.header_value());
            }
            let response = request
                .send()
                .await
                .map_err(|err| FeedError::Network(err.to_string()))?;
            let status = response.status().as_u16();
            if response.status().is_success() {
                let body = response
                    .text()
                    .await
                    .map_err(|err| FeedError::Network(err.to_string()))?;
                debug!(event = "feed_body", attempt = attempt, body = %body);
                return serde_json::from_str(&body).map_err(|err| FeedError::Body(err.to_string()));
            }
            if !TRANSIENT_STATUSES.contains(&status) {
                return Err(FeedError::Status(status));
            }
            if attempt >= self.retry.max_attempts {
                return Err(FeedError::Transient {
                    status,
                    attempts: attempt,
                });
            }
            warn!(
                event = "feed_retry",
                status = status,
                attempt = attempt,
                backoff_ms = backoff.as_millis() as u64
            );
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, max_backoff);
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

pub struct Poller {
    source: FeedSource,
    codes: AlarmCodes,
    period: Duration,
    distributor: Distributor,
    resolver: Option<Arc<AddressResolver>>,
    map_tx: Arc<watch::Sender<Option<MapParams>>>,
    resolved_incident: Option<Value>,
}

impl Poller {
    pub fn new(
        source: FeedSource,
        codes: AlarmCodes,
        period: Duration,
        distributor: Distributor,
    ) -> Self {
        let (map_tx, _) = watch::channel(None);
        Self {
            source,
            codes,
            period,
            distributor,
            resolver: None,
            map_tx: Arc::new(map_tx),
            resolved_incident: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Map parameters of the current incident; `None` outside an alarm or when
    /// the incident could not be located.
    pub fn map_updates(&self) -> watch::Receiver<Option<MapParams>> {
        self.map_tx.subscribe()
    }

    /// Fetch, classify, publish. Every failure is published as [`OperationalCode::Error`].
    pub async fn poll_once(&mut self) -> Classification {
        let classification = match self.source.fetch().await {
            Ok(payload) => classify(payload, &self.codes),
            Err(err) => {
                error!(event = "feed_fetch_failed", error = %err);
                Classification::from_error(err)
            }
        };
        self.distributor.publish(classification.code);
        self.track_incident(&classification);
        classification
    }

    /// Starts one resolution per distinct incident. Error cycles keep the
    /// current incident so a feed hiccup does not trigger another lookup.
    fn track_incident(&mut self, classification: &Classification) {
        let Some(resolver) = self.resolver.as_ref() else {
            return;
        };
        match classification.code {
            OperationalCode::Alarm => {
                let Some(incident) = classification.first_incident() else {
                    return;
                };
                if self.resolved_incident.as_ref() == Some(incident) {
                    return;
                }
                self.resolved_incident = Some(incident.clone());
                let resolver = Arc::clone(resolver);
                let incident = incident.clone();
                let map_tx = Arc::clone(&self.map_tx);
                tokio::spawn(async move {
                    let params = resolver.resolve(&incident).await.ok();
                    map_tx.send_replace(params);
                });
            }
            OperationalCode::Normal => {
                if self.resolved_incident.take().is_some() {
                    self.map_tx.send_replace(None);
                }
            }
            OperationalCode::Error => {}
        }
    }

    /// Polls on a fixed period forever; overrunning cycles skip ticks instead of stacking.
    pub async fn run(mut self) {
        info!(
            event = "poller_start",
            period_secs = self.period.as_secs_f64(),
            screens = self.distributor.len(),
            alarm_codes = self.codes.len(),
            offline = matches!(self.source, FeedSource::Snapshot(_))
        );
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let started = Instant::now();
            let classification = self.poll_once().await;
            info!(event = "status_published", code = %classification.code);
            let elapsed = started.elapsed();
            if elapsed > self.period {
                warn!(
                    event = "tick_missed",
                    elapsed_ms = elapsed.as_millis() as u64,
                    period_ms = self.period.as_millis() as u64
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributor::Inbox;
    use async_trait::async_trait;
    use ffp_locate::{Coordinates, Geocoder, HighwayTable, LocateError};
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn spawn_feed(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().await.expect("accept");
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !String::from_utf8_lossy(&buf).contains("\r\n\r\n") {
                    let n = stream.read(&mut chunk).await.expect("read");
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                seen.push(String::from_utf8_lossy(&buf).to_string());
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).await.expect("write");
                let _ = stream.shutdown().await;
            }
            seen
        });
        (format!("http://{addr}/status.json"), handle)
    }

    fn feed_config(url: &str, max_attempts: u32) -> FeedConfig {
        FeedConfig {
            url: url.to_string(),
            cookie: Some(CookiePair::new("wastl", "secret")),
            valid_alarm_codes: vec!["b4".to_string()],
            period_secs: 1,
            timeout_secs: 5,
            testdata: None,
            retry: RetryConfig {
                max_attempts,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
            },
        }
    }

    fn snapshot(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write snapshot");
        file
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let cap = Duration::from_millis(500);
        let mut delay = Duration::from_millis(100);
        let mut seen = Vec::new();
        for _ in 0..4 {
            delay = next_backoff(delay, cap);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen, vec![200, 400, 500, 500]);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_with_cookie_credential() {
        let (url, server) = spawn_feed(vec![
            (503, "{}"),
            (502, "{}"),
            (200, r#"{"CurrentState":"data","EinsatzData":[]}"#),
        ])
        .await;
        let feed = HttpFeed::new(&feed_config(&url, 20)).expect("feed");

        let payload = feed.fetch().await.expect("payload");
        assert_eq!(payload["CurrentState"], "data");

        let seen = server.await.expect("server");
        assert_eq!(seen.len(), 3);
        for request in &seen {
            assert!(request.starts_with("GET /status.json HTTP/1.1"));
            assert!(request.to_lowercase().contains("cookie: wastl=secret"));
        }
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, server) = spawn_feed(vec![(404, "{}")]).await;
        let feed = HttpFeed::new(&feed_config(&url, 20)).expect("feed");

        assert_eq!(feed.fetch().await, Err(FeedError::Status(404)));
        assert_eq!(server.await.expect("server").len(), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let (url, server) = spawn_feed(vec![(503, "{}"), (504, "{}")]).await;
        let feed = HttpFeed::new(&feed_config(&url, 2)).expect("feed");

        assert_eq!(
            feed.fetch().await,
            Err(FeedError::Transient {
                status: 504,
                attempts: 2
            })
        );
        assert_eq!(server.await.expect("server").len(), 2);
    }

    #[tokio::test]
    async fn garbage_body_is_a_body_error() {
        let (url, _server) = spawn_feed(vec![(200, "<html>login</html>")]).await;
        let feed = HttpFeed::new(&feed_config(&url, 1)).expect("feed");
        assert!(matches!(feed.fetch().await, Err(FeedError::Body(_))));
    }

    #[tokio::test]
    async fn snapshot_feed_drives_the_same_pipeline() {
        let file = snapshot(r#"{"CurrentState":"data","EinsatzData":[]}"#);
        let mut config = feed_config("", 1);
        config.testdata = Some(file.path().to_path_buf());

        let distributor = Distributor::new();
        let mut inbox = distributor.register("left");
        let source = FeedSource::from_config(&config).expect("source");
        assert!(matches!(source, FeedSource::Snapshot(_)));
        let mut poller = Poller::new(source, config.alarm_codes(), config.period(), distributor);

        assert_eq!(poller.poll_once().await.code, OperationalCode::Normal);
        assert_eq!(inbox.recv().await, Some(OperationalCode::Normal));
    }

    #[tokio::test]
    async fn waiting_feed_and_missing_snapshot_publish_error() {
        let file = snapshot(r#"{"CurrentState":"waiting"}"#);
        let distributor = Distributor::new();
        let mut inbox = distributor.register("left");
        let mut poller = Poller::new(
            FeedSource::Snapshot(file.path().to_path_buf()),
            AlarmCodes::new(["b4"]),
            Duration::from_secs(1),
            distributor,
        );
        let classification = poller.poll_once().await;
        assert_eq!(
            classification.issue,
            Some(FeedError::AuthPending("waiting".to_string()))
        );
        assert_eq!(inbox.recv().await, Some(OperationalCode::Error));

        let distributor = Distributor::new();
        let mut inbox = distributor.register("left");
        let mut poller = Poller::new(
            FeedSource::Snapshot(PathBuf::from("/nonexistent/snapshot.json")),
            AlarmCodes::new(["b4"]),
            Duration::from_secs(1),
            distributor,
        );
        let classification = poller.poll_once().await;
        assert!(matches!(classification.issue, Some(FeedError::Snapshot(_))));
        assert_eq!(inbox.recv().await, Some(OperationalCode::Error));
    }

    #[derive(Default)]
    struct CountingGeocoder {
        queries: Mutex<Vec<String>>,
    }

    impl CountingGeocoder {
        fn queries(&self) -> Vec<String> {
            self.queries.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, LocateError> {
            self.queries.lock().expect("lock").push(address.to_string());
            Ok(Some(Coordinates { lat: 48.4, lon: 15.6 }))
        }
    }

    fn alarm_feed(street: &str) -> String {
        format!(
            r#"{{"CurrentState":"data","EinsatzData":[{{"Alarmstufe":"B4","Strasse":"{street}","Nummer1":"12.000","Nummer2":"","Nummer3":"","Plz":"3500","Ort":"Krems"}}]}}"#
        )
    }

    fn mapped_poller(path: &std::path::Path, geocoder: Arc<CountingGeocoder>) -> (Poller, Inbox) {
        let resolver = Arc::new(AddressResolver::new("A1", HighwayTable::default(), geocoder));
        let distributor = Distributor::new();
        let inbox = distributor.register("left");
        let poller = Poller::new(
            FeedSource::Snapshot(path.to_path_buf()),
            AlarmCodes::new(["b4"]),
            Duration::from_secs(1),
            distributor,
        )
        .with_resolver(resolver);
        (poller, inbox)
    }

    #[tokio::test]
    async fn alarm_publishes_and_resolves_incident_map() {
        let file = snapshot(&alarm_feed("Hauptplatz"));
        let geocoder = Arc::new(CountingGeocoder::default());
        let (mut poller, mut inbox) = mapped_poller(file.path(), geocoder.clone());
        let mut maps = poller.map_updates();

        assert_eq!(poller.poll_once().await.code, OperationalCode::Alarm);
        assert_eq!(inbox.recv().await, Some(OperationalCode::Alarm));

        maps.changed().await.expect("map resolved");
        assert_eq!(
            *maps.borrow_and_update(),
            Some(MapParams {
                lat: 48.4,
                lon: 15.6,
                zoom: 17
            })
        );
        assert_eq!(geocoder.queries(), vec!["3500 Krems, Hauptplatz 12".to_string()]);
    }

    #[tokio::test]
    async fn unchanged_incident_is_located_once() {
        let file = snapshot(&alarm_feed("Hauptplatz"));
        let geocoder = Arc::new(CountingGeocoder::default());
        let (mut poller, _inbox) = mapped_poller(file.path(), geocoder.clone());
        let mut maps = poller.map_updates();

        poller.poll_once().await;
        maps.changed().await.expect("map resolved");
        for _ in 0..4 {
            assert_eq!(poller.poll_once().await.code, OperationalCode::Alarm);
        }
        assert_eq!(geocoder.queries().len(), 1);

        std::fs::write(file.path(), alarm_feed("Ringstrasse")).expect("rewrite snapshot");
        poller.poll_once().await;
        maps.changed().await.expect("second map resolved");
        assert_eq!(geocoder.queries().len(), 2);
        assert_eq!(geocoder.queries()[1], "3500 Krems, Ringstrasse 12");

        std::fs::write(file.path(), r#"{"CurrentState":"data","EinsatzData":[]}"#)
            .expect("rewrite snapshot");
        assert_eq!(poller.poll_once().await.code, OperationalCode::Normal);
        assert_eq!(*maps.borrow_and_update(), None);
    }

    #[tokio::test]
    async fn run_publishes_every_period() {
        let file = snapshot(r#"{"CurrentState":"data","EinsatzData":[]}"#);
        let distributor = Distributor::new();
        let mut inbox = distributor.register("left");
        let poller = Poller::new(
            FeedSource::Snapshot(file.path().to_path_buf()),
            AlarmCodes::default(),
            Duration::from_millis(10),
            distributor,
        );
        let task = tokio::spawn(poller.run());

        for _ in 0..3 {
            assert_eq!(inbox.recv().await, Some(OperationalCode::Normal));
        }
        task.abort();
    }
}
