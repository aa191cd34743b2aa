// Telemetry client
// Connects to the data source, feeds frames into the session and drives the render clock

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use rand::Rng;
use tokio::time::{self, Instant, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use super::connection::{Connection, Frame};
use crate::constants::{CONNECT_TIMEOUT_SECS, MAX_FRAME_BYTES};
use super::messages::PacketError;
use crate::session::TelemetrySession;

/// Random value in [0.9*t, 1.1*t], so a fleet of clients does not retry in lockstep.
fn fuzzy(t: Duration) -> Duration {
    let ms = t.as_secs_f64() * 1000.0;
    let r = rand::thread_rng().gen_range(0.9 * ms..=1.1 * ms);
    Duration::from_secs_f64(r / 1000.0)
}

/// Exponential reconnect delay with a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        // A zero delay would retry in a tight loop
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Backoff { initial, max, current: initial }
    }

    /// Delay before the next attempt; doubles each call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = (self.current * 2).min(self.max);
        fuzzy(nominal).min(self.max)
    }

    /// Nominal delay the next call will use.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// host:port of the data source
    pub addr: String,
    pub render_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
}

impl ClientSettings {
    pub fn new(addr: &str) -> Self {
        ClientSettings {
            addr: addr.to_string(),
            render_interval: Duration::from_millis(50),
            reconnect_initial: Duration::from_millis(200),
            reconnect_max: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Connection state; holding exactly one of these means at most one pending
/// retry timer or connect attempt at any time.
enum Link {
    Waiting(Pin<Box<Sleep>>),
    Connecting(Pin<Box<dyn Future<Output = io::Result<Connection>> + Send>>),
    Connected(Connection),
}

enum LinkEvent {
    RetryDue,
    ConnectFinished(io::Result<Connection>),
    Frame(io::Result<Option<Frame>>),
}

/// Wait for whatever the current link state is waiting on. Every awaited
/// future lives in `link`, so dropping this future loses nothing.
async fn next_event(link: &mut Link) -> LinkEvent {
    match link {
        Link::Waiting(sleep) => {
            sleep.as_mut().await;
            LinkEvent::RetryDue
        }
        Link::Connecting(attempt) => LinkEvent::ConnectFinished(attempt.as_mut().await),
        Link::Connected(conn) => LinkEvent::Frame(conn.next_frame().await),
    }
}

/// Client side of the telemetry link
pub struct TelemetryClient {
    settings: ClientSettings,
    backoff: Backoff,
    epoch: Instant,
}

impl TelemetryClient {
    pub fn new(settings: ClientSettings) -> Self {
        let backoff = Backoff::new(settings.reconnect_initial, settings.reconnect_max);
        TelemetryClient {
            settings,
            backoff,
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the client was created; the session's wall clock.
    pub fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    fn connect(&self) -> Link {
        info!("Connecting to {}", self.settings.addr);
        let attempt = Connection::connect(self.settings.addr.clone(), self.settings.connect_timeout);
        Link::Connecting(Box::pin(attempt))
    }

    fn schedule_retry(&mut self) -> Link {
        let delay = self.backoff.next_delay();
        info!("Reconnecting in {} ms", delay.as_millis());
        Link::Waiting(Box::pin(time::sleep(delay)))
    }

    /// Run until `shutdown` completes.
    ///
    /// Socket reads, the fixed-rate render tick and the reconnect timer are
    /// multiplexed on this one task, so the session never sees concurrent calls.
    pub async fn run<F>(&mut self, session: &mut TelemetrySession, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut ticker = time::interval(self.settings.render_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut link = self.connect();

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down telemetry client");
                    session.on_disconnect("shutdown");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    session.render_tick(self.now_ms());
                    continue;
                }
                event = next_event(&mut link) => event,
            };

            link = match event {
                LinkEvent::RetryDue => self.connect(),
                LinkEvent::ConnectFinished(Ok(conn)) => {
                    let peer = conn.peer_addr();
                    info!("Connected to {}", peer);
                    self.backoff.reset();
                    session.on_connect(&peer.to_string(), self.now_ms());
                    Link::Connected(conn)
                }
                LinkEvent::ConnectFinished(Err(e)) => {
                    warn!("Failed to connect to {}: {}", self.settings.addr, e);
                    self.schedule_retry()
                }
                LinkEvent::Frame(Ok(Some(Frame::Line(bytes)))) => {
                    if !bytes.iter().all(u8::is_ascii_whitespace) {
                        session.handle_raw_frame(&bytes, self.now_ms());
                    }
                    continue;
                }
                LinkEvent::Frame(Ok(Some(Frame::Oversized(len)))) => {
                    warn!("Skipped {} byte frame (limit {})", len, MAX_FRAME_BYTES);
                    session.drop_frame(PacketError::FrameTooLong(len));
                    continue;
                }
                LinkEvent::Frame(Ok(None)) => {
                    debug!("Server closed the connection");
                    session.on_disconnect("closed by server");
                    self.schedule_retry()
                }
                LinkEvent::Frame(Err(e)) => {
                    warn!("Read error: {}", e);
                    session.on_disconnect(&e.to_string());
                    self.schedule_retry()
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_millis(5000));
        let mut nominal = Vec::new();
        for _ in 0..7 {
            nominal.push(backoff.current().as_millis());
            let delay = backoff.next_delay().as_secs_f64() * 1000.0;
            let expected = *nominal.last().unwrap() as f64;
            assert!(delay >= 0.9 * expected - 1e-6 && delay <= (1.1 * expected).min(5000.0) + 1e-6);
        }
        assert_eq!(nominal, vec![200, 400, 800, 1600, 3200, 5000, 5000]);

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_never_zero() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.current(), Duration::from_millis(1));
        assert!(backoff.next_delay() > Duration::ZERO);
    }

    #[test]
    fn test_fuzzy_bounds() {
        for _ in 0..100 {
            let d = fuzzy(Duration::from_millis(1000)).as_secs_f64();
            assert!((0.9 - 1e-6..=1.1 + 1e-6).contains(&d));
        }
    }

    #[tokio::test]
    async fn test_client_feeds_session_and_survives_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            drop(listener);
            let frames = concat!(
                "{\"id\": 3, \"data\": {\"meta\": {\"timestampS\": 1.0}, \"velocity\": 10}}\n",
                "not json\n",
                "\n",
                "{\"id\": 3, \"data\": {\"meta\": {\"timestampS\": 1.1}, \"velocity\": 11}}\n",
            );
            stream.write_all(frames.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut settings = ClientSettings::new(&addr.to_string());
        settings.reconnect_initial = Duration::from_millis(50);
        settings.reconnect_max = Duration::from_millis(100);
        let mut client = TelemetryClient::new(settings);
        let mut session = TelemetrySession::new(SessionSettings::default(), 0.0);

        client
            .run(&mut session, time::sleep(Duration::from_millis(600)))
            .await
            .unwrap();

        let stats = session.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.connects, 1);
        assert!(!session.is_connected());
        assert!(session.log().entries().any(|e| e.message.starts_with("Disconnected")));
    }

    #[tokio::test]
    async fn test_binary_frame_keeps_link_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut frames = Vec::new();
            frames.extend_from_slice(b"{\"id\": 3, \"data\": {\"meta\": {\"timestampS\": 1.0}, \"velocity\": 10}}\n");
            frames.extend_from_slice(b"\xff\xfe garbage\n");
            frames.extend_from_slice(b"{\"id\": 3, \"data\": {\"meta\": {\"timestampS\": 1.1}, \"velocity\": 11}}\n");
            stream.write_all(&frames).await.unwrap();
            // Hold the connection open until the client shuts down
            time::sleep(Duration::from_secs(5)).await;
            drop(listener);
        });

        let mut client = TelemetryClient::new(ClientSettings::new(&addr.to_string()));
        let mut session = TelemetrySession::new(SessionSettings::default(), 0.0);

        client
            .run(&mut session, time::sleep(Duration::from_millis(400)))
            .await
            .unwrap();

        let stats = session.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.connects, 1);
        assert_eq!(session.charts().chart("velocity").unwrap().buffer(0).unwrap().len(), 2);
        assert!(!session.log().entries().any(|e| e.message.starts_with("Disconnected: stream")));
    }
}
