//! MQTT transport on top of `rumqttc`.
//!
//! `rumqttc` only makes progress while its `EventLoop` is polled. During
//! startup [`MqttTransport::connect`] polls it directly so it can bound the
//! wait for CONNACK/SUBACK and retry with backoff. Once the subscription is
//! acknowledged the event loop moves to a background task that feeds inbound
//! publishes to the [`InboundHandler`] and re-subscribes after reconnects.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ConnectError, InboundHandler, Transport, TransportError};
use crate::{
    backoff::Backoff,
    state::{ConnectionState, StateTracker},
};

/// Capacity of the request channel between `AsyncClient` and `EventLoop`.
const REQUEST_CAPACITY: usize = 16;

const QOS: QoS = QoS::AtMostOnce;

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
    /// Total connection attempts at startup, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on a single attempt: TCP connect, CONNACK and SUBACK.
    pub ack_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("weather-broadcaster-{}", std::process::id()),
            topic: topic.into(),
            keep_alive: Duration::from_secs(60),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            ack_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }

    fn connect_backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff, 2.0)
            .with_max_retries(self.max_attempts.saturating_sub(1))
    }

    fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff, 2.0)
    }
}

/// Why a single startup attempt did not reach the subscribed state.
enum AttemptError {
    Retry(String),
    Fatal(ConnectError),
}

impl From<ConnectionError> for AttemptError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => {
                AttemptError::Fatal(ConnectError::Refused(format!("{code:?}")))
            }
            other => AttemptError::Retry(other.to_string()),
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    topic: String,
    states: StateTracker,
    closing: CancellationToken,
    driver: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field("topic", &self.topic)
            .field("state", &self.states.current())
            .finish_non_exhaustive()
    }
}

impl MqttTransport {
    /// Connects, subscribes to `settings.topic` and starts the background
    /// event loop.
    ///
    /// Each attempt is bounded by `ack_timeout`; failed attempts are retried
    /// with exponential backoff until `max_attempts` is used up. A broker that
    /// refuses the connection outright is not retried.
    pub async fn connect(
        settings: &MqttSettings,
        handler: Arc<dyn InboundHandler>,
        states: StateTracker,
        cancel: &CancellationToken,
    ) -> Result<Self, ConnectError> {
        let (client, mut event_loop) = AsyncClient::new(settings.options(), REQUEST_CAPACITY);
        let mut backoff = settings.connect_backoff();
        let mut attempts = 0;

        info!(
            host = %settings.host,
            port = settings.port,
            topic = %settings.topic,
            "connecting to broker"
        );

        loop {
            attempts += 1;
            states.set(ConnectionState::Connecting);

            let attempt = tokio::time::timeout(
                settings.ack_timeout,
                establish(&mut event_loop, &client, &settings.topic, &*handler, &states),
            );

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    states.set(ConnectionState::Disconnected);
                    return Err(ConnectError::Cancelled);
                }
                outcome = attempt => outcome,
            };

            let failure = match outcome {
                Ok(Ok(())) => break,
                Ok(Err(AttemptError::Fatal(err))) => {
                    states.set(ConnectionState::Disconnected);
                    return Err(err);
                }
                Ok(Err(AttemptError::Retry(reason))) => reason,
                Err(_) => format!(
                    "no acknowledgement from broker within {:.1}s",
                    settings.ack_timeout.as_secs_f64()
                ),
            };

            states.set(ConnectionState::Disconnected);
            let delay = backoff
                .next_sleep()
                .map_err(|source| ConnectError::Exhausted {
                    attempts,
                    last: failure.clone(),
                    source,
                })?;

            warn!(
                attempt = attempts,
                error = %failure,
                "broker connection failed, retrying in {:.1}s",
                delay.as_secs_f64()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        states.set(ConnectionState::Ready);
        info!(attempts, "subscribed to '{}'", settings.topic);

        let closing = CancellationToken::new();
        let driver = tokio::spawn(drive(
            event_loop,
            client.clone(),
            settings.topic.clone(),
            handler,
            states.clone(),
            closing.clone(),
            settings.reconnect_backoff(),
        ));

        Ok(Self {
            client,
            topic: settings.topic.clone(),
            states,
            closing,
            driver,
            shutdown_grace: settings.shutdown_grace,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.states.current()
    }

    /// Sends DISCONNECT and waits for the background event loop to finish.
    ///
    /// The task is aborted if it does not stop within the shutdown grace
    /// period (e.g. while stuck on an unreachable broker).
    pub async fn shutdown(self) {
        let Self {
            client,
            states,
            closing,
            mut driver,
            shutdown_grace,
            ..
        } = self;

        states.set(ConnectionState::Stopping);
        closing.cancel();

        if let Err(err) = client.try_disconnect() {
            debug!(error = %err, "disconnect request was not queued");
        }

        match tokio::time::timeout(shutdown_grace, &mut driver).await {
            Ok(Ok(())) => debug!("event loop stopped"),
            Ok(Err(err)) => warn!(error = %err, "event loop task failed"),
            Err(_) => {
                warn!(
                    "event loop did not stop within {:.1}s, aborting it",
                    shutdown_grace.as_secs_f64()
                );
                driver.abort();
            }
        }

        states.set(ConnectionState::Terminated);
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.closing.is_cancelled() {
            return Err(TransportError::Closed);
        }

        // try_publish never waits on a full request queue, so a stalled
        // connection surfaces here as an error instead of blocking the caller.
        self.client.try_publish(topic, QOS, false, payload.to_vec())?;
        trace!(topic, bytes = payload.len(), "publish queued");
        Ok(())
    }
}

/// Polls until the connection is up and the subscription acknowledged.
async fn establish(
    event_loop: &mut EventLoop,
    client: &AsyncClient,
    topic: &str,
    handler: &dyn InboundHandler,
    states: &StateTracker,
) -> Result<(), AttemptError> {
    loop {
        match event_loop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                debug!(session_present = ack.session_present, "connection accepted");
                states.set(ConnectionState::WaitingForAck);
                client.try_subscribe(topic, QOS).map_err(|source| {
                    AttemptError::Fatal(ConnectError::Subscribe {
                        topic: topic.to_owned(),
                        source,
                    })
                })?;
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(AttemptError::Fatal(ConnectError::Refused(format!(
                        "subscription to '{topic}' rejected"
                    ))));
                }
                return Ok(());
            }
            Event::Incoming(Packet::Publish(publish)) => {
                handler.on_message(&publish.topic, &publish.payload);
            }
            event => trace!(?event, "startup event"),
        }
    }
}

/// Background event loop: delivers inbound publishes and keeps the session
/// alive until [`MqttTransport::shutdown`].
async fn drive(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topic: String,
    handler: Arc<dyn InboundHandler>,
    states: StateTracker,
    closing: CancellationToken,
    mut backoff: Backoff,
) {
    debug!("event loop started");

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "inbound publish");
                handler.on_message(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("reconnected to broker");
                backoff.reset();
                states.set(ConnectionState::WaitingForAck);
                if let Err(err) = client.try_subscribe(&topic, QOS) {
                    warn!(error = %err, "failed to renew subscription to '{topic}'");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                states.set(ConnectionState::Ready);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent");
                break;
            }
            Ok(event) => trace!(?event, "mqtt event"),
            Err(err) => {
                if closing.is_cancelled() {
                    debug!(error = %err, "event loop closed during shutdown");
                    break;
                }

                states.set(ConnectionState::Connecting);
                let delay = backoff.next_sleep().unwrap_or(Duration::from_secs(1));
                warn!(
                    error = %err,
                    "lost broker connection, reconnecting in {:.1}s",
                    delay.as_secs_f64()
                );

                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Broadcaster, CityTable};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::oneshot,
    };

    const CONNECT: u8 = 0x10;
    const CONNACK: [u8; 4] = [0x20, 2, 0, 0];
    const SUBSCRIBE: u8 = 0x82;
    const PUBLISH: u8 = 0x30;
    const DISCONNECT: u8 = 0xE0;

    /// Reads one packet as (fixed header byte, body). `None` on EOF.
    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;

        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    /// Accepts one client and acknowledges its CONNECT and SUBSCRIBE.
    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.expect("accept");

        let (header, _) = read_packet(&mut stream).await.expect("connect packet");
        assert_eq!(header, CONNECT);
        stream.write_all(&CONNACK).await.expect("write connack");

        loop {
            let (header, body) = read_packet(&mut stream).await.expect("subscribe packet");
            if header == SUBSCRIBE {
                // SUBACK echoes the packet id and grants QoS 0
                let suback = [0x90, 3, body[0], body[1], 0];
                stream.write_all(&suback).await.expect("write suback");
                return stream;
            }
        }
    }

    /// Packets the client sent, up to and including DISCONNECT.
    async fn read_until_disconnect(stream: &mut TcpStream) -> Vec<(u8, Vec<u8>)> {
        let mut packets = Vec::new();
        while let Some((header, body)) = read_packet(stream).await {
            packets.push((header, body));
            if header == DISCONNECT {
                break;
            }
        }
        packets
    }

    /// QoS 0 PUBLISH, small enough for a one-byte remaining length.
    fn publish_packet(topic: &str, payload: &str) -> Vec<u8> {
        let len = 2 + topic.len() + payload.len();
        assert!(len < 128);

        let mut packet = vec![PUBLISH, len as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload.as_bytes());
        packet
    }

    fn split_publish(body: &[u8]) -> (String, String) {
        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        let (topic, payload) = body[2..].split_at(topic_len);
        (
            String::from_utf8_lossy(topic).into_owned(),
            String::from_utf8_lossy(payload).into_owned(),
        )
    }

    fn local_settings(port: u16) -> MqttSettings {
        let mut settings = MqttSettings::new("127.0.0.1", port, "test");
        settings.client_id = "weather-test".into();
        settings.max_attempts = 1;
        settings.initial_backoff = Duration::from_millis(10);
        settings.max_backoff = Duration::from_millis(50);
        settings.ack_timeout = Duration::from_secs(2);
        settings
    }

    #[test]
    fn settings_defaults() {
        let settings = MqttSettings::new("broker.hivemq.com", 1883, "test");

        assert_eq!(settings.host, "broker.hivemq.com");
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.topic, "test");
        assert!(settings.client_id.starts_with("weather-broadcaster-"));
        assert_eq!(settings.max_attempts, 5);
    }

    #[test]
    fn connect_backoff_allows_max_attempts_in_total() {
        let mut settings = MqttSettings::new("localhost", 1883, "test");
        settings.max_attempts = 3;

        let mut backoff = settings.connect_backoff();

        // first attempt is free, two retries follow
        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_err());
    }

    #[test]
    fn refused_connection_is_fatal() {
        let err = ConnectionError::ConnectionRefused(rumqttc::ConnectReturnCode::NotAuthorized);
        assert!(matches!(
            AttemptError::from(err),
            AttemptError::Fatal(ConnectError::Refused(_))
        ));
    }

    #[test]
    fn network_timeout_is_retried() {
        assert!(matches!(
            AttemptError::from(ConnectionError::NetworkTimeout),
            AttemptError::Retry(_)
        ));
    }

    #[tokio::test]
    async fn exhausts_attempts_against_closed_port() {
        // Bind then drop a listener to get a local port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };

        let mut settings = MqttSettings::new("127.0.0.1", port, "test");
        settings.max_attempts = 2;
        settings.initial_backoff = Duration::from_millis(10);
        settings.max_backoff = Duration::from_millis(20);
        settings.ack_timeout = Duration::from_secs(2);

        let states = StateTracker::new();
        let err = MqttTransport::connect(
            &settings,
            Arc::new(crate::transport::IgnoreInbound),
            states.clone(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("nothing listens on the port");

        assert!(
            matches!(err, ConnectError::Exhausted { attempts: 2, .. }),
            "unexpected error: {err}"
        );
        assert_eq!(states.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_before_connecting() {
        let settings = MqttSettings::new("127.0.0.1", 1, "test");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = MqttTransport::connect(
            &settings,
            Arc::new(crate::transport::IgnoreInbound),
            StateTracker::new(),
            &cancel,
        )
        .await
        .expect_err("cancelled");

        assert!(matches!(err, ConnectError::Cancelled));
    }

    #[tokio::test]
    async fn session_relays_commands_and_publishes_until_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let broker = tokio::spawn(async move {
            let mut stream = accept_session(&listener).await;
            stream
                .write_all(&publish_packet("test", "[CITY] Paris"))
                .await
                .expect("write publish");
            read_until_disconnect(&mut stream).await
        });

        let broadcaster = Arc::new(Broadcaster::new(CityTable::builtin()));
        let states = StateTracker::new();
        let transport = MqttTransport::connect(
            &local_settings(port),
            broadcaster.clone(),
            states.clone(),
            &CancellationToken::new(),
        )
        .await
        .expect("broker accepts");

        assert_eq!(transport.state(), ConnectionState::Ready);

        tokio::time::timeout(Duration::from_secs(2), async {
            while broadcaster.selected_city() != "Paris" {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("[CITY] command reaches the broadcaster");

        assert_eq!(broadcaster.publish_tick(&transport, "test").await, 2);

        transport.shutdown().await;
        assert_eq!(states.current(), ConnectionState::Terminated);

        let packets = tokio::time::timeout(Duration::from_secs(2), broker)
            .await
            .expect("broker sees the session end")
            .expect("broker task");

        let published: Vec<_> = packets
            .iter()
            .filter(|(header, _)| *header == PUBLISH)
            .map(|(_, body)| split_publish(body))
            .collect();
        assert_eq!(
            published,
            [
                ("test".to_string(), "[DATA] 32.7 C,23.4 %,99.7 %\n".to_string()),
                ("test".to_string(), "[CITIES] Brno,London,Paris\n".to_string()),
            ]
        );
        assert_eq!(packets.last().map(|(header, _)| *header), Some(DISCONNECT));
    }

    #[tokio::test]
    async fn resubscribes_after_broker_drops_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (resubscribed_tx, resubscribed_rx) = oneshot::channel();

        let broker = tokio::spawn(async move {
            drop(accept_session(&listener).await);

            // accept_session only returns once SUBSCRIBE arrived again
            let mut stream = accept_session(&listener).await;
            resubscribed_tx.send(()).ok();
            read_until_disconnect(&mut stream).await
        });

        let states = StateTracker::new();
        let transport = MqttTransport::connect(
            &local_settings(port),
            Arc::new(crate::transport::IgnoreInbound),
            states.clone(),
            &CancellationToken::new(),
        )
        .await
        .expect("broker accepts");

        tokio::time::timeout(Duration::from_secs(5), resubscribed_rx)
            .await
            .expect("client reconnects")
            .expect("broker task alive");

        let mut rx = states.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|state| *state == ConnectionState::Ready),
        )
        .await
        .expect("ready again after SUBACK")
        .expect("state channel open");

        transport.shutdown().await;
        assert_eq!(states.current(), ConnectionState::Terminated);

        let packets = tokio::time::timeout(Duration::from_secs(2), broker)
            .await
            .expect("broker sees the session end")
            .expect("broker task");
        assert_eq!(packets.last().map(|(header, _)| *header), Some(DISCONNECT));
    }
}
