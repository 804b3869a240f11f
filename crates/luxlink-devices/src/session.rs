/*!
 * Device sessions: one managed TCP connection per physical device.
 *
 * A [`DeviceSession`] owns its connection exclusively and serializes all
 * exchanges through one lock, so at most one request is in flight per device
 * and responses can never be misattributed. Any I/O failure poisons the
 * connection: the handle is released immediately, availability flips false,
 * and reconnection is left to the discovery coordinator's health sweep.
 */
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use luxlink_core::config::SessionConfig;
use luxlink_core::types::DpState;

use crate::codec::Frame;
use crate::error::{DeviceError, Result};

/// Immutable identity of a device, known after a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Vendor-assigned device id
    pub device_id: String,
    /// Device type code (light, switch, plug, ...)
    pub device_type_code: u16,
    /// Product/model name
    pub model: String,
    /// Address the session talks to
    pub ip: IpAddr,
}

/// The connection halves, owned exclusively by the session
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One persistent connection to one device
#[derive(Debug)]
pub struct DeviceSession {
    ip: IpAddr,
    config: SessionConfig,
    /// Exclusive exchange guard: holding this lock is the only way to touch
    /// the connection, so exchanges are strictly serialized.
    conn: Mutex<Option<Connection>>,
    /// Monotonic sequence number generator, seeded from the wall clock so
    /// numbers stay unique across reconnects
    seq: AtomicU64,
    available: AtomicBool,
    identity: RwLock<Option<DeviceIdentity>>,
    state: RwLock<DpState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Create a session for an address. No I/O happens until [`connect`].
    ///
    /// [`connect`]: DeviceSession::connect
    pub fn new(ip: IpAddr, config: SessionConfig) -> Self {
        Self {
            ip,
            config,
            conn: Mutex::new(None),
            seq: AtomicU64::new(Utc::now().timestamp_millis() as u64),
            available: AtomicBool::new(false),
            identity: RwLock::new(None),
            state: RwLock::new(DpState::new()),
        }
    }

    /// Address this session talks to
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Whether the connection is open and the last operation succeeded
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Device identity, if the handshake has succeeded
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.read().ok().and_then(|g| g.clone())
    }

    /// Device id, if the handshake has succeeded
    pub fn device_id(&self) -> Option<String> {
        self.identity().map(|i| i.device_id)
    }

    /// Last-known data-point state (empty if never queried)
    pub fn last_state(&self) -> DpState {
        self.state.read().map(|g| g.clone()).unwrap_or_default()
    }

    fn next_sn(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Open the connection and perform the handshake.
    ///
    /// The handshake is an INFO exchange that yields the device identity,
    /// followed by a QUERY that seeds the last-known state. On any failure
    /// the socket is released, availability stays false and the error is
    /// returned; the caller decides whether to retry or discard.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;

        // Drop any previous connection before dialing a new one
        *guard = None;
        self.available.store(false, Ordering::SeqCst);

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let stream = timeout(connect_timeout, TcpStream::connect((self.ip, self.config.port)))
            .await
            .map_err(|_| DeviceError::Timeout(connect_timeout))??;

        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // Handshake: identity, then initial state. Failure drops `conn`.
        let response = self.exchange_on(&mut conn, &Frame::info(self.next_sn())).await?;
        let identity = self.parse_identity(&response)?;

        let response = self.exchange_on(&mut conn, &Frame::query(self.next_sn())).await?;
        let state = response.msg.data.unwrap_or_default();

        info!(
            ip = %self.ip,
            device_id = %identity.device_id,
            device_type = identity.device_type_code,
            "Connected to device"
        );

        if let Ok(mut g) = self.identity.write() {
            *g = Some(identity);
        }
        if let Ok(mut g) = self.state.write() {
            *g = state;
        }

        *guard = Some(conn);
        self.available.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Release the connection unconditionally. Idempotent.
    pub async fn disconnect(&self) {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            debug!(ip = %self.ip, "Disconnected from device");
        }
        self.available.store(false, Ordering::SeqCst);
    }

    /// Query the device's current data-point state.
    ///
    /// Updates the cached last-known state on success. Fails if not
    /// connected; any failure releases the connection.
    pub async fn query(&self) -> Result<DpState> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        let request = Frame::query(self.next_sn());
        match self.exchange_on(conn, &request).await {
            Ok(response) => {
                let data = response.msg.data.unwrap_or_default();
                if let Ok(mut g) = self.state.write() {
                    *g = data.clone();
                }
                Ok(data)
            }
            Err(e) => {
                self.poison(&mut guard, &e);
                Err(e)
            }
        }
    }

    /// Send a SET command carrying new data-point values.
    ///
    /// Fire-and-forget by default: a flushed write counts as success, and the
    /// call never blocks awaiting device-applied confirmation. With
    /// `control_await_ack` set, a correlated acknowledgment frame is awaited
    /// under the same retry budget as a query.
    pub async fn control(&self, payload: DpState) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        let request = Frame::set(self.next_sn(), payload);
        let result = if self.config.control_await_ack {
            self.exchange_on(conn, &request).await.map(|_| ())
        } else {
            self.send_on(conn, &request).await
        };

        if let Err(e) = result {
            self.poison(&mut guard, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Drop the connection after a failed operation
    fn poison(&self, guard: &mut Option<Connection>, error: &DeviceError) {
        warn!(ip = %self.ip, error = %error, "Connection failed, releasing handle");
        *guard = None;
        self.available.store(false, Ordering::SeqCst);
    }

    /// Write a frame without awaiting any response
    async fn send_on(&self, conn: &mut Connection, request: &Frame) -> Result<()> {
        conn.writer.write_all(&request.encode()).await?;
        conn.writer.flush().await?;
        Ok(())
    }

    /// Write a frame and await the response with a matching sequence number.
    ///
    /// Up to `read_attempts` attempts, each bounded by the read timeout.
    /// Frames with a stale sequence number are discarded within the same
    /// attempt budget; a decode failure or timeout exhausts the attempt.
    async fn exchange_on(&self, conn: &mut Connection, request: &Frame) -> Result<Frame> {
        self.send_on(conn, request).await?;

        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);
        let attempts = self.config.read_attempts;

        for attempt in 1..=attempts {
            let deadline = Instant::now() + read_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                let mut buf = Vec::new();
                match timeout(remaining, conn.reader.read_until(b'\n', &mut buf)).await {
                    Err(_) => break,
                    Ok(Ok(0)) => {
                        return Err(DeviceError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed by device",
                        )));
                    }
                    Ok(Ok(_)) => match Frame::decode(&buf) {
                        Ok(frame) if frame.sn == request.sn => return Ok(frame),
                        Ok(frame) => {
                            debug!(
                                ip = %self.ip,
                                expected = %request.sn,
                                got = %frame.sn,
                                "Discarding response with stale sequence number"
                            );
                        }
                        Err(e) => {
                            debug!(ip = %self.ip, attempt, error = %e, "Discarding undecodable frame");
                            break;
                        }
                    },
                    Ok(Err(e)) => return Err(e.into()),
                }
            }
        }

        Err(DeviceError::NoResponse { attempts })
    }

    /// Extract the device identity from an INFO response
    fn parse_identity(&self, response: &Frame) -> Result<DeviceIdentity> {
        let device_id = response
            .msg
            .did
            .clone()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| DeviceError::MalformedHandshake("missing device id".to_string()))?;

        let device_type_code = response
            .msg
            .dtp
            .as_deref()
            .ok_or_else(|| DeviceError::MalformedHandshake("missing device type".to_string()))?
            .trim()
            .parse::<u16>()
            .map_err(|_| {
                DeviceError::MalformedHandshake(format!(
                    "unparsable device type '{}'",
                    response.msg.dtp.as_deref().unwrap_or_default()
                ))
            })?;

        Ok(DeviceIdentity {
            device_id,
            device_type_code,
            model: response.msg.pid.clone().unwrap_or_default(),
            ip: self.ip,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    use crate::codec::{Body, Command};
    use luxlink_core::types::Value;

    /// How a mock device behaves per accepted connection
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum MockBehavior {
        /// Answer every request
        Normal,
        /// Answer the two handshake requests, then close the connection
        DropAfterHandshake,
        /// Close every accepted connection immediately
        CloseImmediately,
        /// Answer with a stale sequence number first, then correctly
        StaleFirst,
    }

    /// Spawn a mock device on a loopback port; serves until the test ends
    pub async fn spawn_mock_device(behavior: MockBehavior) -> SocketAddr {
        spawn_mock_device_with_id(behavior, "X", "1").await
    }

    pub async fn spawn_mock_device_with_id(
        behavior: MockBehavior,
        device_id: &str,
        dtp: &str,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device_id = device_id.to_string();
        let dtp = dtp.to_string();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if behavior == MockBehavior::CloseImmediately {
                    drop(stream);
                    continue;
                }
                let device_id = device_id.clone();
                let dtp = dtp.clone();
                tokio::spawn(async move {
                    serve_connection(stream, behavior, &device_id, &dtp).await;
                });
            }
        });

        addr
    }

    async fn serve_connection(stream: TcpStream, behavior: MockBehavior, did: &str, dtp: &str) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut served = 0u32;
        let mut sent_stale = false;

        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let Ok(request) = Frame::decode(&buf) else {
                return;
            };

            if behavior == MockBehavior::StaleFirst && !sent_stale {
                sent_stale = true;
                let mut stale = respond_to(&request, did, dtp);
                stale.sn = "999".to_string();
                if write_half.write_all(&stale.encode()).await.is_err() {
                    return;
                }
            }

            let response = respond_to(&request, did, dtp);
            if write_half.write_all(&response.encode()).await.is_err() {
                return;
            }
            let _ = write_half.flush().await;

            served += 1;
            if behavior == MockBehavior::DropAfterHandshake && served >= 2 {
                return;
            }
        }
    }

    fn respond_to(request: &Frame, did: &str, dtp: &str) -> Frame {
        let msg = match request.cmd {
            Command::Info => Body {
                did: Some(did.to_string()),
                dtp: Some(dtp.to_string()),
                pid: Some("lamp-mini".to_string()),
                ip: Some("127.0.0.1".to_string()),
                sv: Some("1.0.0".to_string()),
                ..Body::default()
            },
            Command::Query => {
                let mut data = DpState::new();
                data.insert(1, Value::Bool(true));
                data.insert(2, Value::Int(128));
                Body {
                    attr: Some(vec![1, 2]),
                    data: Some(data),
                    ..Body::default()
                }
            }
            Command::Set => Body::default(),
        };
        Frame {
            pv: 0,
            cmd: request.cmd,
            sn: request.sn.clone(),
            msg,
            res: Some(0),
        }
    }

    pub fn test_config(port: u16) -> SessionConfig {
        SessionConfig {
            port,
            connect_timeout_secs: 5,
            read_timeout_secs: 1,
            read_attempts: 3,
            control_await_ack: false,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_handshake_populates_identity_and_state() {
        let addr = spawn_mock_device(MockBehavior::Normal).await;
        let session = DeviceSession::new(addr.ip(), test_config(addr.port()));

        session.connect().await.unwrap();
        assert!(session.is_available());

        let identity = session.identity().unwrap();
        assert_eq!(identity.device_id, "X");
        assert_eq!(identity.device_type_code, 1);
        assert_eq!(identity.model, "lamp-mini");

        let state = session.last_state();
        assert_eq!(state.get(&1), Some(&Value::Bool(true)));
        assert_eq!(state.get(&2), Some(&Value::Int(128)));
    }

    #[test_log::test(tokio::test)]
    async fn test_query_when_disconnected_fails() {
        let session = DeviceSession::new("127.0.0.1".parse().unwrap(), test_config(1));
        let err = session.query().await.unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_sequence_numbers_are_discarded() {
        let addr = spawn_mock_device(MockBehavior::StaleFirst).await;
        let session = DeviceSession::new(addr.ip(), test_config(addr.port()));

        // The first response on the wire has sn "999"; connect must skip it
        // and still correlate the real handshake response.
        session.connect().await.unwrap();
        let state = session.query().await.unwrap();
        assert_eq!(state.get(&1), Some(&Value::Bool(true)));
    }

    #[test_log::test(tokio::test)]
    async fn test_control_is_fire_and_forget() {
        let addr = spawn_mock_device(MockBehavior::Normal).await;
        let session = DeviceSession::new(addr.ip(), test_config(addr.port()));
        session.connect().await.unwrap();

        let mut payload = DpState::new();
        payload.insert(1, Value::Bool(false));
        session.control(payload).await.unwrap();
        assert!(session.is_available());
    }

    #[test_log::test(tokio::test)]
    async fn test_control_with_ack() {
        let addr = spawn_mock_device(MockBehavior::Normal).await;
        let mut config = test_config(addr.port());
        config.control_await_ack = true;
        let session = DeviceSession::new(addr.ip(), config);
        session.connect().await.unwrap();

        let mut payload = DpState::new();
        payload.insert(2, Value::Int(64));
        session.control(payload).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_failure_releases_handle_and_clears_availability() {
        let addr = spawn_mock_device(MockBehavior::DropAfterHandshake).await;
        let session = DeviceSession::new(addr.ip(), test_config(addr.port()));
        session.connect().await.unwrap();
        assert!(session.is_available());

        // The mock closed the connection after the handshake, so the next
        // exchange hits EOF.
        let err = session.query().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!session.is_available());

        // Handle was released: further calls report NotConnected
        let err = session.query().await.unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
    }

    #[test_log::test(tokio::test)]
    async fn test_repeated_failed_connects_do_not_leak() {
        let addr = spawn_mock_device(MockBehavior::CloseImmediately).await;
        let session = DeviceSession::new(addr.ip(), test_config(addr.port()));

        for _ in 0..100 {
            assert!(session.connect().await.is_err());
            assert!(!session.is_available());
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_exchanges_are_serialized() {
        let addr = spawn_mock_device(MockBehavior::Normal).await;
        let session = Arc::new(DeviceSession::new(addr.ip(), test_config(addr.port())));
        session.connect().await.unwrap();

        // The mock reads one frame at a time per connection; interleaved
        // writes from concurrent exchanges would desynchronize it.
        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(async move { session.query().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(session.is_available());
    }

    #[test_log::test(tokio::test)]
    async fn test_connect_refused() {
        // Bind then drop a listener to get a port with nothing behind it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = DeviceSession::new(addr.ip(), test_config(addr.port()));
        let err = session.connect().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!session.is_available());
        assert!(session.identity().is_none());
    }
}
