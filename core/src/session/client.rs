use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::interface::{SessionConfig, SessionMetadata, StreamEvent, SweepFrame, PROTOCOL_VERSION};
use crate::prelude::FrameSource;
use crate::protocol::{
    encode, Command, ErrorCode, FrameBuffer, Message, ProtocolError, Response, ServerInfo, StreamData,
};
use crate::session::cancel::CancelHandle;
use crate::session::sequence::{SequenceCheck, SequenceTracker, TickUnwrapper};
use crate::session::{SessionError, SessionState};
use crate::telemetry::{LogManager, MetricsRecorder};
use crate::transport::{is_timeout, Transport};

const READ_CHUNK: usize = 16 * 1024;

/// Timing knobs of a session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub stop_drain_timeout: Duration,
    /// Upper bound on how long a blocked read goes without checking for cancellation.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(3),
            stop_drain_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// One logical session with a module server over transport `T`.
///
/// The client owns the transport for its whole life and closes it exactly
/// once, on `close()` or when dropped. It never reconnects on its own; after
/// `ConnectionLost` the caller decides whether to `connect()` again.
pub struct Client<T: Transport> {
    transport: T,
    config: ClientConfig,
    state: SessionState,
    open: bool,
    buffer: FrameBuffer,
    read_buf: Vec<u8>,
    server: Option<ServerInfo>,
    metadata: Option<SessionMetadata>,
    command_timeout: Duration,
    sequences: SequenceTracker,
    ticks: TickUnwrapper,
    pending: VecDeque<StreamEvent>,
    cancel: CancelHandle,
    metrics: Arc<MetricsRecorder>,
    logger: LogManager,
    reported_resyncs: u64,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        let command_timeout = config.command_timeout;
        Self {
            transport,
            config,
            state: SessionState::Disconnected,
            open: false,
            buffer: FrameBuffer::new(),
            read_buf: vec![0; READ_CHUNK],
            server: None,
            metadata: None,
            command_timeout,
            sequences: SequenceTracker::new(),
            ticks: TickUnwrapper::new(),
            pending: VecDeque::new(),
            cancel: CancelHandle::new(),
            metrics: Arc::new(MetricsRecorder::new()),
            logger: LogManager::new("session"),
            reported_resyncs: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    pub fn session_metadata(&self) -> Option<&SessionMetadata> {
        self.metadata.as_ref()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    /// Opens the transport and performs the version handshake.
    pub fn connect(&mut self) -> Result<&ServerInfo, SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(self.invalid("connect"));
        }
        self.cancel.clear();
        self.state = SessionState::Connecting;
        self.buffer.clear();
        self.reported_resyncs = 0;

        if let Err(err) = self.transport.open(self.config.connect_timeout) {
            self.state = SessionState::Disconnected;
            return Err(SessionError::Connection(format!(
                "opening {}: {}",
                self.transport.describe(),
                err
            )));
        }
        self.open = true;

        let hello = Command::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        let reply = match self.command(&hello, self.config.connect_timeout) {
            Ok(reply) => reply,
            Err(SessionError::Timeout(_)) => {
                return Err(self.fail_connect("handshake timed out".into()));
            }
            Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
            Err(err) => return Err(self.fail_connect(err.to_string())),
        };

        let info = match reply {
            Message::Response(Response::Hello(info)) => info,
            Message::Error(error) => {
                return Err(self.fail_connect(format!("server refused hello: {}", error.message)))
            }
            other => return Err(self.fail_connect(format!("unexpected handshake reply {:?}", other))),
        };
        if info.protocol_version != PROTOCOL_VERSION {
            return Err(self.fail_connect(format!(
                "protocol version mismatch: server speaks {}, client {}",
                info.protocol_version, PROTOCOL_VERSION
            )));
        }

        self.logger.record(&format!(
            "connected to {} (server {}, sensors {:?})",
            self.transport.describe(),
            info.server_version,
            info.sensors
        ));
        self.state = SessionState::Idle;
        Ok(self.server.insert(info))
    }

    /// Sends a configuration and returns the negotiated session metadata.
    pub fn configure(
        &mut self,
        config: impl Into<SessionConfig>,
    ) -> Result<&SessionMetadata, SessionError> {
        if !matches!(self.state, SessionState::Idle | SessionState::Configured) {
            return Err(self.invalid("configure"));
        }
        let config = config.into();
        config
            .validate()
            .map_err(|err| SessionError::ConfigRejected(err.to_string()))?;
        if let Some(info) = &self.server {
            if let Some(missing) = config.sensor_ids.iter().find(|id| !info.sensors.contains(*id)) {
                return Err(SessionError::ConfigRejected(format!(
                    "sensor {} is not attached to the module",
                    missing
                )));
            }
        }

        self.metadata = None;
        self.state = SessionState::Idle;
        let reply = self.command(&Command::Configure { config }, self.command_timeout)?;
        let metadata = match reply {
            Message::ConfigAck(metadata) => metadata,
            Message::Error(error) if error.code == ErrorCode::InvalidConfig => {
                return Err(SessionError::ConfigRejected(error.message))
            }
            Message::Error(error) => return Err(SessionError::Server(error)),
            other => return Err(unexpected("configure", &other)),
        };
        if metadata.protocol_version != PROTOCOL_VERSION {
            return Err(SessionError::Protocol(ProtocolError::Malformed(format!(
                "config ack carries protocol version {}",
                metadata.protocol_version
            ))));
        }

        self.command_timeout = raised_timeout(self.config.command_timeout, metadata.update_rate);
        self.logger.record(&format!(
            "configured sensors {:?} at {:.2} Hz",
            metadata.config.sensor_ids, metadata.update_rate
        ));
        self.state = SessionState::Configured;
        Ok(self.metadata.insert(metadata))
    }

    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Configured {
            return Err(self.invalid("start"));
        }
        match self.command(&Command::Start, self.command_timeout)? {
            Message::Response(Response::Ok) => {}
            Message::Error(error) => return Err(SessionError::Server(error)),
            other => return Err(unexpected("start", &other)),
        }
        self.sequences.reset();
        self.ticks.reset();
        self.pending.clear();
        self.state = SessionState::Streaming;
        self.logger.record("streaming started");
        Ok(())
    }

    /// Waits up to `timeout` for the next stream event.
    ///
    /// A sequence gap yields `DroppedFrames` first; the frame that revealed
    /// the gap is returned by the following call.
    pub fn next_frame(&mut self, timeout: Duration) -> Result<StreamEvent, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        if self.state != SessionState::Streaming {
            return Err(self.invalid("next_frame"));
        }
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let message = self.receive(deadline, "stream data")?;
            match message {
                Message::StreamData(data) => {
                    let frame = self.build_frame(data)?;
                    if frame.context.has_warnings() {
                        debug!(
                            "sensor {} frame {}: {:?}",
                            frame.sensor_id, frame.sequence, frame.context
                        );
                    }
                    match self.sequences.observe(frame.sensor_id, frame.sequence) {
                        SequenceCheck::First | SequenceCheck::InOrder => {
                            self.metrics.record_frame();
                            self.metrics.record_context(&frame.context);
                            return Ok(StreamEvent::Frame(frame));
                        }
                        SequenceCheck::Gap(count) => {
                            warn!(
                                "sensor {}: {} frames dropped before sequence {}",
                                frame.sensor_id, count, frame.sequence
                            );
                            self.metrics.record_dropped(count);
                            self.metrics.record_frame();
                            self.metrics.record_context(&frame.context);
                            let sensor_id = frame.sensor_id;
                            self.pending.push_back(StreamEvent::Frame(frame));
                            return Ok(StreamEvent::DroppedFrames { sensor_id, count });
                        }
                        SequenceCheck::Stale { last } => {
                            warn!(
                                "sensor {}: discarding sequence {} (last was {})",
                                frame.sensor_id, frame.sequence, last
                            );
                            self.metrics.record_error();
                        }
                    }
                }
                Message::Error(error) => {
                    self.logger
                        .anomaly(&format!("server stopped streaming: {}", error.message));
                    self.state = SessionState::Configured;
                    return Err(SessionError::Server(error));
                }
                other => debug!("ignoring {:?} while streaming", other),
            }
        }
    }

    /// Stops streaming and returns to idle. Calling it again, or when the
    /// server already stopped, is not an error.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected | SessionState::Idle => return Ok(()),
            SessionState::Configured => {
                self.state = SessionState::Idle;
                return Ok(());
            }
            SessionState::Streaming => {}
            SessionState::Connecting | SessionState::Stopping => return Err(self.invalid("stop")),
        }

        self.state = SessionState::Stopping;
        self.pending.clear();
        match self.command(&Command::Stop, self.config.stop_drain_timeout.max(self.command_timeout)) {
            Ok(Message::Response(Response::Ok)) => {}
            Ok(Message::Error(error)) if error.code == ErrorCode::NotStreaming => {
                debug!("server had already stopped: {}", error.message);
            }
            Ok(Message::Error(error)) => {
                self.state = SessionState::Idle;
                return Err(SessionError::Server(error));
            }
            Ok(other) => {
                self.state = SessionState::Idle;
                return Err(unexpected("stop", &other));
            }
            Err(SessionError::Timeout(what)) => {
                self.close();
                return Err(SessionError::Timeout(what));
            }
            Err(err) => {
                if self.state == SessionState::Stopping {
                    self.state = SessionState::Idle;
                }
                return Err(err);
            }
        }
        self.state = SessionState::Idle;
        self.logger.record("streaming stopped");
        Ok(())
    }

    /// Releases the transport. Valid from any state.
    pub fn close(&mut self) {
        if self.open {
            if self.state == SessionState::Streaming {
                if let Ok(frame) = Message::Command(Command::Stop).to_frame() {
                    let _ = self.transport.write_all(&encode(&frame));
                }
            }
            self.transport.close();
            self.open = false;
            self.logger
                .record(&format!("closed {}", self.transport.describe()));
        }
        self.state = SessionState::Disconnected;
        self.metadata = None;
        self.pending.clear();
        self.buffer.clear();
    }

    fn build_frame(&mut self, data: StreamData) -> Result<SweepFrame, SessionError> {
        let metadata = self.metadata.as_ref().ok_or_else(|| {
            SessionError::Protocol(ProtocolError::Malformed("stream data before config ack".into()))
        })?;
        let layout = metadata.layout_for(data.sensor_id).ok_or_else(|| {
            SessionError::Protocol(ProtocolError::Malformed(format!(
                "stream data for unconfigured sensor {}",
                data.sensor_id
            )))
        })?;
        if data.samples.len() != layout.frame_data_length() {
            self.metrics.record_error();
            return Err(SessionError::Protocol(ProtocolError::Malformed(format!(
                "sensor {} frame has {} samples, layout expects {}",
                data.sensor_id,
                data.samples.len(),
                layout.frame_data_length()
            ))));
        }

        let tick = self.ticks.unwrap_tick(data.tick);
        Ok(SweepFrame {
            sensor_id: data.sensor_id,
            sequence: data.sequence,
            tick,
            timestamp_us: metadata.tick_to_us(tick),
            sweeps_per_frame: layout.sweeps_per_frame,
            sweep_len: layout.sweep_data_length,
            samples: data.samples,
            context: data.context,
        })
    }

    fn command(&mut self, command: &Command, timeout: Duration) -> Result<Message, SessionError> {
        self.send(command)?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.receive(deadline, "command reply")? {
                Message::StreamData(data) => {
                    debug!("draining in-flight frame {} of sensor {}", data.sequence, data.sensor_id)
                }
                reply => return Ok(reply),
            }
        }
    }

    fn send(&mut self, command: &Command) -> Result<(), SessionError> {
        let frame = Message::Command(command.clone()).to_frame()?;
        if let Err(err) = self.transport.write_all(&encode(&frame)) {
            return Err(self.lose(format!("write failed: {}", err)));
        }
        Ok(())
    }

    /// Next non-heartbeat message, polling the transport in slices of
    /// `poll_interval` so cancellation is noticed promptly.
    fn receive(&mut self, deadline: Instant, waiting_for: &str) -> Result<Message, SessionError> {
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                self.report_resyncs();
                match Message::from_frame(&frame) {
                    Ok(Message::Heartbeat) => continue,
                    Ok(message) => return Ok(message),
                    Err(err) => {
                        self.metrics.record_error();
                        return Err(SessionError::Protocol(err));
                    }
                }
            }
            self.report_resyncs();

            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout(waiting_for.to_string()));
            }
            let wait = (deadline - now).min(self.config.poll_interval);

            match self.transport.read(&mut self.read_buf, wait) {
                Ok(0) => return Err(self.lose("peer closed the connection".into())),
                Ok(n) => self.buffer.extend(&self.read_buf[..n]),
                Err(err) if is_timeout(&err) => {}
                Err(err) => return Err(self.lose(format!("read failed: {}", err))),
            }
        }
    }

    fn report_resyncs(&mut self) {
        let total = self.buffer.resyncs();
        if total > self.reported_resyncs {
            self.metrics.record_resyncs(total - self.reported_resyncs);
            self.reported_resyncs = total;
        }
    }

    fn lose(&mut self, reason: String) -> SessionError {
        self.logger.anomaly(&format!("connection lost: {}", reason));
        self.metrics.record_error();
        self.close();
        SessionError::ConnectionLost(reason)
    }

    fn fail_connect(&mut self, reason: String) -> SessionError {
        self.close();
        SessionError::Connection(reason)
    }

    fn cancelled(&mut self) -> SessionError {
        self.logger.record("session cancelled");
        self.close();
        SessionError::Cancelled
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

impl<T: Transport> FrameSource for Client<T> {
    fn metadata(&self) -> Option<&SessionMetadata> {
        self.metadata.as_ref()
    }

    fn next_event(&mut self, timeout: Duration) -> crate::Result<StreamEvent> {
        Ok(self.next_frame(timeout)?)
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected(operation: &str, message: &Message) -> SessionError {
    SessionError::Protocol(ProtocolError::Malformed(format!(
        "unexpected reply to {}: {:?}",
        operation, message
    )))
}

/// Slow update rates need a longer wait than the default command timeout.
fn raised_timeout(default: Duration, update_rate: f32) -> Duration {
    if !(update_rate > 0.0) {
        return default;
    }
    Duration::try_from_secs_f32(1.1 / update_rate + 0.5)
        .unwrap_or(Duration::from_secs(3600))
        .max(default)
}
