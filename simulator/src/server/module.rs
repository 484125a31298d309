use crate::generator::{SceneConfig, SweepGenerator};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};
use sweepcore::interface::{
    FrameContext, FrameLayout, SensorId, SessionConfig, SessionMetadata, PROTOCOL_VERSION,
};
use sweepcore::protocol::{
    encode, Command, ErrorCode, FrameBuffer, Message, Response, ServerError, ServerInfo, StreamData,
};
use sweepcore::telemetry::LogManager;
use sweepcore::transport::{is_timeout, MemoryTransport, TcpTransport, Transport};

pub const TICKS_PER_SECOND: u64 = 1_000_000;
const SERVER_VERSION: &str = concat!("sweepsim ", env!("CARGO_PKG_VERSION"));
const IDLE_POLL: Duration = Duration::from_millis(50);
/// Temperature change since configuration after which frames ask for a new calibration.
const CALIBRATION_DRIFT_C: i16 = 15;

/// Behaviour of the synthetic module server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerOptions {
    pub sensors: Vec<SensorId>,
    /// Pace frames at the update rate; otherwise emit them back to back.
    pub realtime: bool,
    /// Every n-th frame of each sensor is generated but never sent.
    pub drop_every: Option<u32>,
    /// Stop emitting after this many frames, while staying in the streaming state.
    pub max_frames: Option<u64>,
    pub heartbeat_interval_ms: u64,
    pub scene: SceneConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            sensors: vec![SensorId::new(1)],
            realtime: true,
            drop_every: None,
            max_frames: None,
            heartbeat_interval_ms: 1000,
            scene: SceneConfig::default(),
        }
    }
}

struct ActiveSession {
    metadata: SessionMetadata,
    generators: Vec<(SensorId, SweepGenerator)>,
    configured_temperature: i16,
}

enum Poll {
    Command(Command),
    Idle,
    Closed,
}

/// Speaks the module-server side of the wire protocol over any transport,
/// serving sweeps generated from a synthetic scene.
pub struct ModuleServer<T: Transport> {
    transport: T,
    options: ServerOptions,
    buffer: FrameBuffer,
    read_buf: Vec<u8>,
    session: Option<ActiveSession>,
    streaming: bool,
    frames_emitted: u64,
    next_frame_at: Instant,
    last_sent: Instant,
    logger: LogManager,
}

impl<T: Transport> ModuleServer<T> {
    pub fn new(transport: T, options: ServerOptions) -> Self {
        Self {
            transport,
            options,
            buffer: FrameBuffer::new(),
            read_buf: vec![0; 4096],
            session: None,
            streaming: false,
            frames_emitted: 0,
            next_frame_at: Instant::now(),
            last_sent: Instant::now(),
            logger: LogManager::new("module-server"),
        }
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: PROTOCOL_VERSION,
            server_version: SERVER_VERSION.to_string(),
            sensors: self.options.sensors.clone(),
            ticks_per_second: TICKS_PER_SECOND,
        }
    }

    /// Serves until the host closes the channel.
    pub fn run(mut self) -> anyhow::Result<()> {
        self.transport
            .open(Duration::from_secs(1))
            .context("opening server transport")?;
        self.logger
            .record(&format!("serving on {}", self.transport.describe()));
        loop {
            match self.poll_command(self.wait_budget())? {
                Poll::Command(command) => {
                    let reply = self.handle(command);
                    self.send(&reply)?;
                }
                Poll::Closed => break,
                Poll::Idle => {}
            }
            if self.frame_due() {
                self.emit_frame()?;
            }
            let heartbeat = Duration::from_millis(self.options.heartbeat_interval_ms);
            if !heartbeat.is_zero() && self.last_sent.elapsed() >= heartbeat {
                self.send(&Message::Heartbeat)?;
            }
        }
        self.transport.close();
        self.logger.record("host closed the channel");
        Ok(())
    }

    fn wait_budget(&self) -> Duration {
        if !self.streaming || self.exhausted() {
            return IDLE_POLL;
        }
        if self.options.realtime {
            self.next_frame_at
                .saturating_duration_since(Instant::now())
                .min(IDLE_POLL)
        } else {
            Duration::ZERO
        }
    }

    fn exhausted(&self) -> bool {
        self.options
            .max_frames
            .map_or(false, |max| self.frames_emitted >= max)
    }

    fn frame_due(&self) -> bool {
        self.streaming
            && !self.exhausted()
            && (!self.options.realtime || Instant::now() >= self.next_frame_at)
    }

    fn poll_command(&mut self, timeout: Duration) -> anyhow::Result<Poll> {
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                match Message::from_frame(&frame) {
                    Ok(Message::Command(command)) => return Ok(Poll::Command(command)),
                    Ok(other) => {
                        self.logger
                            .anomaly(&format!("ignoring {:?} from host", other));
                        continue;
                    }
                    Err(err) => {
                        self.logger.anomaly(&format!("bad frame from host: {}", err));
                        continue;
                    }
                }
            }
            match self.transport.read(&mut self.read_buf, timeout) {
                Ok(0) => return Ok(Poll::Closed),
                Ok(n) => self.buffer.extend(&self.read_buf[..n]),
                Err(err) if is_timeout(&err) => return Ok(Poll::Idle),
                Err(err) => return Err(err).context("reading from host"),
            }
        }
    }

    fn handle(&mut self, command: Command) -> Message {
        match command {
            Command::Hello { protocol_version } if protocol_version != PROTOCOL_VERSION => {
                server_error(
                    ErrorCode::UnsupportedVersion,
                    format!(
                        "host speaks protocol {}, server speaks {}",
                        protocol_version, PROTOCOL_VERSION
                    ),
                )
            }
            Command::Hello { .. } => Message::Response(Response::Hello(self.info())),
            Command::Configure { config } => self.configure(config),
            Command::Start => match &self.session {
                None => server_error(ErrorCode::NotConfigured, "start before configure"),
                Some(_) => {
                    self.streaming = true;
                    self.frames_emitted = 0;
                    self.next_frame_at = Instant::now();
                    self.logger.record("streaming started");
                    Message::Response(Response::Ok)
                }
            },
            Command::Stop if !self.streaming => {
                server_error(ErrorCode::NotStreaming, "stop while not streaming")
            }
            Command::Stop => {
                self.streaming = false;
                self.logger.record(&format!(
                    "streaming stopped after {} frame(s)",
                    self.frames_emitted
                ));
                Message::Response(Response::Ok)
            }
        }
    }

    fn configure(&mut self, mut config: SessionConfig) -> Message {
        if self.streaming {
            return server_error(ErrorCode::InvalidConfig, "stop streaming before reconfiguring");
        }
        if let Err(err) = config.validate() {
            return server_error(ErrorCode::InvalidConfig, err.to_string());
        }
        if let Some(missing) = config
            .sensor_ids
            .iter()
            .find(|id| !self.options.sensors.contains(*id))
        {
            return server_error(
                ErrorCode::InvalidConfig,
                format!("sensor {} is not attached", missing),
            );
        }

        let layouts: Vec<FrameLayout> = config
            .sensor_ids
            .iter()
            .map(|&id| FrameLayout::from_config(id, &config.sensor_config))
            .collect();
        let max_sweep_rate = layouts
            .iter()
            .map(|layout| layout.max_sweep_rate)
            .fold(f32::INFINITY, f32::min);
        let sweep_rate = match config.sensor_config.sweep_rate {
            Some(rate) if rate > max_sweep_rate => {
                self.logger.anomaly(&format!(
                    "sweep rate {:.1} Hz clamped to {:.1} Hz",
                    rate, max_sweep_rate
                ));
                // the ack reports what the sensor will actually run
                config.sensor_config.sweep_rate = Some(max_sweep_rate);
                max_sweep_rate
            }
            Some(rate) => rate,
            None => max_sweep_rate,
        };
        let sensor_config = &config.sensor_config;
        let achievable = sweep_rate / f32::from(sensor_config.sweeps_per_frame.max(1));
        let update_rate = config
            .update_rate
            .or(sensor_config.frame_rate)
            .map_or(achievable, |requested| requested.min(achievable));

        let generators = config
            .sensor_ids
            .iter()
            .map(|&id| {
                let generator = SweepGenerator::new(
                    sensor_config,
                    sweep_rate,
                    self.options.scene.clone(),
                    u64::from(id.get()),
                );
                (id, generator)
            })
            .collect();
        let metadata = SessionMetadata {
            protocol_version: PROTOCOL_VERSION,
            server_version: SERVER_VERSION.to_string(),
            config,
            update_rate,
            ticks_per_second: TICKS_PER_SECOND,
            layouts,
        };
        self.logger.record(&format!(
            "configured {} sensor(s), update rate {:.2} Hz",
            metadata.layouts.len(),
            update_rate
        ));
        let configured_temperature = self.options.scene.temperature_c.round() as i16;
        self.session = Some(ActiveSession {
            metadata: metadata.clone(),
            generators,
            configured_temperature,
        });
        Message::ConfigAck(metadata)
    }

    fn emit_frame(&mut self) -> anyhow::Result<()> {
        let index = self.frames_emitted;
        self.frames_emitted += 1;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let update_rate = session.metadata.update_rate;
        let period = if update_rate > 0.0 {
            Duration::from_secs_f32(1.0 / update_rate)
        } else {
            IDLE_POLL
        };
        let delayed = self.options.realtime
            && Instant::now().saturating_duration_since(self.next_frame_at) > period;
        self.next_frame_at += period;

        let time_s = index as f32 / update_rate.max(f32::MIN_POSITIVE);
        // The tick counter wraps at 32 bits like the hardware counter.
        let tick = (f64::from(time_s) * TICKS_PER_SECOND as f64) as u64 as u32;
        let dropped = self
            .options
            .drop_every
            .map_or(false, |n| n > 0 && (index + 1) % u64::from(n) == 0);

        let mut outgoing = Vec::with_capacity(session.generators.len());
        for (sensor_id, generator) in session.generators.iter_mut() {
            let samples = generator.frame(time_s);
            let temperature = generator.temperature_at(time_s);
            let context = FrameContext {
                data_saturated: generator.saturated(),
                frame_delayed: delayed,
                calibration_needed: (temperature - session.configured_temperature).abs()
                    >= CALIBRATION_DRIFT_C,
                temperature,
            };
            if !dropped {
                outgoing.push(Message::StreamData(StreamData {
                    sensor_id: *sensor_id,
                    sequence: index as u32,
                    tick,
                    context,
                    samples,
                }));
            }
        }
        if dropped {
            log::debug!("dropping frame {}", index);
        }
        for message in &outgoing {
            self.send(message)?;
        }
        Ok(())
    }

    fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        let frame = message.to_frame().context("encoding server message")?;
        self.transport
            .write_all(&encode(&frame))
            .context("writing to host")?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

fn server_error(code: ErrorCode, message: impl Into<String>) -> Message {
    Message::Error(ServerError::new(code, message))
}

/// Runs a server on the far end of an in-process channel and returns the host end.
pub fn spawn_in_memory(
    options: ServerOptions,
) -> (MemoryTransport, thread::JoinHandle<anyhow::Result<()>>) {
    let (host, server) = MemoryTransport::pair();
    let handle = thread::spawn(move || ModuleServer::new(server, options).run());
    (host, handle)
}

/// Accepts hosts on `addr`, one server thread per connection.
pub fn serve_tcp(addr: &str, options: ServerOptions) -> anyhow::Result<()> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("binding module server to {}", addr))?;
    let logger = LogManager::new("module-server");
    logger.record(&format!(
        "listening on {}",
        listener.local_addr().context("reading listener address")?
    ));
    for stream in listener.incoming() {
        let stream = stream.context("accepting host connection")?;
        let transport = TcpTransport::from_stream(stream).context("wrapping host connection")?;
        let options = options.clone();
        let logger = logger.clone();
        thread::spawn(move || {
            if let Err(err) = ModuleServer::new(transport, options).run() {
                logger.anomaly(&format!("session ended with error: {:#}", err));
            }
        });
    }
    Ok(())
}
