//! Whole-stack scenarios: an emulated module server on one end of an
//! in-memory transport, the session client, recorder, calibration and
//! detector pipeline on the other.

use std::f32::consts::PI;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use num_complex::Complex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use sweepcore::calibration::{ArtifactStore, CalibrationManager};
use sweepcore::interface::{
    CalibrationStatus, FrameContext, FrameLayout, Prf, Profile, SensorConfig, SensorId, SessionConfig,
    SessionMetadata, StreamEvent, SubsweepConfig, SweepFrame, PROTOCOL_VERSION,
};
use sweepcore::pipeline::{Pipeline, PipelineEvent};
use sweepcore::prelude::Processor;
use sweepcore::processing::{Detector, DetectorConfig, DistanceConfig, PresenceConfig};
use sweepcore::protocol::{encode, Command, FrameBuffer, Message, Response, ServerInfo, StreamData};
use sweepcore::record::{RecordPlayer, RecordingSource, ReplayOptions};
use sweepcore::session::SessionState;
use sweepcore::transport::{MemoryTransport, Transport};
use sweepcore::Client;

const TICKS_PER_SECOND: u64 = 1_000_000;
const TIMEOUT: Duration = Duration::from_secs(2);

fn metadata_for(config: SessionConfig) -> SessionMetadata {
    let layouts = config
        .sensor_ids
        .iter()
        .map(|&id| FrameLayout::from_config(id, &config.sensor_config))
        .collect();
    SessionMetadata {
        protocol_version: PROTOCOL_VERSION,
        server_version: "emulator".into(),
        update_rate: config
            .update_rate
            .or(config.sensor_config.frame_rate)
            .unwrap_or(10.0),
        config,
        ticks_per_second: TICKS_PER_SECOND,
        layouts,
    }
}

/// Answers commands and streams a fixed script of frames after `start`.
struct Emulator {
    transport: MemoryTransport,
    buffer: FrameBuffer,
}

impl Emulator {
    fn spawn(script: Vec<StreamData>) -> (MemoryTransport, thread::JoinHandle<()>) {
        let (host, server) = MemoryTransport::pair();
        let handle = thread::spawn(move || {
            Emulator {
                transport: server,
                buffer: FrameBuffer::new(),
            }
            .serve(script)
        });
        (host, handle)
    }

    fn next_command(&mut self) -> Option<Command> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                if let Ok(Message::Command(command)) = Message::from_frame(&frame) {
                    return Some(command);
                }
                continue;
            }
            match self.transport.read(&mut buf, Duration::from_secs(5)) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buffer.extend(&buf[..n]),
            }
        }
    }

    fn send(&mut self, message: Message) {
        let frame = message.to_frame().unwrap();
        let _ = self.transport.write_all(&encode(&frame));
    }

    fn serve(mut self, script: Vec<StreamData>) {
        while let Some(command) = self.next_command() {
            match command {
                Command::Hello { .. } => self.send(Message::Response(Response::Hello(ServerInfo {
                    protocol_version: PROTOCOL_VERSION,
                    server_version: "emulator".into(),
                    sensors: vec![SensorId::new(1)],
                    ticks_per_second: TICKS_PER_SECOND,
                }))),
                Command::Configure { config } => self.send(Message::ConfigAck(metadata_for(config))),
                Command::Start => {
                    self.send(Message::Response(Response::Ok));
                    for data in &script {
                        self.send(Message::StreamData(data.clone()));
                    }
                }
                Command::Stop => self.send(Message::Response(Response::Ok)),
            }
        }
    }
}

fn stream_data(sequence: u32, samples: Vec<Complex<i16>>) -> StreamData {
    StreamData {
        sensor_id: SensorId::new(1),
        sequence,
        tick: sequence * 100_000,
        context: FrameContext::default(),
        samples,
    }
}

fn streaming_client(config: &SensorConfig, script: Vec<StreamData>) -> Client<MemoryTransport> {
    let (host, _server) = Emulator::spawn(script);
    let mut client = Client::new(host);
    client.connect().unwrap();
    client.configure(config.clone()).unwrap();
    client.start().unwrap();
    client
}

fn distance_config() -> SensorConfig {
    SensorConfig::single(SubsweepConfig {
        start_point: 80,
        num_points: 100,
        step_length: 1,
        profile: Profile::P1,
        prf: Prf::Mhz13_0,
        ..Default::default()
    })
}

fn presence_config() -> SensorConfig {
    SensorConfig {
        sweeps_per_frame: 8,
        frame_rate: Some(10.0),
        ..SensorConfig::single(SubsweepConfig {
            num_points: 30,
            profile: Profile::P2,
            ..Default::default()
        })
    }
}

/// One sweep with a single pulse-shaped echo at `point` over low noise.
fn echo_sweep(points: usize, point: usize, amplitude: f32, rng: &mut StdRng) -> Vec<Complex<i16>> {
    let sigma = 16.0 / 2.355;
    (0..points)
        .map(|i| {
            let x = (i as f32 - point as f32) / sigma;
            let envelope = amplitude * (-0.5 * x * x).exp();
            let phase = PI / 3.0;
            Complex::new(
                (envelope * phase.cos()) as i16 + rng.gen_range(-2..=2),
                (envelope * phase.sin()) as i16 + rng.gen_range(-2..=2),
            )
        })
        .collect()
}

fn noisy_frame_samples(seed: u64, len: usize) -> Vec<Complex<i16>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| Complex::new(300 + rng.gen_range(-6..=6), rng.gen_range(-6..=6)))
        .collect()
}

fn sweep_frame(config: &SensorConfig, data: &StreamData) -> SweepFrame {
    SweepFrame {
        sensor_id: data.sensor_id,
        sequence: data.sequence,
        tick: u64::from(data.tick),
        timestamp_us: u64::from(data.tick),
        sweeps_per_frame: usize::from(config.sweeps_per_frame),
        sweep_len: config.points_per_sweep(),
        samples: data.samples.clone(),
        context: data.context,
    }
}

#[test]
fn distance_detector_finds_the_injected_echo() {
    let config = distance_config();
    let mut rng = StdRng::seed_from_u64(40);
    let script = vec![stream_data(0, echo_sweep(100, 40, 4000.0, &mut rng))];
    let client = streaming_client(&config, script);

    let manager = CalibrationManager::new(Arc::new(ArtifactStore::in_memory()));
    let mut pipeline = Pipeline::new(
        client,
        &DetectorConfig::Distance(DistanceConfig::default()),
        &manager,
    )
    .unwrap();

    let result = match pipeline.step(TIMEOUT).unwrap() {
        PipelineEvent::Result(result) => result,
        other => panic!("expected a result, got {:?}", other),
    };
    let output = result.distance().unwrap();
    assert_eq!(output.peaks.len(), 1, "peaks: {:?}", output.peaks);
    assert!((output.peaks[0].index as i64 - 40).abs() <= 1);
    assert!((output.peaks[0].distance_m - 120.0 * 2.5e-3).abs() < 2.5e-3);
    assert_eq!(result.calibration, CalibrationStatus::NoneSupplied);

    pipeline.into_source().stop().unwrap();
}

#[test]
fn results_carry_the_sequence_of_their_frame() {
    let config = presence_config();
    let frame_len = config.points_per_sweep() * 8;
    let script: Vec<StreamData> = (0..20)
        .map(|seq| stream_data(seq, noisy_frame_samples(u64::from(seq), frame_len)))
        .collect();
    let client = streaming_client(&config, script);

    let manager = CalibrationManager::new(Arc::new(ArtifactStore::in_memory()));
    let mut pipeline = Pipeline::new(
        client,
        &DetectorConfig::Presence(PresenceConfig::default()),
        &manager,
    )
    .unwrap();

    for expected in 0..20 {
        match pipeline.step(TIMEOUT).unwrap() {
            PipelineEvent::Result(result) => assert_eq!(result.sequence, expected),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn sequence_gap_resets_presence_but_keeps_calibration() {
    let config = presence_config();
    let frame_len = config.points_per_sweep() * 8;

    let manager = CalibrationManager::new(Arc::new(ArtifactStore::in_memory()));
    let background: Vec<SweepFrame> = (0..10)
        .map(|seq| sweep_frame(&config, &stream_data(seq, noisy_frame_samples(100 + u64::from(seq), frame_len))))
        .collect();
    let artifact = manager
        .compute(SensorId::new(1), &config, &background)
        .unwrap();
    let stored = manager.store_artifact(artifact).unwrap();

    let after_gap = stream_data(13, noisy_frame_samples(13, frame_len));
    let script = vec![stream_data(10, noisy_frame_samples(10, frame_len)), after_gap.clone()];
    let client = streaming_client(&config, script);
    let detector_config = DetectorConfig::Presence(PresenceConfig::default());
    let mut pipeline = Pipeline::new(client, &detector_config, &manager).unwrap();

    let mut events = Vec::new();
    for _ in 0..3 {
        events.push(pipeline.step(TIMEOUT).unwrap());
    }
    let resets: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Reset { .. }))
        .collect();
    assert_eq!(
        resets,
        vec![&PipelineEvent::Reset {
            sensor_id: SensorId::new(1),
            dropped: 2
        }]
    );

    let after = match &events[2] {
        PipelineEvent::Result(result) => result.clone(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(after.sequence, 13);
    assert_eq!(after.calibration, CalibrationStatus::Applied);
    assert_eq!(
        pipeline.detector(SensorId::new(1)).unwrap().calibration_status(),
        CalibrationStatus::Applied
    );

    // A reset detector behaves exactly like a fresh one.
    let metadata = pipeline.source().session_metadata().unwrap().clone();
    let mut fresh = Detector::new(SensorId::new(1), &metadata, &detector_config, Some(stored)).unwrap();
    let expected = fresh.update(&sweep_frame(&config, &after_gap)).unwrap();
    assert_eq!(after.output, expected.output);
}

#[test]
fn stop_is_idempotent() {
    let mut client = streaming_client(&presence_config(), Vec::new());
    assert_eq!(client.state(), SessionState::Streaming);
    client.stop().unwrap();
    assert_eq!(client.state(), SessionState::Idle);
    client.stop().unwrap();
    assert_eq!(client.state(), SessionState::Idle);
}

#[test]
fn replay_reproduces_the_live_session() {
    let config = presence_config();
    let frame_len = config.points_per_sweep() * 8;
    let mut script: Vec<StreamData> = [0u32, 1, 2, 5, 6]
        .iter()
        .map(|&seq| stream_data(seq, noisy_frame_samples(u64::from(seq) + 7, frame_len)))
        .collect();
    script[2].context = FrameContext {
        data_saturated: true,
        calibration_needed: true,
        temperature: 47,
        ..Default::default()
    };
    let client = streaming_client(&config, script);
    let live_metadata = client.session_metadata().unwrap().clone();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.swrc");
    let mut source = RecordingSource::create(client, &path).unwrap();
    let mut live = Vec::new();
    for _ in 0..6 {
        live.push(sweepcore::FrameSource::next_event(&mut source, TIMEOUT).unwrap());
    }
    source.inner_mut().stop().unwrap();
    let (_client, summary) = source.finalize().unwrap();
    assert_eq!(summary.frames, 5);
    assert_eq!(summary.dropped_events, 1);

    let mut player = RecordPlayer::open(&path, ReplayOptions::as_fast_as_possible()).unwrap();
    assert_eq!(player.metadata(), &live_metadata);
    let replayed: Vec<StreamEvent> = (0..6).map(|_| player.next_immediate().unwrap()).collect();
    assert_eq!(replayed, live);
    assert_eq!(player.next_immediate().unwrap(), StreamEvent::EndOfStream);

    let flagged = replayed
        .iter()
        .find_map(|event| match event {
            StreamEvent::Frame(frame) if frame.sequence == 2 => Some(frame.context),
            _ => None,
        })
        .unwrap();
    assert!(flagged.data_saturated && flagged.calibration_needed);
    assert_eq!(flagged.temperature, 47);
}

#[test]
fn calibration_needed_reaches_the_result() {
    let config = presence_config();
    let frame_len = config.points_per_sweep() * 8;
    let mut drifted = stream_data(1, noisy_frame_samples(1, frame_len));
    drifted.context.calibration_needed = true;
    drifted.context.temperature = 60;
    let script = vec![stream_data(0, noisy_frame_samples(0, frame_len)), drifted];
    let client = streaming_client(&config, script);

    let manager = CalibrationManager::new(Arc::new(ArtifactStore::in_memory()));
    let mut pipeline = Pipeline::new(
        client,
        &DetectorConfig::Presence(PresenceConfig::default()),
        &manager,
    )
    .unwrap();

    let mut results = Vec::new();
    while results.len() < 2 {
        if let PipelineEvent::Result(result) = pipeline.step(TIMEOUT).unwrap() {
            results.push(result);
        }
    }
    assert!(!results[0].calibration_needed());
    assert!(results[1].calibration_needed());
    assert_eq!(results[1].frame.temperature, 60);
    assert_eq!(results[1].calibration, CalibrationStatus::NoneSupplied);
}

#[test]
fn calibration_is_valid_only_for_its_own_config() {
    let config = presence_config();
    let samples = noisy_frame_samples(99, config.points_per_sweep() * 8);
    let frames: Vec<SweepFrame> = (0..10)
        .map(|seq| sweep_frame(&config, &stream_data(seq, samples.clone())))
        .collect();
    let manager = CalibrationManager::new(Arc::new(ArtifactStore::in_memory()));
    let artifact = manager
        .compute(SensorId::new(1), &config, &frames)
        .unwrap();

    assert!(CalibrationManager::validate(&artifact, &config));
    let faster = SensorConfig {
        sweep_rate: Some(1000.0),
        ..config.clone()
    };
    assert!(!CalibrationManager::validate(&artifact, &faster));

    let mut single_field_changes = Vec::new();
    let mut changed = config.clone();
    changed.sweeps_per_frame += 1;
    single_field_changes.push(changed);
    let mut changed = config.clone();
    changed.frame_rate = Some(9.0);
    single_field_changes.push(changed);
    let mut changed = config.clone();
    changed.double_buffering = !changed.double_buffering;
    single_field_changes.push(changed);
    let mut changed = config.clone();
    changed.subsweeps[0].hwaas += 1;
    single_field_changes.push(changed);
    let mut changed = config.clone();
    changed.subsweeps[0].start_point -= 1;
    single_field_changes.push(changed);
    let mut changed = config.clone();
    changed.subsweeps[0].receiver_gain += 1;
    single_field_changes.push(changed);
    let mut changed = config.clone();
    changed.subsweeps[0].enable_tx = false;
    single_field_changes.push(changed);
    let mut changed = config.clone();
    changed.subsweeps[0].profile = Profile::P3;
    single_field_changes.push(changed);

    for changed in &single_field_changes {
        assert!(
            !CalibrationManager::validate(&artifact, changed),
            "artifact accepted for {:?}",
            changed
        );
    }
}
