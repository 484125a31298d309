use crate::server::spawn_in_memory;
use crate::workflow::config::{ConnectionConfig, WorkflowConfig};
use anyhow::{bail, Context};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use sweepcore::calibration::{ArtifactStore, CalibrationArtifact, CalibrationManager};
use sweepcore::interface::{DetectionOutput, DetectionResult, SensorId, StreamEvent, SweepFrame};
use sweepcore::pipeline::{Pipeline, PipelineEvent, PipelineSummary, ResultPublisher};
use sweepcore::record::{RecordPlayer, RecordSummary, RecordingSource, ReplayOptions};
use sweepcore::telemetry::MetricsSnapshot;
use sweepcore::transport::{SerialTransport, TcpTransport, Transport};
use sweepcore::{Client, FrameSource};

pub type BoxedClient = Client<Box<dyn Transport>>;

/// What a live or replayed run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub summary: PipelineSummary,
    pub last_result: Option<DetectionResult>,
    pub record: Option<RecordSummary>,
    pub metrics: Option<MetricsSnapshot>,
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    pub fn calibration_manager(&self) -> anyhow::Result<CalibrationManager> {
        let store = match &self.config.calibration.dir {
            Some(dir) => ArtifactStore::open(dir)
                .with_context(|| format!("opening calibration store {}", dir.display()))?,
            None => ArtifactStore::in_memory(),
        };
        Ok(CalibrationManager::new(Arc::new(store))
            .with_min_frames(self.config.calibration.frames.max(1)))
    }

    fn transport(&self) -> Box<dyn Transport> {
        match &self.config.connection {
            ConnectionConfig::Simulated(options) => {
                let (host, _server) = spawn_in_memory(options.clone());
                Box::new(host)
            }
            ConnectionConfig::Tcp { address } => Box::new(TcpTransport::new(address.clone())),
            ConnectionConfig::Serial { port, baud_rate } => {
                Box::new(SerialTransport::new(port.clone(), *baud_rate))
            }
        }
    }

    /// Connects, configures and starts streaming.
    pub fn start_session(&self) -> anyhow::Result<BoxedClient> {
        let mut client = Client::new(self.transport());
        let info = client.connect().context("connecting to module server")?;
        info!(
            "module server {} with sensors {:?}",
            info.server_version, info.sensors
        );
        client
            .configure(self.config.session_config())
            .context("configuring session")?;
        client.start().context("starting stream")?;
        Ok(client)
    }

    /// Collects background frames from every configured sensor and stores
    /// one artifact per sensor.
    pub fn calibrate(
        &self,
        manager: &CalibrationManager,
    ) -> anyhow::Result<Vec<Arc<CalibrationArtifact>>> {
        let wanted = self.config.calibration.frames.max(1);
        let mut client = self.start_session()?;
        let mut frames: BTreeMap<SensorId, Vec<SweepFrame>> = self
            .config
            .sensors
            .iter()
            .map(|&id| (id, Vec::with_capacity(wanted)))
            .collect();

        while frames.values().any(|collected| collected.len() < wanted) {
            match client
                .next_frame(self.config.timeout())
                .context("collecting calibration frames")?
            {
                StreamEvent::Frame(frame) => {
                    if let Some(collected) = frames.get_mut(&frame.sensor_id) {
                        if collected.len() < wanted {
                            collected.push(frame);
                        }
                    }
                }
                StreamEvent::DroppedFrames { sensor_id, count } => {
                    debug!("sensor {} lost {} calibration frame(s)", sensor_id, count)
                }
                StreamEvent::EndOfStream => bail!("stream ended during calibration"),
            }
        }
        client.stop().context("stopping calibration stream")?;

        // artifacts are keyed to the config the server negotiated, which is
        // what detectors validate against
        let sensor_config = client
            .session_metadata()
            .map(|metadata| metadata.sensor_config().clone())
            .context("calibration session has no metadata")?;
        let sensor_config = &sensor_config;
        frames
            .into_iter()
            .map(|(sensor_id, collected)| {
                let artifact = manager
                    .compute(sensor_id, sensor_config, &collected)
                    .with_context(|| format!("computing calibration for sensor {}", sensor_id))?;
                let stored = manager
                    .store_artifact(artifact)
                    .with_context(|| format!("storing calibration for sensor {}", sensor_id))?;
                info!(
                    "sensor {} calibrated from {} frame(s)",
                    sensor_id, stored.frames_used
                );
                Ok(stored)
            })
            .collect()
    }

    /// Streams from the module server through the detector pipeline,
    /// recording the session when a record path is configured.
    pub fn run_live(
        &self,
        manager: &CalibrationManager,
        publisher: Option<ResultPublisher>,
    ) -> anyhow::Result<RunReport> {
        let client = self.start_session()?;
        let metrics = client.metrics();
        let limit = Some(self.config.frames);

        let (summary, last_result, record) = match &self.config.record {
            Some(path) => {
                let source = RecordingSource::create(client, path)
                    .with_context(|| format!("creating record {}", path.display()))?;
                let mut pipeline = build_pipeline(source, self, manager, publisher)?;
                let (summary, last) = drive(&mut pipeline, limit, self)?;
                let mut source = pipeline.into_source();
                source.inner_mut().stop().context("stopping stream")?;
                let (_client, record) = source.finalize().context("finalizing record")?;
                info!("recorded {} frame(s) to {}", record.frames, record.path.display());
                (summary, last, Some(record))
            }
            None => {
                let mut pipeline = build_pipeline(client, self, manager, publisher)?;
                let (summary, last) = drive(&mut pipeline, limit, self)?;
                pipeline
                    .source_mut()
                    .stop()
                    .context("stopping stream")?;
                (summary, last, None)
            }
        };

        Ok(RunReport {
            summary,
            last_result,
            record,
            metrics: Some(metrics.snapshot()),
        })
    }

    /// Runs a recorded session through the detector pipeline to its end.
    pub fn replay(
        &self,
        path: &Path,
        options: ReplayOptions,
        manager: &CalibrationManager,
        publisher: Option<ResultPublisher>,
    ) -> anyhow::Result<RunReport> {
        let player = RecordPlayer::open(path, options)
            .with_context(|| format!("opening record {}", path.display()))?;
        let mut pipeline = build_pipeline(player, self, manager, publisher)?;
        let (summary, last_result) = drive(&mut pipeline, None, self)?;
        info!(
            "replayed {} frame(s) from {}",
            pipeline.source().frames_read(),
            path.display()
        );
        Ok(RunReport {
            summary,
            last_result,
            record: None,
            metrics: None,
        })
    }
}

fn build_pipeline<S: FrameSource>(
    source: S,
    runner: &Runner,
    manager: &CalibrationManager,
    publisher: Option<ResultPublisher>,
) -> anyhow::Result<Pipeline<S>> {
    let pipeline = Pipeline::new(source, &runner.config.detector, manager)
        .context("building detector pipeline")?;
    Ok(match publisher {
        Some(publisher) => pipeline.with_publisher(publisher),
        None => pipeline,
    })
}

/// Steps the pipeline until `limit` results or the end of the stream.
fn drive<S: FrameSource>(
    pipeline: &mut Pipeline<S>,
    limit: Option<u64>,
    runner: &Runner,
) -> anyhow::Result<(PipelineSummary, Option<DetectionResult>)> {
    let mut summary = PipelineSummary::default();
    let mut last = None;
    while limit.map_or(true, |limit| summary.results < limit) {
        match pipeline.step(runner.config.timeout()) {
            Ok(PipelineEvent::Result(result)) => {
                summary.results += 1;
                debug!("{}", describe(&result));
                last = Some(result);
            }
            Ok(PipelineEvent::Reset { .. }) => summary.resets += 1,
            Ok(PipelineEvent::EndOfStream) => break,
            Err(err) if err.is_recoverable() => {
                summary.skipped += 1;
                debug!("skipping frame: {}", err);
            }
            Err(err) => return Err(err).context("running detector pipeline"),
        }
    }
    Ok((summary, last))
}

/// One-line rendering of a result for logs and the console.
pub fn describe(result: &DetectionResult) -> String {
    let detail = match &result.output {
        DetectionOutput::Presence(presence) => format!(
            "presence={} score={:.2} distance={}",
            presence.detected,
            presence.score,
            presence
                .distance_m
                .map_or_else(|| "-".to_string(), |d| format!("{:.3} m", d))
        ),
        DetectionOutput::Distance(distance) => {
            let peaks: Vec<String> = distance
                .peaks
                .iter()
                .map(|peak| format!("{:.3} m ({:.0})", peak.distance_m, peak.amplitude))
                .collect();
            format!("peaks=[{}]", peaks.join(", "))
        }
    };
    let mut line = format!(
        "sensor {} frame {} [{:?}] {}",
        result.sensor_id, result.sequence, result.calibration, detail
    );
    let frame = &result.frame;
    for (set, flag) in [
        (frame.data_saturated, "saturated"),
        (frame.frame_delayed, "delayed"),
        (frame.calibration_needed, "calibration needed"),
    ] {
        if set {
            line.push_str(&format!(" ({})", flag));
        }
    }
    line
}
