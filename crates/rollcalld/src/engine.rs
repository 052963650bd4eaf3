use rollcall_core::{
    AttendanceSink, BoundingBox, CandidateResolver, Identity, Outcome, SessionDebouncer,
    Shutdown, TokenReader, TokenVerifier,
};
use rollcall_hw::{Frame, FrameSource};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited without reporting")]
    Aborted,
}

/// A verification session run while processing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub label: String,
    pub outcome: Outcome,
}

/// Result of processing one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub sequence: u64,
    pub faces: Vec<(BoundingBox, Identity)>,
    pub session: Option<SessionReport>,
}

/// Counters reported at shutdown.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub frames: u64,
    pub skipped_frames: u64,
    pub faces: u64,
    pub sessions: u64,
    pub accepted: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub elapsed: Duration,
}

impl RunStats {
    fn observe(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.faces += report.faces.len() as u64;
        if let Some(session) = &report.session {
            self.sessions += 1;
            match session.outcome {
                Outcome::Accepted(_) => self.accepted += 1,
                Outcome::Exhausted => self.exhausted += 1,
                Outcome::Cancelled => self.cancelled += 1,
            }
        }
    }

    /// Approximate frames per second over the whole run.
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.frames as f64 / secs } else { 0.0 }
    }

    pub fn log(&self) {
        tracing::info!(
            elapsed_secs = %format!("{:.2}", self.elapsed.as_secs_f64()),
            approx_fps = %format!("{:.2}", self.fps()),
            frames = self.frames,
            skipped_frames = self.skipped_frames,
            sessions = self.sessions,
            accepted = self.accepted,
            exhausted = self.exhausted,
            cancelled = self.cancelled,
            "run finished"
        );
    }
}

/// The frame loop controller. Owns the confirmed identity and the reader.
pub struct Engine {
    resolver: CandidateResolver,
    debouncer: SessionDebouncer,
    verifier: TokenVerifier,
    reader: Box<dyn TokenReader + Send>,
    sink: Box<dyn AttendanceSink + Send>,
    shutdown: Shutdown,
}

impl Engine {
    pub fn new(
        resolver: CandidateResolver,
        debouncer: SessionDebouncer,
        verifier: TokenVerifier,
        reader: Box<dyn TokenReader + Send>,
        sink: Box<dyn AttendanceSink + Send>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            resolver,
            debouncer,
            verifier,
            reader,
            sink,
            shutdown,
        }
    }

    pub fn debouncer(&self) -> &SessionDebouncer {
        &self.debouncer
    }

    /// Resolve every face in the frame, then run at most one verification
    /// session for the first admitted candidate.
    pub fn process_frame(&mut self, frame: &Frame) -> FrameReport {
        let faces: Vec<(BoundingBox, Identity)> = frame
            .faces
            .iter()
            .map(|face| (face.bbox, self.resolver.resolve(face)))
            .collect();

        for (bbox, identity) in &faces {
            tracing::debug!(
                sequence = frame.sequence,
                label = %identity,
                top = bbox.top,
                left = bbox.left,
                width = bbox.width(),
                height = bbox.height(),
                "face resolved"
            );
        }

        let admitted = faces
            .iter()
            .map(|(_, identity)| identity)
            .find(|identity| self.debouncer.admit(identity))
            .and_then(Identity::label)
            .map(str::to_string);

        let session = admitted.map(|label| {
            tracing::info!(label = %label, sequence = frame.sequence, "recognized");
            self.debouncer.on_admitted(&label);
            let outcome = self
                .verifier
                .verify(&label, self.reader.as_mut(), self.sink.as_mut());
            self.debouncer.on_outcome(&label, &outcome);
            SessionReport { label, outcome }
        });

        FrameReport {
            sequence: frame.sequence,
            faces,
            session,
        }
    }

    /// Pull frames until end of stream, an unrecoverable source error, or shutdown.
    pub fn run<F: FrameSource + ?Sized>(&mut self, source: &mut F) -> RunStats {
        let start = Instant::now();
        let mut stats = RunStats::default();

        while !self.shutdown.is_triggered() {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    let report = self.process_frame(&frame);
                    stats.observe(&report);
                }
                Ok(None) => {
                    tracing::info!("frame source ended");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "skipping frame");
                    stats.skipped_frames += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "frame source failed");
                    break;
                }
            }
        }

        stats.elapsed = start.elapsed();
        stats
    }
}

/// Run the engine on a dedicated OS thread. The returned receiver yields
/// the run statistics once the loop exits.
pub fn spawn_engine(
    mut engine: Engine,
    mut source: Box<dyn FrameSource + Send>,
) -> Result<oneshot::Receiver<RunStats>, EngineError> {
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let stats = engine.run(source.as_mut());
            tracing::info!("engine thread exiting");
            let _ = tx.send(stats);
        })?;

    Ok(rx)
}

/// Stats from a finished engine. A closed channel means the thread died
/// before reporting.
pub fn collect_stats(
    finished: Result<RunStats, oneshot::error::RecvError>,
) -> Result<RunStats, EngineError> {
    finished.map_err(|_| {
        tracing::error!("engine thread exited without reporting");
        EngineError::Aborted
    })
}
