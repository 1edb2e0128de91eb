//! Board session state machine
//!
//! A [`BoardSession`] owns one board handle and moves it through
//! `Disconnected → Ready → Recording → Ready → … → Disconnected`. All
//! operations are synchronous and may block on device or disk I/O.
//!
//! The session publishes its status into a shared [`StatusHandle`] after every
//! transition, so readers get a consistent snapshot without waiting for a slow
//! start or stop to finish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::board::{
    Board, BoardDescriptor, BoardIdentity, ConflictPolicy, DriverRegistry, SampleSink,
};
use crate::error::{RecordError, Result};
use crate::identifiers::SessionIdentifiers;
use crate::metadata::{self, MetadataDefaults, Sidecar};
use crate::naming::RecordingTarget;

/// Lifecycle state of a board session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardSessionState {
    Disconnected,
    Ready,
    Recording,
}

impl fmt::Display for BoardSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardSessionState::Disconnected => write!(f, "disconnected"),
            BoardSessionState::Ready => write!(f, "ready"),
            BoardSessionState::Recording => write!(f, "recording"),
        }
    }
}

/// Status flags reported to control surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardStatus {
    pub name: String,
    pub is_ready: bool,
    pub is_recording: bool,
}

impl BoardStatus {
    /// Status of a board with no session
    pub fn not_connected(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_ready: false,
            is_recording: false,
        }
    }
}

/// Shared, lock-protected status snapshot
pub type StatusHandle = Arc<RwLock<BoardStatus>>;

/// Read a status snapshot, tolerating a poisoned lock
pub fn read_status(handle: &StatusHandle) -> BoardStatus {
    handle.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Everything `start` needs besides the session itself
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub identifiers: SessionIdentifiers,
    pub target: RecordingTarget,
    pub metadata: MetadataDefaults,
    pub on_conflict: ConflictPolicy,
}

/// Result of a completed stop
#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    pub target: RecordingTarget,
    pub samples_written: u64,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

struct ActiveRecording {
    target: RecordingTarget,
    sidecar: Sidecar,
    started_at: DateTime<Utc>,
}

enum Phase {
    Disconnected,
    Ready,
    Recording(ActiveRecording),
}

/// One board connection and its recording state
pub struct BoardSession {
    identity: BoardIdentity,
    descriptor: BoardDescriptor,
    board: Option<Box<dyn Board>>,
    phase: Phase,
    status: StatusHandle,
}

impl BoardSession {
    /// A disconnected session publishing into `status`
    pub fn new(identity: BoardIdentity, descriptor: BoardDescriptor, status: StatusHandle) -> Self {
        let session = Self {
            identity,
            descriptor,
            board: None,
            phase: Phase::Disconnected,
            status,
        };
        session.publish();
        session
    }

    pub fn identity(&self) -> &BoardIdentity {
        &self.identity
    }

    pub fn descriptor(&self) -> &BoardDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> BoardSessionState {
        match self.phase {
            Phase::Disconnected => BoardSessionState::Disconnected,
            Phase::Ready => BoardSessionState::Ready,
            Phase::Recording(_) => BoardSessionState::Recording,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.phase, Phase::Recording(_))
    }

    /// Target of the active recording
    pub fn target(&self) -> Option<&RecordingTarget> {
        match &self.phase {
            Phase::Recording(active) => Some(&active.target),
            _ => None,
        }
    }

    pub fn status(&self) -> BoardStatus {
        read_status(&self.status)
    }

    /// Open the board through `drivers` and check it answers
    pub fn connect(&mut self, drivers: &DriverRegistry) -> Result<()> {
        self.expect_state(BoardSessionState::Disconnected, "connect")?;

        let mut board = drivers.open(&self.descriptor)?;
        board
            .prepare()
            .map_err(|e| connection_error(&self.identity, e))?;

        tracing::info!("Connected to {}", self.identity);
        self.board = Some(board);
        self.phase = Phase::Ready;
        self.publish();
        Ok(())
    }

    /// Open the data file, write the in-progress metadata and start streaming
    pub fn start(&mut self, spec: StartSpec) -> Result<RecordingTarget> {
        self.expect_state(BoardSessionState::Ready, "start")?;
        let StartSpec {
            identifiers,
            target,
            metadata: defaults,
            on_conflict,
        } = spec;

        let board = self.board.as_mut().ok_or_else(|| {
            RecordError::connection(self.identity.as_str(), "board handle is missing")
        })?;
        let info = board.info().clone();

        target.check_available(on_conflict)?;
        target.create_dirs()?;
        let data_path = target.data_path();
        let created: Vec<PathBuf> = std::iter::once(data_path.clone())
            .chain(target.metadata_paths())
            .filter(|path| !path.exists())
            .collect();
        let sink = SampleSink::create(&data_path, &info.eeg_channels, on_conflict)?;

        let started_at = Utc::now();
        let template = Sidecar::template(&identifiers, &info, &defaults);
        let sidecar = Sidecar::started(
            template,
            &identifiers,
            self.identity.board_name(),
            &target.filename,
            started_at,
        );

        let prepared = sidecar
            .write(&target.sidecar_path())
            .and_then(|_| metadata::write_channels(&target.channels_path(), &info))
            .and_then(|_| board.start_stream(sink));
        if let Err(e) = prepared {
            discard_created(&created);
            return Err(e);
        }

        tracing::info!(
            "Now recording from {} to {}",
            self.identity,
            data_path.display()
        );
        self.phase = Phase::Recording(ActiveRecording {
            target: target.clone(),
            sidecar,
            started_at,
        });
        self.publish();
        Ok(target)
    }

    /// Stop streaming, close the data file and finalize the sidecar
    ///
    /// Leaves the session Ready on success and on filesystem failure; a
    /// hardware failure disconnects it.
    pub fn stop(&mut self) -> Result<StopOutcome> {
        let ActiveRecording {
            target,
            mut sidecar,
            started_at,
        } = match std::mem::replace(&mut self.phase, Phase::Ready) {
            Phase::Recording(active) => active,
            other => {
                self.phase = other;
                return Err(self.invalid_transition("stop"));
            }
        };

        let stopped = match self.board.as_mut() {
            Some(board) => board.stop_stream(),
            None => Err(RecordError::connection(
                self.identity.as_str(),
                "board handle is missing",
            )),
        };
        let finished = stopped.and_then(SampleSink::finish);
        let stopped_at = Utc::now();

        let summary = match finished {
            Ok(summary) => summary,
            Err(e) => {
                sidecar.finish(stopped_at, None);
                if let Err(write_err) = sidecar.write(&target.sidecar_path()) {
                    tracing::warn!("Failed to finalize sidecar for {}: {write_err}", self.identity);
                }
                if !matches!(e, RecordError::IoError(_)) {
                    if let Some(board) = self.board.as_mut() {
                        let _ = board.release();
                    }
                    self.drop_board();
                }
                self.publish();
                return Err(e);
            }
        };

        sidecar.finish(stopped_at, Some(summary.samples_written));
        let written = sidecar.write(&target.sidecar_path());
        self.publish();
        written?;

        tracing::info!(
            "Stopped recording from {} ({} samples)",
            self.identity,
            summary.samples_written
        );
        Ok(StopOutcome {
            target,
            samples_written: summary.samples_written,
            started_at,
            stopped_at,
        })
    }

    /// Release the board, stopping first if a recording is active
    ///
    /// The board is released even when the implicit stop fails; the stop error
    /// is returned afterwards.
    pub fn disconnect(&mut self) -> Result<()> {
        let stop_result = if self.is_recording() {
            tracing::warn!("Disconnecting {} while recording; stopping first", self.identity);
            self.stop().map(|_| ())
        } else {
            Ok(())
        };

        let release_result = match self.board.as_mut() {
            Some(board) => board
                .release()
                .map_err(|e| connection_error(&self.identity, e)),
            None => Ok(()),
        };
        self.drop_board();
        self.publish();
        tracing::info!("Released {}", self.identity);

        stop_result.and(release_result)
    }

    fn drop_board(&mut self) {
        self.board = None;
        self.phase = Phase::Disconnected;
    }

    fn expect_state(&self, expected: BoardSessionState, action: &str) -> Result<()> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(self.invalid_transition(action))
        }
    }

    fn invalid_transition(&self, action: &str) -> RecordError {
        RecordError::InvalidTransition {
            board: self.identity.to_string(),
            action: action.to_string(),
            state: self.state().to_string(),
        }
    }

    fn publish(&self) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        *status = BoardStatus {
            name: self.identity.board_name().to_string(),
            is_ready: matches!(self.phase, Phase::Ready),
            is_recording: matches!(self.phase, Phase::Recording(_)),
        };
    }
}

impl Drop for BoardSession {
    fn drop(&mut self) {
        if self.board.is_some() {
            if let Err(e) = self.disconnect() {
                tracing::warn!("Failed to release {} on drop: {e}", self.identity);
            }
        }
    }
}

impl fmt::Debug for BoardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardSession")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// Wrap a driver error as a connection failure of `identity`
fn connection_error(identity: &BoardIdentity, err: RecordError) -> RecordError {
    match err {
        RecordError::ConnectionError { .. } => err,
        other => RecordError::connection(identity.as_str(), other),
    }
}

/// Remove the files a failed start created
fn discard_created(paths: &[PathBuf]) {
    for path in paths.iter().filter(|path| path.exists()) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{BoardDriver, BoardIdentityPolicy};
    use crate::catalog::{BoardInfo, BoardKind};
    use crate::naming::compute_target;
    use crate::synthetic::SyntheticDriver;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ids(run: &str) -> SessionIdentifiers {
        SessionIdentifiers::new("001", "testSession", "myExperiment", run, "eeg", "eeg").unwrap()
    }

    fn drivers() -> DriverRegistry {
        DriverRegistry::empty().with_driver(
            BoardKind::SyntheticBoard,
            Arc::new(SyntheticDriver::new(Duration::from_millis(5))),
        )
    }

    fn session() -> (BoardSession, StatusHandle) {
        let descriptor = BoardDescriptor::new("SYNTHETIC_BOARD");
        let identity = BoardIdentityPolicy::Name.identity(&descriptor);
        let status = Arc::new(RwLock::new(BoardStatus::not_connected("SYNTHETIC_BOARD")));
        (
            BoardSession::new(identity, descriptor, Arc::clone(&status)),
            status,
        )
    }

    fn spec(root: &std::path::Path, run: &str) -> StartSpec {
        StartSpec {
            identifiers: ids(run),
            target: compute_target(&ids(run), root),
            metadata: MetadataDefaults::default(),
            on_conflict: ConflictPolicy::Abort,
        }
    }

    /// Board whose stream fails at stop with the given error
    struct FailingStopBoard {
        info: BoardInfo,
        error: RecordError,
        sink: Option<SampleSink>,
    }

    impl Board for FailingStopBoard {
        fn info(&self) -> &BoardInfo {
            &self.info
        }
        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }
        fn start_stream(&mut self, sink: SampleSink) -> Result<()> {
            self.sink = Some(sink);
            Ok(())
        }
        fn stop_stream(&mut self) -> Result<SampleSink> {
            self.sink = None;
            Err(self.error.clone())
        }
        fn release(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Board that refuses to start streaming
    struct FailingStartBoard(BoardInfo);

    impl Board for FailingStartBoard {
        fn info(&self) -> &BoardInfo {
            &self.0
        }
        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }
        fn start_stream(&mut self, _sink: SampleSink) -> Result<()> {
            Err(RecordError::connection("SYNTHETIC_BOARD", "stream refused"))
        }
        fn stop_stream(&mut self) -> Result<SampleSink> {
            Err(RecordError::IoError("never started".into()))
        }
        fn release(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingStartDriver;

    impl BoardDriver for FailingStartDriver {
        fn open(&self, _d: &BoardDescriptor, info: BoardInfo) -> Result<Box<dyn Board>> {
            Ok(Box::new(FailingStartBoard(info)))
        }
    }

    struct FailingStopDriver(RecordError);

    impl BoardDriver for FailingStopDriver {
        fn open(&self, _d: &BoardDescriptor, info: BoardInfo) -> Result<Box<dyn Board>> {
            Ok(Box::new(FailingStopBoard {
                info,
                error: self.0.clone(),
                sink: None,
            }))
        }
    }

    #[test]
    fn test_full_cycle() {
        let dir = TempDir::new().unwrap();
        let (mut session, status) = session();
        assert_eq!(session.state(), BoardSessionState::Disconnected);

        session.connect(&drivers()).unwrap();
        assert!(read_status(&status).is_ready);

        let target = session.start(spec(dir.path(), "001")).unwrap();
        assert_eq!(session.state(), BoardSessionState::Recording);
        assert!(read_status(&status).is_recording);
        assert!(!read_status(&status).is_ready);
        assert_eq!(session.target(), Some(&target));

        std::thread::sleep(Duration::from_millis(30));
        let outcome = session.stop().unwrap();
        assert_eq!(session.state(), BoardSessionState::Ready);
        assert!(outcome.stopped_at >= outcome.started_at);

        let data = std::fs::read_to_string(target.data_path()).unwrap();
        assert_eq!(data.lines().count() as u64, outcome.samples_written + 1);

        let sidecar: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(target.sidecar_path()).unwrap()).unwrap();
        assert_eq!(
            sidecar["SenseRecord"]["SampleCount"],
            serde_json::json!(outcome.samples_written)
        );
        assert!(!sidecar["SenseRecord"]["StopTime"].is_null());
        assert!(target.channels_path().exists());
    }

    #[test]
    fn test_no_skip_transitions() {
        let dir = TempDir::new().unwrap();
        let (mut session, _status) = session();

        let err = session.start(spec(dir.path(), "001")).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert!(!dir.path().join("sourcedata").exists());

        assert_eq!(session.stop().unwrap_err().kind(), "invalid_transition");
    }

    #[test]
    fn test_second_stop_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut session, _status) = session();
        session.connect(&drivers()).unwrap();
        session.start(spec(dir.path(), "001")).unwrap();
        session.stop().unwrap();

        let err = session.stop().unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_second_start_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut session, _status) = session();
        session.connect(&drivers()).unwrap();
        session.start(spec(dir.path(), "001")).unwrap();

        let err = session.start(spec(dir.path(), "002")).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert!(!compute_target(&ids("002"), dir.path()).data_path().exists());
        session.stop().unwrap();
    }

    #[test]
    fn test_path_conflict_keeps_ready() {
        let dir = TempDir::new().unwrap();
        let target = compute_target(&ids("001"), dir.path());
        target.create_dirs().unwrap();
        std::fs::write(target.data_path(), "earlier run").unwrap();

        let (mut session, _status) = session();
        session.connect(&drivers()).unwrap();
        let err = session.start(spec(dir.path(), "001")).unwrap_err();
        assert_eq!(err.kind(), "path_conflict");
        assert_eq!(session.state(), BoardSessionState::Ready);
        assert_eq!(
            std::fs::read_to_string(target.data_path()).unwrap(),
            "earlier run"
        );
    }

    #[test]
    fn test_failed_stream_start_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let drivers = DriverRegistry::empty()
            .with_driver(BoardKind::SyntheticBoard, Arc::new(FailingStartDriver));
        let (mut session, _status) = session();
        session.connect(&drivers).unwrap();

        let spec = spec(dir.path(), "001");
        let data_dir = spec.target.data_dir();
        let err = session.start(spec).unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert_eq!(session.state(), BoardSessionState::Ready);
        assert_eq!(std::fs::read_dir(data_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_overwrite_keeps_earlier_metadata() {
        let dir = TempDir::new().unwrap();
        let target = compute_target(&ids("001"), dir.path());
        target.create_dirs().unwrap();
        std::fs::write(target.sidecar_path(), "{}").unwrap();

        let drivers = DriverRegistry::empty()
            .with_driver(BoardKind::SyntheticBoard, Arc::new(FailingStartDriver));
        let (mut session, _status) = session();
        session.connect(&drivers).unwrap();
        let spec = StartSpec {
            on_conflict: ConflictPolicy::Overwrite,
            ..spec(dir.path(), "001")
        };

        session.start(spec).unwrap_err();
        assert!(target.sidecar_path().exists());
        assert!(!target.data_path().exists());
        assert!(!target.channels_path().exists());
    }

    #[test]
    fn test_disconnect_while_recording_finalizes() {
        let dir = TempDir::new().unwrap();
        let (mut session, status) = session();
        session.connect(&drivers()).unwrap();
        let target = session.start(spec(dir.path(), "001")).unwrap();

        session.disconnect().unwrap();
        assert_eq!(session.state(), BoardSessionState::Disconnected);
        assert_eq!(read_status(&status), BoardStatus::not_connected("SYNTHETIC_BOARD"));

        let sidecar = std::fs::read_to_string(target.sidecar_path()).unwrap();
        assert!(sidecar.contains("\"StopTime\": \"20"));
    }

    #[test]
    fn test_io_failure_forces_ready() {
        let dir = TempDir::new().unwrap();
        let drivers = DriverRegistry::empty().with_driver(
            BoardKind::SyntheticBoard,
            Arc::new(FailingStopDriver(RecordError::IoError("disk full".into()))),
        );
        let (mut session, status) = session();
        session.connect(&drivers).unwrap();
        session.start(spec(dir.path(), "001")).unwrap();

        let err = session.stop().unwrap_err();
        assert_eq!(err.kind(), "io_error");
        assert_eq!(session.state(), BoardSessionState::Ready);
        assert!(!read_status(&status).is_recording);
    }

    #[test]
    fn test_hardware_failure_disconnects() {
        let dir = TempDir::new().unwrap();
        let drivers = DriverRegistry::empty().with_driver(
            BoardKind::SyntheticBoard,
            Arc::new(FailingStopDriver(RecordError::connection(
                "SYNTHETIC_BOARD",
                "cable unplugged",
            ))),
        );
        let (mut session, _status) = session();
        session.connect(&drivers).unwrap();
        session.start(spec(dir.path(), "001")).unwrap();

        assert_eq!(session.stop().unwrap_err().kind(), "connection_error");
        assert_eq!(session.state(), BoardSessionState::Disconnected);
    }
}
