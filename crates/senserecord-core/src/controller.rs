//! Session controller
//!
//! The programmatic surface every front end drives: start, stop and status by
//! board identity. It owns the [`SessionRegistry`], turns requests into
//! targets and start specs, and reports lifecycle events to an [`EventSink`].

use serde::Serialize;
use std::path::PathBuf;

use crate::board::{BoardDescriptor, BoardIdentity, BoardIdentityPolicy, ConflictPolicy, ConnectionParams, DriverRegistry};
use crate::config::RequestDefaults;
use crate::error::{RecordError, Result};
use crate::events::{EventSink, NoOpEventSink, RecordingStarted, RecordingStopped};
use crate::identifiers::{IdentifierInput, SessionIdentifiers};
use crate::metadata::MetadataDefaults;
use crate::naming::{compute_target, RecordingTarget};
use crate::registry::SessionRegistry;
use crate::session::{BoardStatus, StartSpec};

/// Everything needed to start one recording
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub descriptor: BoardDescriptor,
    pub identifiers: SessionIdentifiers,
    pub root: PathBuf,
    pub metadata: MetadataDefaults,
    pub on_conflict: ConflictPolicy,
}

impl StartRequest {
    pub fn new(descriptor: BoardDescriptor, identifiers: SessionIdentifiers, root: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            identifiers,
            root: root.into(),
            metadata: MetadataDefaults::default(),
            on_conflict: ConflictPolicy::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: MetadataDefaults) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_conflict_policy(mut self, on_conflict: ConflictPolicy) -> Self {
        self.on_conflict = on_conflict;
        self
    }
}

/// Raw start fields from a control surface, before defaults and validation
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    pub board_name: String,
    pub identifiers: IdentifierInput,
    pub root: Option<PathBuf>,
    pub connection: ConnectionParams,
    pub on_conflict: Option<ConflictPolicy>,
}

impl StartParams {
    pub fn new(board_name: impl Into<String>) -> Self {
        Self {
            board_name: board_name.into(),
            ..Default::default()
        }
    }

    /// Merge configuration defaults and validate
    ///
    /// Explicit values win over `defaults`. Fails before any filesystem or
    /// hardware access.
    pub fn resolve(self, defaults: &RequestDefaults) -> Result<StartRequest> {
        // Catalogue check first so a bad name is reported as such
        self.board_name.parse::<crate::catalog::BoardKind>()?;

        let identifiers = merged_identifiers(&self.identifiers, defaults).build()?;

        let root = self
            .root
            .or_else(|| defaults.root.clone())
            .ok_or_else(|| RecordError::invalid_identifier("bidsroot", "value is required"))?;

        let descriptor = BoardDescriptor::new(self.board_name)
            .with_connection(self.connection.or(&defaults.connection));

        Ok(StartRequest {
            descriptor,
            identifiers,
            root,
            metadata: defaults.metadata.clone(),
            on_conflict: self.on_conflict.unwrap_or_default(),
        })
    }

    /// Required fields still unset once `defaults` are applied
    pub fn missing_fields(&self, defaults: &RequestDefaults) -> Vec<&'static str> {
        let mut missing = merged_identifiers(&self.identifiers, defaults).missing_fields();
        if self.root.is_none() && defaults.root.is_none() {
            missing.push("bidsroot");
        }
        missing
    }
}

fn merged_identifiers(input: &IdentifierInput, defaults: &RequestDefaults) -> IdentifierInput {
    let mut merged = input.clone();
    if merged.task.is_none() {
        merged.task = defaults.task.clone();
    }
    if merged.data_type.is_none() {
        merged.data_type = defaults.data_type.clone();
    }
    if merged.modality.is_none() {
        merged.modality = defaults.modality.clone();
    }
    merged
}

/// A recording that has started
#[derive(Debug, Clone, Serialize)]
pub struct RecordingHandle {
    pub identity: BoardIdentity,
    pub status: BoardStatus,
    pub target: RecordingTarget,
}

impl RecordingHandle {
    pub fn data_path(&self) -> PathBuf {
        self.target.data_path()
    }
}

/// Start, stop and query recordings by board identity
pub struct SessionController<E: EventSink = NoOpEventSink> {
    registry: SessionRegistry,
    identity_policy: BoardIdentityPolicy,
    events: E,
}

impl SessionController<NoOpEventSink> {
    pub fn new(drivers: DriverRegistry, identity_policy: BoardIdentityPolicy) -> Self {
        Self::with_events(drivers, identity_policy, NoOpEventSink)
    }
}

impl<E: EventSink> SessionController<E> {
    pub fn with_events(drivers: DriverRegistry, identity_policy: BoardIdentityPolicy, events: E) -> Self {
        Self {
            registry: SessionRegistry::new(drivers),
            identity_policy,
            events,
        }
    }

    pub fn identity_policy(&self) -> BoardIdentityPolicy {
        self.identity_policy
    }

    pub fn identity_for(&self, descriptor: &BoardDescriptor) -> BoardIdentity {
        self.identity_policy.identity(descriptor)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Connect if needed and start recording
    ///
    /// The target is checked while the board's lease is held, so a second
    /// start for the same board always sees the first one's outcome. A failed
    /// start releases the board again, so no entry outlives it.
    pub async fn start_recording(&self, request: StartRequest) -> Result<RecordingHandle> {
        let StartRequest {
            descriptor,
            identifiers,
            root,
            metadata,
            on_conflict,
        } = request;

        descriptor.kind()?;
        let identity = self.identity_for(&descriptor);

        let mut lease = self.registry.acquire(&identity, &descriptor).await?;

        let target = compute_target(&identifiers, &root);
        if let Err(e) = target.check_available(on_conflict) {
            if let Err(release_err) = self.registry.release_leased(lease).await {
                tracing::warn!("Release of {} after rejected start failed: {release_err}", identity);
            }
            return Err(e);
        }

        let spec = StartSpec {
            identifiers,
            target,
            metadata,
            on_conflict,
        };

        match lease.run(move |session| session.start(spec)).await {
            Ok(target) => {
                let status = lease.status();
                drop(lease);

                let event = RecordingStarted {
                    board: identity.clone(),
                    data_file: target.data_path(),
                };
                if let Err(e) = self.events.emit_recording_started(&event).await {
                    tracing::warn!("Failed to emit recording started event: {e}");
                }
                Ok(RecordingHandle {
                    identity,
                    status,
                    target,
                })
            }
            Err(e) => {
                tracing::warn!("Start on {} failed: {e}", identity);
                if let Err(release_err) = self.registry.release_leased(lease).await {
                    tracing::warn!("Release of {} after failed start failed: {release_err}", identity);
                }
                Err(e)
            }
        }
    }

    /// Stop the active recording of `identity` and release the board
    ///
    /// Returns the status the board reported once the stream stopped.
    pub async fn stop_recording(&self, identity: &BoardIdentity) -> Result<BoardStatus> {
        let mut lease = self.registry.lease_existing(identity).await?;
        if !lease.status().is_recording {
            return Err(RecordError::NotRecording(identity.to_string()));
        }

        let stopped = lease.run(|session| session.stop()).await;
        let status = lease.status();
        let released = self.registry.release_leased(lease).await;
        let outcome = stopped?;
        if let Err(e) = released {
            tracing::warn!("Release of {} after stop failed: {e}", identity);
        }

        let event = RecordingStopped {
            board: identity.clone(),
            data_file: outcome.target.data_path(),
            samples_written: outcome.samples_written,
            started_at: outcome.started_at,
            stopped_at: outcome.stopped_at,
        };
        if let Err(e) = self.events.emit_recording_stopped(&event).await {
            tracing::warn!("Failed to emit recording stopped event: {e}");
        }
        if let Err(e) = self.events.emit_board_released(identity).await {
            tracing::warn!("Failed to emit board released event: {e}");
        }

        Ok(status)
    }

    /// Current status, or the not-connected default for unknown identities
    pub async fn query_status(&self, identity: &BoardIdentity) -> BoardStatus {
        self.registry
            .status(identity)
            .await
            .unwrap_or_else(|| BoardStatus::not_connected(identity.board_name()))
    }

    /// Connect to a board, report its status and release it again
    ///
    /// A board that is already recording is reported without being touched.
    pub async fn probe(&self, descriptor: &BoardDescriptor) -> Result<BoardStatus> {
        descriptor.kind()?;
        let identity = self.identity_for(descriptor);
        let lease = match self.registry.acquire(&identity, descriptor).await {
            Ok(lease) => lease,
            Err(RecordError::AlreadyRecording(_)) => return Ok(self.query_status(&identity).await),
            Err(e) => return Err(e),
        };
        let status = lease.status();
        self.registry.release_leased(lease).await?;
        Ok(status)
    }

    /// Status of every board with a session
    pub async fn list(&self) -> Vec<(BoardIdentity, BoardStatus)> {
        self.registry.snapshot().await
    }

    /// Stop every recording and release every board
    pub async fn shutdown(&self) -> Result<()> {
        self.registry.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BoardKind;
    use crate::synthetic::SyntheticDriver;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn controller() -> SessionController {
        SessionController::new(
            DriverRegistry::empty().with_driver(
                BoardKind::SyntheticBoard,
                Arc::new(SyntheticDriver::new(Duration::from_millis(5))),
            ),
            BoardIdentityPolicy::Name,
        )
    }

    fn input() -> IdentifierInput {
        IdentifierInput {
            sub: Some("001".into()),
            ses: Some("testSession".into()),
            task: Some("myExperiment".into()),
            run: Some("001".into()),
            modality: Some("eeg".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_prefers_explicit_values() {
        let defaults = RequestDefaults {
            root: Some(PathBuf::from("/config/root")),
            connection: ConnectionParams {
                serial_port: Some("/dev/ttyUSB0".into()),
                timeout: Some(10),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut params = StartParams::new("CYTON_BOARD");
        params.identifiers = input();
        params.root = Some(PathBuf::from("/explicit"));
        params.connection.serial_port = Some("/dev/ttyACM0".into());

        let request = params.resolve(&defaults).unwrap();
        assert_eq!(request.root, PathBuf::from("/explicit"));
        assert_eq!(request.descriptor.connection.serial_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(request.descriptor.connection.timeout, Some(10));
        assert_eq!(request.identifiers.data_type(), "eeg");
        assert_eq!(request.on_conflict, ConflictPolicy::Abort);
    }

    #[test]
    fn test_resolve_uses_config_task_and_root() {
        let defaults = RequestDefaults {
            task: Some("rest".into()),
            root: Some(PathBuf::from("/data")),
            ..Default::default()
        };
        let mut params = StartParams::new("SYNTHETIC_BOARD");
        params.identifiers = IdentifierInput {
            task: None,
            ..input()
        };
        let request = params.resolve(&defaults).unwrap();
        assert_eq!(request.identifiers.task(), "rest");
        assert_eq!(request.root, PathBuf::from("/data"));
    }

    #[test]
    fn test_missing_fields_after_defaults() {
        let mut params = StartParams::new("SYNTHETIC_BOARD");
        params.identifiers.sub = Some("001".into());
        assert_eq!(
            params.missing_fields(&RequestDefaults::default()),
            vec!["ses", "task", "run", "modality", "bidsroot"]
        );

        let defaults = RequestDefaults {
            task: Some("rest".into()),
            root: Some(PathBuf::from("/data")),
            modality: Some("eeg".into()),
            ..Default::default()
        };
        assert_eq!(params.missing_fields(&defaults), vec!["ses", "run"]);
    }

    #[test]
    fn test_resolve_requires_root() {
        let mut params = StartParams::new("SYNTHETIC_BOARD");
        params.identifiers = input();
        let err = params.resolve(&RequestDefaults::default()).unwrap_err();
        assert_eq!(
            err,
            RecordError::InvalidIdentifier {
                field: "bidsroot".into(),
                reason: "value is required".into()
            }
        );
    }

    #[test]
    fn test_resolve_unknown_board() {
        let mut params = StartParams::new("TOASTER");
        params.identifiers = input();
        params.root = Some(PathBuf::from("/data"));
        let err = params.resolve(&RequestDefaults::default()).unwrap_err();
        assert_eq!(err, RecordError::UnknownBoard("TOASTER".into()));
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = TempDir::new().unwrap();
        let controller = controller();
        let descriptor = BoardDescriptor::new("SYNTHETIC_BOARD");
        let identity = controller.identity_for(&descriptor);
        let request = StartRequest::new(descriptor, input().build().unwrap(), dir.path());

        let handle = controller.start_recording(request).await.unwrap();
        assert!(handle.status.is_recording);
        assert!(controller.query_status(&identity).await.is_recording);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = controller.stop_recording(&identity).await.unwrap();
        assert!(!status.is_recording);
        assert!(status.is_ready);
        assert!(handle.data_path().is_file());
        assert!(controller.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_releases_board() {
        let dir = TempDir::new().unwrap();
        let controller = controller();
        let descriptor = BoardDescriptor::new("SYNTHETIC_BOARD");
        let identity = controller.identity_for(&descriptor);
        let ids = input().build().unwrap();

        let target = compute_target(&ids, dir.path());
        target.create_dirs().unwrap();
        std::fs::write(target.data_path(), "taken").unwrap();

        let err = controller
            .start_recording(StartRequest::new(descriptor, ids, dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "path_conflict");
        assert!(controller.registry().status(&identity).await.is_none());
        assert_eq!(std::fs::read_to_string(target.data_path()).unwrap(), "taken");
    }

    #[tokio::test]
    async fn test_probe_connects_and_releases() {
        let controller = controller();
        let status = controller
            .probe(&BoardDescriptor::new("SYNTHETIC_BOARD"))
            .await
            .unwrap();
        assert!(status.is_ready);
        assert!(!status.is_recording);
        assert!(controller.list().await.is_empty());

        let err = controller
            .probe(&BoardDescriptor::new("GANGLION_BOARD"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection_error");
    }

    #[tokio::test]
    async fn test_stop_unknown_board() {
        let controller = controller();
        let identity = BoardIdentity::new("SYNTHETIC_BOARD");
        let err = controller.stop_recording(&identity).await.unwrap_err();
        assert_eq!(err, RecordError::NotRecording("SYNTHETIC_BOARD".into()));
    }

    #[tokio::test]
    async fn test_query_unknown_board() {
        let controller = controller();
        let status = controller.query_status(&BoardIdentity::new("CYTON_BOARD")).await;
        assert_eq!(status, BoardStatus::not_connected("CYTON_BOARD"));
    }
}
