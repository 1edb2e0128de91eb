//! BIDS-style naming
//!
//! Maps [`SessionIdentifiers`] and a root directory to the paths of a
//! recording's data and metadata files. Raw CSV is source data, so everything
//! lands under `{root}/sourcedata/`.
//!
//! ```text
//! {root}/sourcedata/sub-{sub}/ses-{ses}/{data_type}/
//!     sub-{sub}_ses-{ses}_task-{task}[_acq-{acq}]_run-{run}_{modality}.csv
//!     sub-{sub}_ses-{ses}_task-{task}[_acq-{acq}]_run-{run}_{modality}.json
//!     sub-{sub}_ses-{ses}_task-{task}[_acq-{acq}]_run-{run}_channels.tsv
//! ```

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::board::ConflictPolicy;
use crate::error::{RecordError, Result};
use crate::identifiers::SessionIdentifiers;

/// Directory under the root that holds raw recordings
pub const SOURCE_DATA_DIR: &str = "sourcedata";

/// Where one recording's files go
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingTarget {
    pub root_directory: PathBuf,
    /// `sourcedata/sub-{sub}`
    pub relative_subject_dir: PathBuf,
    /// `sourcedata/sub-{sub}/ses-{ses}`
    pub relative_session_dir: PathBuf,
    /// `sourcedata/sub-{sub}/ses-{ses}/{data_type}`
    pub data_type_dir: PathBuf,
    pub filename: String,
    /// Sidecar JSON first, channel table second
    pub metadata_filenames: Vec<String>,
}

/// Compute the recording target for `identifiers` under `root`
///
/// Pure: touches no filesystem state.
pub fn compute_target(identifiers: &SessionIdentifiers, root: &Path) -> RecordingTarget {
    let subject_dir = PathBuf::from(SOURCE_DATA_DIR).join(format!("sub-{}", identifiers.subject()));
    let session_dir = subject_dir.join(format!("ses-{}", identifiers.session()));
    let data_type_dir = session_dir.join(identifiers.data_type());

    let entities = entity_prefix(identifiers);
    let stem = format!("{entities}_{}", identifiers.modality());

    RecordingTarget {
        root_directory: root.to_path_buf(),
        relative_subject_dir: subject_dir,
        relative_session_dir: session_dir,
        data_type_dir,
        filename: format!("{stem}.csv"),
        metadata_filenames: vec![format!("{stem}.json"), format!("{entities}_channels.tsv")],
    }
}

/// `sub-X_ses-Y_task-Z[_acq-A]_run-R`, in BIDS entity order
fn entity_prefix(identifiers: &SessionIdentifiers) -> String {
    let mut prefix = format!(
        "sub-{}_ses-{}_task-{}",
        identifiers.subject(),
        identifiers.session(),
        identifiers.task()
    );
    if let Some(acq) = identifiers.acquisition() {
        prefix.push_str(&format!("_acq-{acq}"));
    }
    prefix.push_str(&format!("_run-{}", identifiers.run()));
    prefix
}

impl RecordingTarget {
    /// Absolute (or root-relative) directory holding all files of the recording
    pub fn data_dir(&self) -> PathBuf {
        self.root_directory.join(&self.data_type_dir)
    }

    pub fn data_path(&self) -> PathBuf {
        self.data_dir().join(&self.filename)
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.data_dir().join(&self.metadata_filenames[0])
    }

    pub fn channels_path(&self) -> PathBuf {
        self.data_dir().join(&self.metadata_filenames[1])
    }

    pub fn metadata_paths(&self) -> Vec<PathBuf> {
        let dir = self.data_dir();
        self.metadata_filenames.iter().map(|f| dir.join(f)).collect()
    }

    /// Check the root exists and the recording's files are free under `policy`
    ///
    /// `channels.tsv` carries no modality entity, so under `Abort` an existing
    /// channel table of another modality in the same directory also conflicts.
    pub fn check_available(&self, policy: ConflictPolicy) -> Result<()> {
        if !self.root_directory.is_dir() {
            return Err(RecordError::IoError(format!(
                "Non-existent base directory: {}. Check the config or create the directory",
                self.root_directory.display()
            )));
        }
        if policy != ConflictPolicy::Abort {
            return Ok(());
        }
        let taken = std::iter::once(self.data_path())
            .chain(self.metadata_paths())
            .find(|path| path.exists());
        match taken {
            Some(path) => Err(RecordError::PathConflict(path.display().to_string())),
            None => Ok(()),
        }
    }

    /// Create the data directory and its parents
    pub fn create_dirs(&self) -> Result<()> {
        let dir = self.data_dir();
        std::fs::create_dir_all(&dir).map_err(|e| {
            RecordError::IoError(format!("Failed to create {}: {e}", dir.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids() -> SessionIdentifiers {
        SessionIdentifiers::new("001", "testSession", "myExperiment", "001", "eeg", "eeg").unwrap()
    }

    #[test]
    fn test_reference_scenario() {
        let target = compute_target(&ids(), Path::new("./"));
        assert_eq!(
            target.data_path(),
            PathBuf::from(
                "./sourcedata/sub-001/ses-testSession/eeg/sub-001_ses-testSession_task-myExperiment_run-001_eeg.csv"
            )
        );
        assert_eq!(
            target.relative_session_dir,
            PathBuf::from("sourcedata/sub-001/ses-testSession")
        );
    }

    #[test]
    fn test_metadata_filenames() {
        let target = compute_target(&ids(), Path::new("/data"));
        assert_eq!(
            target.metadata_filenames,
            vec![
                "sub-001_ses-testSession_task-myExperiment_run-001_eeg.json".to_string(),
                "sub-001_ses-testSession_task-myExperiment_run-001_channels.tsv".to_string(),
            ]
        );
        assert_eq!(target.metadata_paths()[0], target.sidecar_path());
    }

    #[test]
    fn test_deterministic() {
        let a = compute_target(&ids(), Path::new("/data"));
        let b = compute_target(&ids(), Path::new("/data"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_acquisition_entity_order() {
        let ids = ids().with_acquisition("highres").unwrap();
        let target = compute_target(&ids, Path::new("/data"));
        assert_eq!(
            target.filename,
            "sub-001_ses-testSession_task-myExperiment_acq-highres_run-001_eeg.csv"
        );
    }

    #[test]
    fn test_data_type_and_modality_split() {
        let ids = SessionIdentifiers::new("02", "a", "rest", "1", "beh", "physio").unwrap();
        let target = compute_target(&ids, Path::new("/data"));
        assert_eq!(target.data_type_dir, PathBuf::from("sourcedata/sub-02/ses-a/beh"));
        assert!(target.filename.ends_with("_physio.csv"));
    }

    #[test]
    fn test_check_available() {
        let dir = TempDir::new().unwrap();
        let target = compute_target(&ids(), dir.path());
        target.check_available(ConflictPolicy::Abort).unwrap();

        target.create_dirs().unwrap();
        std::fs::write(target.data_path(), "old").unwrap();
        let err = target.check_available(ConflictPolicy::Abort).unwrap_err();
        assert_eq!(err.kind(), "path_conflict");
        target.check_available(ConflictPolicy::Overwrite).unwrap();
    }

    #[test]
    fn test_channel_table_shared_across_modalities() {
        let dir = TempDir::new().unwrap();
        let eeg = compute_target(&ids(), dir.path());
        let emg = compute_target(
            &SessionIdentifiers::new("001", "testSession", "myExperiment", "001", "eeg", "emg")
                .unwrap(),
            dir.path(),
        );
        assert_eq!(eeg.channels_path(), emg.channels_path());

        eeg.create_dirs().unwrap();
        std::fs::write(eeg.channels_path(), "name\ttype\n").unwrap();
        let err = emg.check_available(ConflictPolicy::Abort).unwrap_err();
        assert_eq!(
            err,
            RecordError::PathConflict(emg.channels_path().display().to_string())
        );
        emg.check_available(ConflictPolicy::Append).unwrap();
    }

    #[test]
    fn test_missing_root() {
        let target = compute_target(&ids(), Path::new("/definitely/not/here"));
        let err = target.check_available(ConflictPolicy::Abort).unwrap_err();
        assert_eq!(err.kind(), "io_error");
    }
}
