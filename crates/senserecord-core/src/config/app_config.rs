use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::defaults;
use crate::board::{BoardIdentityPolicy, ConnectionParams};
use crate::catalog::valid_board_name;
use crate::error::{RecordError, Result};
use crate::metadata::{CapMetadata, DeviceMetadata, MetadataDefaults, TaskMetadata};

/// Application configuration
///
/// Loaded from YAML. Every section is optional when no file is found; a file
/// that is found must pass [`AppConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// How descriptors map to registry identities
    #[serde(default)]
    pub board_identity: BoardIdentityPolicy,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Experiment definitions keyed by task label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<BTreeMap<String, TaskConfig>>,

    /// File this configuration was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    defaults::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    defaults::DEFAULT_PORT
}

/// One experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    pub bidsroot: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
    pub instructions: Option<String>,
    pub institution: Option<String>,
    pub boards: Option<BTreeMap<String, BoardConfig>>,
}

/// One board used by an experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardConfig {
    pub name: Option<String>,
    pub data_type: Option<String>,
    pub modality: Option<String>,
    #[serde(default)]
    pub params: ConnectionParams,
    pub manufacturer: Option<String>,
    pub modelname: Option<String>,
    #[serde(default)]
    pub cap: CapMetadata,
}

/// Values a start request inherits from configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDefaults {
    /// Task key the defaults came from
    pub task: Option<String>,
    pub root: Option<PathBuf>,
    pub connection: ConnectionParams,
    pub data_type: Option<String>,
    pub modality: Option<String>,
    pub metadata: MetadataDefaults,
}

impl AppConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str, origin: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(contents)
            .map_err(|e| RecordError::ConfigError(format!("{origin}: {e}")))?;
        config.validate(origin)?;
        Ok(config)
    }

    /// Load and validate the file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RecordError::ConfigError(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let mut config = Self::from_yaml(&contents, &path.display().to_string())?;
        config.source = Some(path.to_path_buf());
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the explicit path, or the first config file found, or defaults
    ///
    /// An explicit path that cannot be read is an error; a missing discovered
    /// file is not.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        for candidate in Self::candidate_paths() {
            if candidate.is_file() {
                return Self::load(&candidate);
            }
        }
        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Config locations in lookup order
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(defaults::LOCAL_CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(
                dir.join(defaults::CONFIG_DIR_NAME)
                    .join(defaults::USER_CONFIG_FILE),
            );
        }
        paths
    }

    /// Check required keys and board names
    pub fn validate(&self, origin: &str) -> Result<()> {
        let tasks = self.tasks.as_ref().ok_or_else(|| {
            RecordError::ConfigError(format!(
                "Required root key 'tasks' is missing from the config file {origin}"
            ))
        })?;

        for (task, values) in tasks {
            if values.bidsroot.is_none() {
                return Err(RecordError::ConfigError(format!(
                    "Required key 'bidsroot' is missing from {task} section of config file {origin}"
                )));
            }
            let boards = values.boards.as_ref().ok_or_else(|| {
                RecordError::ConfigError(format!(
                    "Required key 'boards' is missing from {task} section of config file {origin}"
                ))
            })?;
            for (board, settings) in boards {
                match settings.name.as_deref() {
                    None => {
                        return Err(RecordError::ConfigError(format!(
                            "Required key 'name' is missing from {board} section of {task} in config file {origin}"
                        )))
                    }
                    Some(name) if !valid_board_name(name) => {
                        return Err(RecordError::ConfigError(format!(
                            "Boardname {name} is unknown in {board} section of {task} in config file {origin}"
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.as_ref().and_then(|tasks| tasks.get(name))
    }

    /// Defaults for a start request on `board_name`
    ///
    /// Looks in `task` first; without a task (or with one the file does not
    /// define) the first task using the board wins.
    pub fn defaults_for(&self, task: Option<&str>, board_name: &str) -> Result<RequestDefaults> {
        let tasks = match &self.tasks {
            Some(tasks) => tasks,
            None => return Ok(RequestDefaults::default()),
        };

        let scoped = task.and_then(|t| tasks.get_key_value(t));
        let found = match scoped {
            Some((key, values)) => find_board(values, board_name).map(|b| (key, values, b)),
            None => tasks
                .iter()
                .find_map(|(key, values)| find_board(values, board_name).map(|b| (key, values, b))),
        };

        match found {
            Some((key, values, board)) => Ok(RequestDefaults {
                task: Some(key.clone()),
                root: values.bidsroot.as_deref().map(expand_path).transpose()?,
                connection: board.params.clone(),
                data_type: board.data_type.clone(),
                modality: board.modality.clone(),
                metadata: MetadataDefaults {
                    task: task_metadata(values),
                    board: DeviceMetadata {
                        manufacturer: board.manufacturer.clone(),
                        modelname: board.modelname.clone(),
                        cap: board.cap.clone(),
                    },
                },
            }),
            None => {
                // A task without this board still provides root and task metadata
                match scoped {
                    Some((key, values)) => Ok(RequestDefaults {
                        task: Some(key.clone()),
                        root: values.bidsroot.as_deref().map(expand_path).transpose()?,
                        metadata: MetadataDefaults {
                            task: task_metadata(values),
                            board: DeviceMetadata::default(),
                        },
                        ..Default::default()
                    }),
                    None => Ok(RequestDefaults::default()),
                }
            }
        }
    }

    /// Board names referenced by the configuration, deduplicated and sorted
    pub fn configured_boards(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .iter()
            .flat_map(|tasks| tasks.values())
            .flat_map(|task| task.boards.iter().flat_map(|b| b.values()))
            .filter_map(|board| board.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn task_metadata(task: &TaskConfig) -> TaskMetadata {
    TaskMetadata {
        label: task.label.clone(),
        description: task.description.clone(),
        instructions: task.instructions.clone(),
        institution: task.institution.clone(),
    }
}

fn find_board<'a>(task: &'a TaskConfig, board_name: &str) -> Option<&'a BoardConfig> {
    task.boards
        .as_ref()?
        .values()
        .find(|board| board.name.as_deref() == Some(board_name))
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| RecordError::ConfigError(format!("Cannot expand path {raw}: {e}")))
}
