//! Hardware capability interface
//!
//! Everything SenseRecord needs from a vendor SDK is expressed by the [`Board`]
//! and [`BoardDriver`] traits. Calls are synchronous and may block on device
//! I/O; async callers are expected to move them onto a blocking thread.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{BoardInfo, BoardKind};
use crate::error::{RecordError, Result};
use crate::synthetic::SyntheticDriver;

/// Transport parameters for reaching a board
///
/// Field names follow the vendor SDK's input-params struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_protocol: Option<u8>,
    /// Connection timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ConnectionParams {
    /// Fill unset fields from `defaults`
    pub fn or(mut self, defaults: &ConnectionParams) -> Self {
        fn fill<T: Clone>(slot: &mut Option<T>, default: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(default);
            }
        }
        fill(&mut self.serial_port, &defaults.serial_port);
        fill(&mut self.ip_address, &defaults.ip_address);
        fill(&mut self.ip_port, &defaults.ip_port);
        fill(&mut self.ip_protocol, &defaults.ip_protocol);
        fill(&mut self.timeout, &defaults.timeout);
        fill(&mut self.mac_address, &defaults.mac_address);
        fill(&mut self.serial_number, &defaults.serial_number);
        fill(&mut self.other_info, &defaults.other_info);
        fill(&mut self.file, &defaults.file);
        self
    }

    /// Populated fields as sorted `key=value` pairs
    fn canonical(&self) -> String {
        let mut fields = BTreeMap::new();
        if let Some(v) = &self.serial_port {
            fields.insert("serial_port", v.clone());
        }
        if let Some(v) = &self.ip_address {
            fields.insert("ip_address", v.clone());
        }
        if let Some(v) = self.ip_port {
            fields.insert("ip_port", v.to_string());
        }
        if let Some(v) = self.ip_protocol {
            fields.insert("ip_protocol", v.to_string());
        }
        if let Some(v) = &self.mac_address {
            fields.insert("mac_address", v.clone());
        }
        if let Some(v) = &self.serial_number {
            fields.insert("serial_number", v.clone());
        }
        if let Some(v) = &self.other_info {
            fields.insert("other_info", v.clone());
        }
        if let Some(v) = &self.file {
            fields.insert("file", v.clone());
        }
        fields
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A board name plus how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDescriptor {
    pub board_name: String,
    #[serde(default)]
    pub connection: ConnectionParams,
}

impl BoardDescriptor {
    pub fn new(board_name: impl Into<String>) -> Self {
        Self {
            board_name: board_name.into(),
            connection: ConnectionParams::default(),
        }
    }

    pub fn with_connection(mut self, connection: ConnectionParams) -> Self {
        self.connection = connection;
        self
    }

    /// Resolve the board name against the catalogue
    pub fn kind(&self) -> Result<BoardKind> {
        self.board_name.parse()
    }
}

/// How descriptors map to registry identities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardIdentityPolicy {
    /// The board name alone identifies the device
    #[default]
    Name,
    /// Board name plus transport parameters, for devices that accept several connections
    NameAndConnection,
}

impl BoardIdentityPolicy {
    pub fn identity(&self, descriptor: &BoardDescriptor) -> BoardIdentity {
        match self {
            BoardIdentityPolicy::Name => BoardIdentity(descriptor.board_name.clone()),
            BoardIdentityPolicy::NameAndConnection => {
                let params = descriptor.connection.canonical();
                if params.is_empty() {
                    BoardIdentity(descriptor.board_name.clone())
                } else {
                    BoardIdentity(format!("{}@{}", descriptor.board_name, params))
                }
            }
        }
    }
}

/// Registry key for one physical or synthetic device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardIdentity(String);

impl BoardIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The board name part of the identity
    pub fn board_name(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for BoardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an existing data file is treated when a recording starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Refuse to start (`PathConflict`)
    #[default]
    Abort,
    /// Truncate and rewrite the existing file
    Overwrite,
    /// Keep existing rows and append new samples
    Append,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "abort" => Ok(Self::Abort),
            "overwrite" => Ok(Self::Overwrite),
            "append" => Ok(Self::Append),
            other => Err(RecordError::ConfigError(format!(
                "unknown conflict policy '{other}' (expected abort, overwrite or append)"
            ))),
        }
    }
}

/// A block of samples, one row per sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBlock {
    /// Seconds since UNIX epoch for each row
    pub timestamps: Vec<f64>,
    /// `rows[i][c]` is channel `c` of sample `i`
    pub rows: Vec<Vec<f64>>,
}

/// CSV sink that owns the open data file while a stream runs
pub struct SampleSink {
    path: PathBuf,
    writer: csv::Writer<BufWriter<File>>,
    samples_written: u64,
}

impl SampleSink {
    /// Open the data file according to `policy`
    ///
    /// `Abort` uses `create_new`, so an existing file is reported as
    /// `PathConflict` without touching it.
    pub fn create(path: &Path, channels: &[String], policy: ConflictPolicy) -> Result<Self> {
        let mut options = std::fs::OpenOptions::new();
        let existed = path.exists();
        match policy {
            ConflictPolicy::Abort => options.write(true).create_new(true),
            ConflictPolicy::Overwrite => options.write(true).create(true).truncate(true),
            ConflictPolicy::Append => options.append(true).create(true),
        };

        let file = options.open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                RecordError::PathConflict(path.display().to_string())
            } else {
                RecordError::IoError(format!("Failed to open {}: {e}", path.display()))
            }
        })?;

        let mut writer = csv::Writer::from_writer(BufWriter::new(file));
        if !(policy == ConflictPolicy::Append && existed) {
            let mut header = vec!["sample_index".to_string(), "timestamp".to_string()];
            header.extend(channels.iter().cloned());
            writer.write_record(&header)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            samples_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Append a block of samples
    pub fn write_block(&mut self, block: &SampleBlock) -> Result<()> {
        for (timestamp, row) in block.timestamps.iter().zip(&block.rows) {
            let mut record = Vec::with_capacity(row.len() + 2);
            record.push(self.samples_written.to_string());
            record.push(format!("{timestamp:.6}"));
            record.extend(row.iter().map(|v| format!("{v:.6}")));
            self.writer.write_record(&record)?;
            self.samples_written += 1;
        }
        Ok(())
    }

    /// Flush buffered rows and sync the file to disk
    pub fn finish(self) -> Result<StreamSummary> {
        let path = self.path;
        let samples_written = self.samples_written;
        let buffered = self
            .writer
            .into_inner()
            .map_err(|e| RecordError::IoError(format!("Failed to flush {}: {e}", path.display())))?;
        let file = buffered
            .into_inner()
            .map_err(|e| RecordError::IoError(format!("Failed to flush {}: {e}", path.display())))?;
        file.sync_all()?;

        Ok(StreamSummary {
            path,
            samples_written,
        })
    }
}

impl fmt::Debug for SampleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSink")
            .field("path", &self.path)
            .field("samples_written", &self.samples_written)
            .finish()
    }
}

/// What a finished stream left on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub path: PathBuf,
    pub samples_written: u64,
}

/// One connected device, as seen through the vendor SDK
pub trait Board: Send {
    fn info(&self) -> &BoardInfo;

    /// Open the transport and check the device answers
    fn prepare(&mut self) -> Result<()>;

    /// Begin streaming samples into `sink`
    ///
    /// On error the sink is dropped and the file closed.
    fn start_stream(&mut self, sink: SampleSink) -> Result<()>;

    /// Stop streaming and hand back the sink
    ///
    /// A write failure during streaming is returned here as `IoError`.
    fn stop_stream(&mut self) -> Result<SampleSink>;

    /// Release the transport
    fn release(&mut self) -> Result<()>;
}

/// Creates [`Board`] handles for one board model
pub trait BoardDriver: Send + Sync {
    fn open(&self, descriptor: &BoardDescriptor, info: BoardInfo) -> Result<Box<dyn Board>>;
}

/// Maps catalogue entries to the drivers linked into this process
#[derive(Clone)]
pub struct DriverRegistry {
    drivers: HashMap<BoardKind, Arc<dyn BoardDriver>>,
}

impl DriverRegistry {
    /// Registry with no drivers
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Register or replace the driver for `kind`
    pub fn with_driver(mut self, kind: BoardKind, driver: Arc<dyn BoardDriver>) -> Self {
        self.drivers.insert(kind, driver);
        self
    }

    /// Open a board for `descriptor`
    pub fn open(&self, descriptor: &BoardDescriptor) -> Result<Box<dyn Board>> {
        let kind = descriptor.kind()?;
        let driver = self.drivers.get(&kind).ok_or_else(|| {
            RecordError::connection(
                &descriptor.board_name,
                "no driver is linked for this board; install the vendor SDK driver",
            )
        })?;
        driver.open(descriptor, kind.info())
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::empty().with_driver(BoardKind::SyntheticBoard, Arc::new(SyntheticDriver::default()))
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.drivers.keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("DriverRegistry").field("drivers", &kinds).finish()
    }
}
