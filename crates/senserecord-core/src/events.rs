//! Event Sink Trait
//!
//! This module provides the EventSink trait for decoupling recording
//! notifications from the control surface. Implementations can print to
//! stdout (CLI), stay silent (tests, HTTP server) or forward elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

use crate::board::BoardIdentity;

/// Payload of a recording started event
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStarted {
    pub board: BoardIdentity,
    pub data_file: PathBuf,
}

/// Payload of a recording stopped event
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStopped {
    pub board: BoardIdentity,
    pub data_file: PathBuf,
    pub samples_written: u64,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

/// Event sink for emitting events to listeners
///
/// This trait abstracts event emission so the session controller can work
/// with different frontends (CLI, HTTP server, tests, etc.)
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit a recording started event
    async fn emit_recording_started(&self, event: &RecordingStarted) -> Result<(), String>;

    /// Emit a recording stopped event
    async fn emit_recording_stopped(&self, event: &RecordingStopped) -> Result<(), String>;

    /// Emit a board released event
    async fn emit_board_released(&self, board: &BoardIdentity) -> Result<(), String>;
}

/// No-op event sink for testing or server mode without event emission
#[derive(Debug, Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit_recording_started(&self, _event: &RecordingStarted) -> Result<(), String> {
        Ok(())
    }

    async fn emit_recording_stopped(&self, _event: &RecordingStopped) -> Result<(), String> {
        Ok(())
    }

    async fn emit_board_released(&self, _board: &BoardIdentity) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout event sink for CLI mode - prints events to console
#[derive(Debug, Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn emit_recording_started(&self, event: &RecordingStarted) -> Result<(), String> {
        if self.json_output {
            print_json("recording_started", event)
        } else {
            println!(
                "Recording started: {} -> {}",
                event.board,
                event.data_file.display()
            );
            Ok(())
        }
    }

    async fn emit_recording_stopped(&self, event: &RecordingStopped) -> Result<(), String> {
        if self.json_output {
            print_json("recording_stopped", event)
        } else {
            println!(
                "Recording stopped: {} ({} samples in {})",
                event.board,
                event.samples_written,
                format_duration(event.stopped_at - event.started_at)
            );
            Ok(())
        }
    }

    async fn emit_board_released(&self, board: &BoardIdentity) -> Result<(), String> {
        if self.json_output {
            print_json("board_released", board)
        } else {
            println!("Board released: {board}");
            Ok(())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(event_name: &str, payload: &T) -> Result<(), String> {
    let line = serde_json::json!({ "event": event_name, "payload": payload });
    println!("{line}");
    Ok(())
}

fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    let secs = millis / 1000;
    let mins = secs / 60;
    let hours = mins / 60;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        hours,
        mins % 60,
        secs % 60,
        millis % 1000
    )
}
