//! Board catalogue
//!
//! Static facts about the boards SenseRecord knows by name: vendor board id,
//! sampling rate and EEG channel layout. Names follow the vendor SDK's
//! `BoardIds` spelling so configs written for the SDK keep working.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RecordError;

/// A board model known to the catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardKind {
    SyntheticBoard,
    CytonBoard,
    GanglionBoard,
    CytonDaisyBoard,
    BrainbitBoard,
    UnicornBoard,
}

/// Static description of a board model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardInfo {
    pub kind: BoardKind,
    /// Vendor SDK board id
    pub board_id: i32,
    /// Samples per second per channel
    pub sampling_rate: u32,
    pub eeg_channels: Vec<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
}

impl BoardInfo {
    pub fn channel_count(&self) -> usize {
        self.eeg_channels.len()
    }
}

const SYNTHETIC_CHANNELS: &[&str] = &[
    "Fz", "C3", "Cz", "C4", "Pz", "PO7", "Oz", "PO8", "F5", "F7", "F3", "F1", "F2", "F4", "F6",
    "F8",
];
const CYTON_CHANNELS: &[&str] = &["Fp1", "Fp2", "C3", "C4", "P7", "P8", "O1", "O2"];
const CYTON_DAISY_CHANNELS: &[&str] = &[
    "Fp1", "Fp2", "C3", "C4", "P7", "P8", "O1", "O2", "F7", "F8", "F3", "F4", "T7", "T8", "P3",
    "P4",
];
const GANGLION_CHANNELS: &[&str] = &["EXG1", "EXG2", "EXG3", "EXG4"];
const BRAINBIT_CHANNELS: &[&str] = &["T3", "T4", "O1", "O2"];
const UNICORN_CHANNELS: &[&str] = &["Fz", "C3", "Cz", "C4", "Pz", "PO7", "Oz", "PO8"];

impl BoardKind {
    pub const ALL: &'static [BoardKind] = &[
        BoardKind::SyntheticBoard,
        BoardKind::CytonBoard,
        BoardKind::GanglionBoard,
        BoardKind::CytonDaisyBoard,
        BoardKind::BrainbitBoard,
        BoardKind::UnicornBoard,
    ];

    /// Canonical board name, e.g. `SYNTHETIC_BOARD`
    pub fn name(&self) -> &'static str {
        match self {
            BoardKind::SyntheticBoard => "SYNTHETIC_BOARD",
            BoardKind::CytonBoard => "CYTON_BOARD",
            BoardKind::GanglionBoard => "GANGLION_BOARD",
            BoardKind::CytonDaisyBoard => "CYTON_DAISY_BOARD",
            BoardKind::BrainbitBoard => "BRAINBIT_BOARD",
            BoardKind::UnicornBoard => "UNICORN_BOARD",
        }
    }

    pub fn info(&self) -> BoardInfo {
        let (board_id, sampling_rate, channels, manufacturer, model) = match self {
            BoardKind::SyntheticBoard => (-1, 250, SYNTHETIC_CHANNELS, None, None),
            BoardKind::CytonBoard => (0, 250, CYTON_CHANNELS, Some("OpenBCI"), Some("Cyton")),
            BoardKind::GanglionBoard => {
                (1, 200, GANGLION_CHANNELS, Some("OpenBCI"), Some("Ganglion"))
            }
            BoardKind::CytonDaisyBoard => (
                2,
                125,
                CYTON_DAISY_CHANNELS,
                Some("OpenBCI"),
                Some("Cyton + Daisy"),
            ),
            BoardKind::BrainbitBoard => {
                (7, 250, BRAINBIT_CHANNELS, Some("BrainBit"), Some("BrainBit"))
            }
            BoardKind::UnicornBoard => (
                8,
                250,
                UNICORN_CHANNELS,
                Some("g.tec"),
                Some("Unicorn Hybrid Black"),
            ),
        };

        BoardInfo {
            kind: *self,
            board_id,
            sampling_rate,
            eeg_channels: channels.iter().map(|c| c.to_string()).collect(),
            manufacturer: manufacturer.map(String::from),
            model_name: model.map(String::from),
        }
    }
}

impl fmt::Display for BoardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BoardKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BoardKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| RecordError::UnknownBoard(s.to_string()))
    }
}

/// Whether `name` is a known board name
pub fn valid_board_name(name: &str) -> bool {
    name.parse::<BoardKind>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() {
        for kind in BoardKind::ALL {
            assert_eq!(kind.name().parse::<BoardKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn test_unknown_name() {
        let err = "NOT_A_BOARD".parse::<BoardKind>().unwrap_err();
        assert_eq!(err, RecordError::UnknownBoard("NOT_A_BOARD".into()));
        assert!(!valid_board_name("synthetic_board"));
    }

    #[test]
    fn test_synthetic_info() {
        let info = BoardKind::SyntheticBoard.info();
        assert_eq!(info.board_id, -1);
        assert_eq!(info.sampling_rate, 250);
        assert_eq!(info.channel_count(), 16);
    }

    #[test]
    fn test_serde_names_match_display() {
        let json = serde_json::to_string(&BoardKind::CytonDaisyBoard).unwrap();
        assert_eq!(json, "\"CYTON_DAISY_BOARD\"");
    }
}
