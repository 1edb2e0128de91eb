//! Interactive prompts for the `start` command

use dialoguer::{theme::ColorfulTheme, Confirm, Input};
use std::path::PathBuf;

use senserecord_core::{RecordError, Result, StartParams};

fn prompt_error(e: dialoguer::Error) -> RecordError {
    RecordError::IoError(format!("Prompt failed: {e}"))
}

fn prompt_label(field: &str) -> &'static str {
    match field {
        "sub" => "Subject label",
        "ses" => "Session label",
        "task" => "Task label",
        "run" => "Run number",
        "data_type" => "Data type (e.g. eeg)",
        "modality" => "Modality (e.g. eeg)",
        "bidsroot" => "BIDS root directory",
        _ => "Value",
    }
}

/// Store a prompted value into the named field
pub fn assign(params: &mut StartParams, field: &str, value: String) {
    let ids = &mut params.identifiers;
    match field {
        "sub" => ids.sub = Some(value),
        "ses" => ids.ses = Some(value),
        "task" => ids.task = Some(value),
        "run" => ids.run = Some(value),
        "data_type" => ids.data_type = Some(value),
        "modality" => ids.modality = Some(value),
        "bidsroot" => params.root = Some(PathBuf::from(value)),
        other => tracing::debug!("Ignoring prompt for unknown field {other}"),
    }
}

/// Ask for every field in `missing`
pub fn fill_missing(params: &mut StartParams, missing: &[&str]) -> Result<()> {
    let theme = ColorfulTheme::default();
    for field in missing {
        let value: String = Input::with_theme(&theme)
            .with_prompt(prompt_label(field))
            .interact_text()
            .map_err(prompt_error)?;
        assign(params, field, value.trim().to_string());
    }
    Ok(())
}

/// Ask for the board to record from
pub fn board_name() -> Result<String> {
    let value: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Enter your board name")
        .interact_text()
        .map_err(prompt_error)?;
    Ok(value.trim().to_string())
}

/// Ask whether to stop the running recording
pub fn confirm_stop() -> Result<bool> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Stop the recording?")
        .default(false)
        .interact()
        .map_err(prompt_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_fields() {
        let mut params = StartParams::new("SYNTHETIC_BOARD");
        assign(&mut params, "sub", "001".into());
        assign(&mut params, "modality", "eeg".into());
        assign(&mut params, "bidsroot", "/data".into());
        assign(&mut params, "bogus", "x".into());

        assert_eq!(params.identifiers.sub.as_deref(), Some("001"));
        assert_eq!(params.identifiers.modality.as_deref(), Some("eeg"));
        assert_eq!(params.root, Some(PathBuf::from("/data")));
    }

    #[test]
    fn test_every_missing_field_has_a_label() {
        for field in ["sub", "ses", "task", "run", "modality", "bidsroot"] {
            assert_ne!(prompt_label(field), "Value");
        }
    }
}
