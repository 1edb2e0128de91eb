//! Session identifiers
//!
//! The subject/session/task/run/data-type/modality labels that name a
//! recording. Labels are validated once, when [`SessionIdentifiers`] is built,
//! so everything downstream can rely on them being safe path components.

use serde::{Deserialize, Serialize};

use crate::error::{RecordError, Result};

/// Characters rejected because they separate or escape path components
const PATH_UNSAFE: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '.', '%'];

/// BIDS entity delimiters; a label containing one would collide with another tuple
const ENTITY_DELIMITERS: &[char] = &['_', '-'];

/// Validated labels identifying one recording
///
/// Immutable once built. Construct through [`IdentifierInput::build`] or
/// [`SessionIdentifiers::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentifiers {
    subject: String,
    session: String,
    task: String,
    run: String,
    data_type: String,
    modality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acquisition: Option<String>,
}

impl SessionIdentifiers {
    /// Validate and build identifiers with every field given explicitly
    pub fn new(
        subject: &str,
        session: &str,
        task: &str,
        run: &str,
        data_type: &str,
        modality: &str,
    ) -> Result<Self> {
        Ok(Self {
            subject: validate_label("sub", subject)?,
            session: validate_label("ses", session)?,
            task: validate_label("task", task)?,
            run: validate_label("run", run)?,
            data_type: validate_label("data_type", data_type)?,
            modality: validate_label("modality", modality)?,
            acquisition: None,
        })
    }

    /// Attach a BIDS acquisition label (`acq-`)
    pub fn with_acquisition(mut self, acquisition: &str) -> Result<Self> {
        self.acquisition = Some(validate_label("acq", acquisition)?);
        Ok(self)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn run(&self) -> &str {
        &self.run
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn modality(&self) -> &str {
        &self.modality
    }

    pub fn acquisition(&self) -> Option<&str> {
        self.acquisition.as_deref()
    }
}

/// Raw identifier fields as they arrive from a prompt, CLI flag or query string
///
/// `data_type` and `modality` default to each other when only one is given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifierInput {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub ses: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub acq: Option<String>,
}

impl IdentifierInput {
    /// Apply defaults and validate
    pub fn build(&self) -> Result<SessionIdentifiers> {
        let data_type = non_blank(&self.data_type).or_else(|| non_blank(&self.modality));
        let modality = non_blank(&self.modality).or_else(|| non_blank(&self.data_type));

        let ids = SessionIdentifiers::new(
            required("sub", &self.sub)?,
            required("ses", &self.ses)?,
            required("task", &self.task)?,
            required("run", &self.run)?,
            data_type.ok_or_else(|| {
                RecordError::invalid_identifier("data_type", "neither data_type nor modality given")
            })?,
            modality.ok_or_else(|| {
                RecordError::invalid_identifier("modality", "neither modality nor data_type given")
            })?,
        )?;

        match non_blank(&self.acq) {
            Some(acq) => ids.with_acquisition(acq),
            None => Ok(ids),
        }
    }

    /// Names of required fields that have no value yet
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("sub", &self.sub),
            ("ses", &self.ses),
            ("task", &self.task),
            ("run", &self.run),
        ] {
            if non_blank(value).is_none() {
                missing.push(name);
            }
        }
        if non_blank(&self.data_type).is_none() && non_blank(&self.modality).is_none() {
            missing.push("modality");
        }
        missing
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str> {
    non_blank(value).ok_or_else(|| RecordError::invalid_identifier(field, "value is required"))
}

/// Check a single label and return its owned form
pub fn validate_label(field: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(RecordError::invalid_identifier(field, "value is empty"));
    }

    for c in value.chars() {
        if PATH_UNSAFE.contains(&c) {
            return Err(RecordError::invalid_identifier(
                field,
                format!("contains path-unsafe character '{c}'"),
            ));
        }
        if ENTITY_DELIMITERS.contains(&c) {
            return Err(RecordError::invalid_identifier(
                field,
                format!("contains BIDS delimiter '{c}'"),
            ));
        }
        if c.is_whitespace() || c.is_control() {
            return Err(RecordError::invalid_identifier(
                field,
                "contains whitespace or control characters",
            ));
        }
        if !c.is_ascii_alphanumeric() {
            return Err(RecordError::invalid_identifier(
                field,
                format!("contains non-alphanumeric character '{c}'"),
            ));
        }
    }

    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> IdentifierInput {
        IdentifierInput {
            sub: Some("001".into()),
            ses: Some("testSession".into()),
            task: Some("myExperiment".into()),
            run: Some("001".into()),
            data_type: Some("eeg".into()),
            modality: Some("eeg".into()),
            acq: None,
        }
    }

    #[test]
    fn test_build_valid() {
        let ids = input().build().unwrap();
        assert_eq!(ids.subject(), "001");
        assert_eq!(ids.session(), "testSession");
        assert_eq!(ids.acquisition(), None);
    }

    #[test]
    fn test_modality_defaults_from_data_type() {
        let mut raw = input();
        raw.modality = None;
        let ids = raw.build().unwrap();
        assert_eq!(ids.modality(), "eeg");

        let mut raw = input();
        raw.data_type = Some("  ".into());
        let ids = raw.build().unwrap();
        assert_eq!(ids.data_type(), "eeg");
    }

    #[test]
    fn test_both_kinds_missing() {
        let mut raw = input();
        raw.data_type = None;
        raw.modality = None;
        let err = raw.build().unwrap_err();
        assert_eq!(err.kind(), "invalid_identifier");
        assert_eq!(raw.missing_fields(), vec!["modality"]);
    }

    #[test]
    fn test_missing_required_field() {
        let mut raw = input();
        raw.task = None;
        match raw.build().unwrap_err() {
            RecordError::InvalidIdentifier { field, .. } => assert_eq!(field, "task"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(raw.missing_fields(), vec!["task"]);
    }

    #[test]
    fn test_rejects_unsafe_labels() {
        for bad in ["../etc", "a/b", "a\\b", "two words", "a_b", "a-b", "x.y", "tab\t", "é"] {
            let err = validate_label("sub", bad).unwrap_err();
            assert_eq!(err.kind(), "invalid_identifier", "accepted {bad:?}");
        }
        assert!(validate_label("sub", "").is_err());
    }

    #[test]
    fn test_acquisition_validated() {
        let mut raw = input();
        raw.acq = Some("high_res".into());
        assert!(raw.build().is_err());

        raw.acq = Some("highres".into());
        assert_eq!(raw.build().unwrap().acquisition(), Some("highres"));
    }
}
