// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed view over the producer-supplied `run_options` payload.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warning", "error"];

/// Options recognized by the worker. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Build the environment (validating the configuration package) without running the engine.
    pub validate_only: bool,
    /// Complete immediately without touching the environment or the engine.
    pub dry_run: bool,
    /// Engine log level.
    pub log_level: String,
    /// Restrict extraction to these sheets.
    pub input_sheet_names: Vec<String>,
    /// Only extract the workbook's active sheet.
    pub active_sheet_only: bool,
    /// Cap on validation findings reported per sheet.
    pub max_findings_per_sheet: Option<u32>,
    /// Extra arguments appended verbatim to the engine command line.
    pub engine_args: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            validate_only: false,
            dry_run: false,
            log_level: "info".to_string(),
            input_sheet_names: Vec::new(),
            active_sheet_only: false,
            max_findings_per_sheet: None,
            engine_args: Vec::new(),
        }
    }
}

impl RunOptions {
    /// Parse and validate a raw options payload.
    ///
    /// `null` yields the defaults; anything other than an object is rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        if !value.is_object() {
            return Err(Error::InvalidRunOptions(format!(
                "expected a JSON object, got {}",
                value
            )));
        }

        let mut options: RunOptions = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidRunOptions(e.to_string()))?;

        options.log_level = options.log_level.trim().to_lowercase();
        if !LOG_LEVELS.contains(&options.log_level.as_str()) {
            return Err(Error::InvalidRunOptions(format!(
                "unsupported log_level '{}'",
                options.log_level
            )));
        }

        Ok(options)
    }

    /// Engine command-line flags derived from these options, pass-through arguments last.
    pub fn engine_flags(&self) -> Vec<String> {
        let mut flags = vec!["--log-level".to_string(), self.log_level.clone()];
        for sheet in &self.input_sheet_names {
            flags.push("--input-sheet".to_string());
            flags.push(sheet.clone());
        }
        if self.active_sheet_only {
            flags.push("--active-sheet-only".to_string());
        }
        if let Some(max) = self.max_findings_per_sheet {
            flags.push("--max-findings-per-sheet".to_string());
            flags.push(max.to_string());
        }
        flags.extend(self.engine_args.iter().cloned());
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_payload_yields_defaults() {
        let options = RunOptions::from_value(&Value::Null).unwrap();
        assert_eq!(options, RunOptions::default());
        assert_eq!(options.log_level, "info");
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let options = RunOptions::from_value(&json!({
            "dry_run": true,
            "priority": "high",
            "nested": {"anything": 1}
        }))
        .unwrap();
        assert!(options.dry_run);
        assert!(!options.validate_only);
    }

    #[test]
    fn test_wrong_types_are_rejected() {
        let err = RunOptions::from_value(&json!({"dry_run": "yes"})).unwrap_err();
        assert!(matches!(err, Error::InvalidRunOptions(_)));

        let err = RunOptions::from_value(&json!(["dry_run"])).unwrap_err();
        assert!(matches!(err, Error::InvalidRunOptions(_)));
    }

    #[test]
    fn test_log_level_is_normalized_and_validated() {
        let options = RunOptions::from_value(&json!({"log_level": " DEBUG "})).unwrap();
        assert_eq!(options.log_level, "debug");

        let err = RunOptions::from_value(&json!({"log_level": "verbose"})).unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_engine_flags_include_sheet_selection_and_pass_through() {
        let options = RunOptions::from_value(&json!({
            "log_level": "warning",
            "input_sheet_names": ["Orders", "Returns"],
            "active_sheet_only": true,
            "max_findings_per_sheet": 25,
            "engine_args": ["--strict"]
        }))
        .unwrap();

        assert_eq!(
            options.engine_flags(),
            vec![
                "--log-level",
                "warning",
                "--input-sheet",
                "Orders",
                "--input-sheet",
                "Returns",
                "--active-sheet-only",
                "--max-findings-per-sheet",
                "25",
                "--strict",
            ]
        );
    }

    #[test]
    fn test_default_flags_only_carry_log_level() {
        assert_eq!(
            RunOptions::default().engine_flags(),
            vec!["--log-level".to_string(), "info".to_string()]
        );
    }
}
