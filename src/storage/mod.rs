//! Definition files on disk: scenarios and test case lists in JSON or TOML,
//! plus JSON report output.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{Scenario, TestCase};
use crate::error::{Error, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum CaseFile {
    List(Vec<TestCase>),
    Suite { cases: Vec<TestCase> },
}

pub fn load_scenario(path: &Path) -> Result<Scenario> {
    load_definition(path)
}

/// Accepts a bare JSON array or a document with a `cases` list.
pub fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    Ok(match load_definition::<CaseFile>(path)? {
        CaseFile::List(cases) | CaseFile::Suite { cases } => cases,
    })
}

fn load_definition<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::invalid(format!("Failed to read `{}`: {e}", path.display())))?;

    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(&raw)
            .map_err(|e| Error::invalid(format!("Failed to parse `{}`: {e}", path.display())))
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::invalid(format!("Failed to parse `{}`: {e}", path.display())))
    }
}

pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(report)?;
    fs::write(path, raw)?;
    Ok(())
}
