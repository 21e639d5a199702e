//! Scenario `parameters.json` editing.
//!
//! The file holds the provider's parameter list format,
//! `[{"ParameterKey": ..., "ParameterValue": ...}]`. Unknown keys are left
//! alone and keys missing from the file are appended.

use std::path::{Component, Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};

/// Template parameter names the orchestrator fills in.
pub mod keys {
    pub const GAME_NAME: &str = "GameNameParameter";
    pub const LAUNCH_PATH: &str = "LaunchPathParameter";
    pub const LAUNCH_PARAMETERS: &str = "LaunchParameters";
    pub const BUILD_OPERATING_SYSTEM: &str = "BuildOperatingSystem";
    pub const FLEET_NAME: &str = "AnywhereFleetName";
    pub const BUILD_NAME: &str = "BuildName";
}

const SERVER_GAME_ROOT: &str = "C:\\game";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScenarioParameter {
    pub parameter_key: String,
    pub parameter_value: String,
}

/// An in-memory copy of a parameters file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioParameters {
    parameters: Vec<ScenarioParameter>,
}

impl ScenarioParameters {
    pub fn parse(serialized: &str) -> DeployResult<Self> {
        if serialized.trim().is_empty() {
            return Err(DeployError::invalid_argument("parameters file is empty"));
        }
        let parameters = serde_json::from_str(serialized)
            .map_err(|err| DeployError::FileAccess(format!("malformed parameters: {err}")))?;
        Ok(Self { parameters })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|parameter| parameter.parameter_key == key)
            .map(|parameter| parameter.parameter_value.as_str())
    }

    /// Overwrite `key`, appending it when the file does not have it yet.
    pub fn set(&mut self, key: &str, value: &str) -> DeployResult<()> {
        if key.is_empty() || value.is_empty() {
            return Err(DeployError::invalid_argument(format!(
                "parameter '{key}' needs a non-empty key and value"
            )));
        }

        match self
            .parameters
            .iter_mut()
            .find(|parameter| parameter.parameter_key == key)
        {
            Some(parameter) => parameter.parameter_value = value.to_string(),
            None => self.parameters.push(ScenarioParameter {
                parameter_key: key.to_string(),
                parameter_value: value.to_string(),
            }),
        }
        Ok(())
    }

    pub fn to_json(&self) -> DeployResult<String> {
        serde_json::to_string_pretty(&self.parameters)
            .map_err(|err| DeployError::FileAccess(format!("cannot serialize parameters: {err}")))
    }
}

/// Rewrite the parameters file at `path` with `values`.
pub fn update_parameters_file(path: &Path, values: &[(&str, String)]) -> DeployResult<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameters file {}", path.display()))
        .map_err(file_error)?;

    let mut parameters = ScenarioParameters::parse(&content)?;
    for (key, value) in values {
        parameters.set(key, value)?;
    }

    std::fs::write(path, parameters.to_json()?)
        .with_context(|| format!("Failed to write parameters file {}", path.display()))
        .map_err(file_error)?;

    tracing::debug!(path = %path.display(), count = values.len(), "Updated scenario parameters");
    Ok(())
}

fn file_error(err: anyhow::Error) -> DeployError {
    DeployError::FileAccess(format!("{err:#}"))
}

/// Path of `build_file` relative to `build_folder`, or `None` when the file
/// is not inside the folder.
pub fn exe_path_in_build(build_folder: &Path, build_file: &Path) -> Option<String> {
    let relative = build_file.strip_prefix(build_folder).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\\"))
}

/// Where the server executable ends up on a fleet instance.
pub fn server_launch_path(exe_path_in_build: &str) -> String {
    format!("{SERVER_GAME_ROOT}\\{exe_path_in_build}")
}
