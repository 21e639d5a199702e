//! Deployment request construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};
use crate::remote::StackTarget;
use crate::store::{KeyValueStore, keys};

/// Template file name inside a scenario folder.
pub const TEMPLATE_FILE_NAME: &str = "cloudformation.yml";
/// Parameters file name inside a scenario folder.
pub const PARAMETERS_FILE_NAME: &str = "parameters.json";
/// Lambda sources folder inside a scenario folder.
pub const LAMBDA_FOLDER_NAME: &str = "lambda";

const STACK_NAME_PREFIX: &str = "GameLiftPluginForUnity-";

/// Regions the provider accepts.
pub const KNOWN_REGIONS: &[&str] = &[
    "af-south-1",
    "ap-east-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-south-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ca-central-1",
    "eu-central-1",
    "eu-north-1",
    "eu-south-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "me-south-1",
    "sa-east-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

pub fn is_valid_region(region: &str) -> bool {
    KNOWN_REGIONS.contains(&region)
}

/// Name of the stack that backs a game.
pub fn stack_name(game_name: &str) -> String {
    format!("{STACK_NAME_PREFIX}{game_name}")
}

/// A fresh, unique key for an uploaded server build.
pub fn build_artifact_key() -> String {
    let now = chrono::Utc::now();
    let stamp = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_millis());
    format!("GameLift_Build_{stamp}.zip")
}

/// A fresh change set name.
pub fn change_set_name() -> String {
    let suffix: u64 = rand::random();
    format!("changeset-{suffix:016x}")
}

/// Everything one deployment attempt needs. Built fresh per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub profile: String,
    pub region: String,
    pub bucket_name: String,
    pub stack_name: String,
    pub template_path: PathBuf,
    pub parameters_path: PathBuf,
    pub game_name: String,
    pub lambda_path: PathBuf,
    pub development_build: bool,
    pub build_folder: Option<PathBuf>,
    pub build_artifact_key: Option<String>,
}

impl DeploymentRequest {
    pub fn target(&self) -> StackTarget {
        StackTarget {
            profile: self.profile.clone(),
            region: self.region.clone(),
            stack_name: self.stack_name.clone(),
        }
    }
}

/// Identity of a deployment attempt, persisted so a waiter can resume it
/// after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{stack_name} ({scenario_name}, {region})")]
pub struct DeploymentId {
    pub profile: String,
    pub region: String,
    pub stack_name: String,
    pub scenario_name: String,
}

impl DeploymentId {
    pub fn new(request: &DeploymentRequest, scenario_name: impl Into<String>) -> Self {
        Self {
            profile: request.profile.clone(),
            region: request.region.clone(),
            stack_name: request.stack_name.clone(),
            scenario_name: scenario_name.into(),
        }
    }

    pub fn target(&self) -> StackTarget {
        StackTarget {
            profile: self.profile.clone(),
            region: self.region.clone(),
            stack_name: self.stack_name.clone(),
        }
    }
}

/// Builds validated [`DeploymentRequest`]s from persisted settings.
#[derive(Clone)]
pub struct RequestFactory {
    store: Arc<dyn KeyValueStore>,
}

impl RequestFactory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Build a request for `game_name` deployed from `scenario_path`.
    ///
    /// Template, parameters and lambda paths are derived from the scenario
    /// folder. Profile, region and bucket come from the settings store; a
    /// missing or invalid value fails without building anything.
    pub fn create_request(
        &self,
        scenario_path: &Path,
        game_name: &str,
        development_build: bool,
    ) -> DeployResult<DeploymentRequest> {
        if scenario_path.as_os_str().is_empty() {
            return Err(DeployError::invalid_argument("scenario path is empty"));
        }
        if game_name.trim().is_empty() {
            return Err(DeployError::invalid_argument("game name is empty"));
        }

        let profile = self.required_setting(keys::CURRENT_PROFILE)?;
        let region = self.required_setting(keys::CURRENT_REGION)?;
        if !is_valid_region(&region) {
            return Err(DeployError::InvalidRegion(region));
        }
        let bucket_name = self.required_setting(keys::CURRENT_BUCKET)?;

        Ok(DeploymentRequest {
            profile,
            region,
            bucket_name,
            stack_name: stack_name(game_name),
            template_path: scenario_path.join(TEMPLATE_FILE_NAME),
            parameters_path: scenario_path.join(PARAMETERS_FILE_NAME),
            game_name: game_name.to_string(),
            lambda_path: scenario_path.join(LAMBDA_FOLDER_NAME),
            development_build,
            build_folder: None,
            build_artifact_key: None,
        })
    }

    /// Attach a server build folder and a fresh artifact key to `request`.
    pub fn with_server_build(
        &self,
        request: DeploymentRequest,
        build_folder: Option<&Path>,
    ) -> DeployResult<DeploymentRequest> {
        let build_folder = build_folder
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or_else(|| DeployError::invalid_argument("build folder is empty"))?;

        Ok(DeploymentRequest {
            build_folder: Some(build_folder.to_path_buf()),
            build_artifact_key: Some(build_artifact_key()),
            ..request
        })
    }

    fn required_setting(&self, key: &str) -> DeployResult<String> {
        match self.store.get(key)? {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(DeployError::SettingNotFound(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn bootstrapped_store() -> Arc<dyn KeyValueStore> {
        let store = MemoryStore::new();
        store.put(keys::CURRENT_PROFILE, "p").unwrap();
        store.put(keys::CURRENT_REGION, "us-west-2").unwrap();
        store.put(keys::CURRENT_BUCKET, "b").unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_paths_are_derived_from_scenario_folder() {
        let factory = RequestFactory::new(bootstrapped_store());
        let request = factory
            .create_request(Path::new("/scenarios/single_fleet"), "game", false)
            .unwrap();

        assert_eq!(request.profile, "p");
        assert_eq!(request.region, "us-west-2");
        assert_eq!(request.bucket_name, "b");
        assert_eq!(request.stack_name, "GameLiftPluginForUnity-game");
        assert_eq!(
            request.template_path,
            PathBuf::from("/scenarios/single_fleet/cloudformation.yml")
        );
        assert_eq!(
            request.parameters_path,
            PathBuf::from("/scenarios/single_fleet/parameters.json")
        );
        assert_eq!(request.lambda_path, PathBuf::from("/scenarios/single_fleet/lambda"));
        assert_eq!(request.build_artifact_key, None);
    }

    #[test]
    fn test_missing_arguments_are_invalid() {
        let factory = RequestFactory::new(bootstrapped_store());

        let err = factory.create_request(Path::new(""), "game", false).unwrap_err();
        assert!(matches!(err, DeployError::InvalidArgument(_)));

        let err = factory
            .create_request(Path::new("/scenario"), "  ", false)
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidArgument(_)));
    }

    #[test]
    fn test_each_missing_setting_fails() {
        for missing in [keys::CURRENT_PROFILE, keys::CURRENT_REGION, keys::CURRENT_BUCKET] {
            let store = bootstrapped_store();
            store.clear(missing).unwrap();
            let factory = RequestFactory::new(store);

            let err = factory
                .create_request(Path::new("/scenario"), "game", false)
                .unwrap_err();
            assert_eq!(err, DeployError::SettingNotFound(missing.to_string()));
        }
    }

    #[test]
    fn test_invalid_region_fails() {
        let store = bootstrapped_store();
        store.put(keys::CURRENT_REGION, "moon-north-1").unwrap();
        let factory = RequestFactory::new(store);

        let err = factory
            .create_request(Path::new("/scenario"), "game", false)
            .unwrap_err();
        assert_eq!(err, DeployError::InvalidRegion("moon-north-1".to_string()));
    }

    #[test]
    fn test_with_server_build_attaches_artifact() {
        let factory = RequestFactory::new(bootstrapped_store());
        let request = factory
            .create_request(Path::new("/scenario"), "game", true)
            .unwrap();

        let err = factory.with_server_build(request.clone(), None).unwrap_err();
        assert!(matches!(err, DeployError::InvalidArgument(_)));

        let request = factory
            .with_server_build(request, Some(Path::new("/builds/server")))
            .unwrap();
        assert_eq!(request.build_folder, Some(PathBuf::from("/builds/server")));
        let key = request.build_artifact_key.unwrap();
        assert!(key.starts_with("GameLift_Build_") && key.ends_with(".zip"));
    }

    #[test]
    fn test_deployment_id_copies_request_identity() {
        let factory = RequestFactory::new(bootstrapped_store());
        let request = factory
            .create_request(Path::new("/scenario"), "game", false)
            .unwrap();

        let id = DeploymentId::new(&request, "Single-Region Fleet");
        assert_eq!(id.target(), request.target());
        assert_eq!(id.scenario_name, "Single-Region Fleet");
    }
}
