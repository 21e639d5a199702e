//! Configuration for the stackpilot CLI.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use stackpilot_deploy::DeployTimings;

const DEFAULT_CONFIG_FILE: &str = "Stackpilot.toml";

const DEFAULT_BUILD_TEMPLATE: &str = "docker build -t {{REPO_NAME}}:{{IMAGE_TAG}} . \
    && echo 'Docker image successfully built.'";

const DEFAULT_PUSH_TEMPLATE: &str = "aws ecr get-login-password --region {{REGION}} --profile {{PROFILE_NAME}} \
    | docker login --username AWS --password-stdin {{ECR_REGISTRY_URL}} \
    && docker tag {{IMAGE_ID}} {{ECR_REPO_URI}}:{{IMAGE_TAG}} \
    && docker push {{ECR_REPO_URI}}:{{IMAGE_TAG}} \
    && echo 'Docker image successfully pushed to Amazon ECR.'";

/// Settings read from `Stackpilot.toml` and `STACKPILOT_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Folder holding one sub-folder per scenario.
    pub scenarios_dir: PathBuf,
    /// Where settings and the current deployment are persisted.
    pub state_file: PathBuf,
    /// Folder receiving container script logs.
    pub logs_dir: PathBuf,
    /// The provider command line tool.
    pub aws_program: String,
    /// Role assumed by container fleets.
    pub fleet_role_arn: Option<String>,
    pub timings: DeployTimings,
    pub containers: ContainerTemplates,
}

/// Shell templates for the container image scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerTemplates {
    pub build: String,
    pub push: String,
}

impl Default for ContainerTemplates {
    fn default() -> Self {
        Self {
            build: DEFAULT_BUILD_TEMPLATE.to_string(),
            push: DEFAULT_PUSH_TEMPLATE.to_string(),
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        let data_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stackpilot");

        Self {
            scenarios_dir: PathBuf::from("scenarios"),
            state_file: data_dir.join("state.json"),
            logs_dir: data_dir.join("logs"),
            aws_program: "aws".to_string(),
            fleet_role_arn: None,
            timings: DeployTimings::default(),
            containers: ContainerTemplates::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration, later sources overriding earlier ones:
    /// 1. Default values
    /// 2. The TOML file at `path`, or `Stackpilot.toml` (if present)
    /// 3. Environment variables with the `STACKPILOT_` prefix, `__` separating
    ///    nested keys (`STACKPILOT_TIMINGS__STACK_POLL_MS`)
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        if path.is_some() && !file.is_file() {
            anyhow::bail!("Configuration file {} does not exist", file.display());
        }

        Figment::new()
            .merge(Toml::file(file))
            .merge(Env::prefixed("STACKPILOT_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))
    }
}
