//! Container image build, push and fleet creation as a [`StepChain`].
//!
//! - `process.rs` - Launching scripts and tailing their logs
//! - `script.rs` - Idempotent script steps (image build and push)
//! - `fleet.rs` - Container group definition and fleet steps

pub mod fleet;
pub mod process;
pub mod script;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use fleet::{
    ContainerFleetClient, FleetSpec, FleetStatus, FleetStep, FleetTarget, GroupDefinitionSpec,
    GroupDefinitionStatus, GroupDefinitionStep,
};
pub use process::{FAILURE_SENTINEL, ProcessRunner, ShellProcessRunner, tail_log};
pub use script::{ScriptDefinition, ScriptStep};

use crate::config::DeployTimings;
use crate::steps::{Step, StepChain};
use crate::store::{KeyValueStore, keys};

/// Log line the build script prints on success.
pub const BUILD_SUCCESS_SENTINEL: &str = "Docker image successfully built.";
/// Log line the push script prints on success.
pub const PUSH_SUCCESS_SENTINEL: &str = "Docker image successfully pushed to Amazon ECR.";

const BUILD_LOG_FILE: &str = "BuildImageScriptOutput.txt";
const PUSH_LOG_FILE: &str = "PushImageToECRScriptOutput.txt";

/// Values substituted into script templates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerContext {
    pub profile: String,
    pub region: String,
    pub repository_name: String,
    /// `registry/repository`, without a tag.
    pub repository_uri: String,
    /// Local image id, for tagging an image that already exists.
    pub image_id: Option<String>,
    pub image_tag: String,
}

impl ContainerContext {
    pub fn registry_url(&self) -> &str {
        self.repository_uri
            .split('/')
            .next()
            .unwrap_or(&self.repository_uri)
    }

    pub fn image_uri(&self) -> String {
        format!("{}:{}", self.repository_uri, self.image_tag)
    }

    /// Replace every known `{{PLACEHOLDER}}` that has a value; placeholders
    /// without one are left untouched.
    pub fn render(&self, template: &str) -> String {
        let values = [
            ("{{REGION}}", self.region.as_str()),
            ("{{PROFILE_NAME}}", self.profile.as_str()),
            ("{{ECR_REGISTRY_URL}}", self.registry_url()),
            ("{{REPO_NAME}}", self.repository_name.as_str()),
            ("{{ECR_REPO_URI}}", self.repository_uri.as_str()),
            ("{{IMAGE_ID}}", self.image_id.as_deref().unwrap_or_default()),
            ("{{IMAGE_TAG}}", self.image_tag.as_str()),
        ];

        values
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .fold(template.to_string(), |rendered, (placeholder, value)| {
                rendered.replace(placeholder, value)
            })
    }
}

/// Script templates and resource settings for [`container_pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPipelineConfig {
    /// Where script logs are written.
    pub output_dir: PathBuf,
    pub build_template: String,
    pub push_template: String,
    pub group_definition: GroupDefinitionSpec,
    pub fleet: FleetSpec,
}

/// Build image, push image, register the group definition, create the fleet.
pub fn container_pipeline<R, F>(
    runner: Arc<R>,
    fleet_client: Arc<F>,
    store: Arc<dyn KeyValueStore>,
    context: &ContainerContext,
    config: ContainerPipelineConfig,
    timings: DeployTimings,
) -> StepChain
where
    R: ProcessRunner,
    F: ContainerFleetClient,
{
    let target = FleetTarget {
        profile: context.profile.clone(),
        region: context.region.clone(),
    };

    let build = ScriptDefinition {
        name: "Build image".to_string(),
        command: context.render(&config.build_template),
        log_path: config.output_dir.join(BUILD_LOG_FILE),
        success_sentinel: BUILD_SUCCESS_SENTINEL.to_string(),
        completion_key: keys::CONTAINER_IMAGE_BUILT.to_string(),
        outputs: Vec::new(),
    };
    let push = ScriptDefinition {
        name: "Push image".to_string(),
        command: context.render(&config.push_template),
        log_path: config.output_dir.join(PUSH_LOG_FILE),
        success_sentinel: PUSH_SUCCESS_SENTINEL.to_string(),
        completion_key: keys::CONTAINER_IMAGE_PUSHED.to_string(),
        outputs: vec![(keys::CONTAINER_IMAGE_URI.to_string(), context.image_uri())],
    };
    let group_definition = GroupDefinitionSpec {
        image_uri: context.image_uri(),
        ..config.group_definition
    };

    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(ScriptStep::new(build, runner.clone(), store.clone(), timings.clone())),
        Box::new(ScriptStep::new(push, runner, store.clone(), timings.clone())),
        Box::new(GroupDefinitionStep::new(
            fleet_client.clone(),
            store.clone(),
            target.clone(),
            group_definition,
            timings.clone(),
        )),
        Box::new(FleetStep::new(fleet_client, store, target, config.fleet, timings)),
    ];
    StepChain::new(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_known_placeholders() {
        let context = ContainerContext {
            profile: "dev".to_string(),
            region: "us-west-2".to_string(),
            repository_name: "game".to_string(),
            repository_uri: "123.dkr.ecr.us-west-2.amazonaws.com/game".to_string(),
            image_id: None,
            image_tag: "v1".to_string(),
        };

        let rendered = context.render(
            "aws ecr get-login-password --region {{REGION}} --profile {{PROFILE_NAME}} \
             | docker login --password-stdin {{ECR_REGISTRY_URL}} && \
             docker tag {{IMAGE_ID}} {{ECR_REPO_URI}}:{{IMAGE_TAG}}",
        );
        assert!(rendered.contains("--region us-west-2 --profile dev"));
        assert!(rendered.contains("--password-stdin 123.dkr.ecr.us-west-2.amazonaws.com &&"));
        assert!(rendered.contains("docker tag {{IMAGE_ID}} 123.dkr.ecr.us-west-2.amazonaws.com/game:v1"));
    }
}
