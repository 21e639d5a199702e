//! Stack and container fleet clients backed by the `aws` command line tool.
//!
//! Every call runs `aws <service> <operation> --output json` and parses the
//! JSON it prints. Failures are mapped to [`RemoteError`] using the error code
//! the tool reports; throttled calls are retried with exponential backoff.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use stackpilot_deploy::parameters::keys as parameter_keys;
use stackpilot_deploy::pipeline::{
    FleetSpec, FleetStatus, FleetTarget, GroupDefinitionSpec, GroupDefinitionStatus,
};
use stackpilot_deploy::{
    ChangeSetDescription, ChangeSetExecutionStatus, ContainerFleetClient, DeploymentRequest,
    RemoteError, RemoteResult, ResourceChange, StackClient, StackDescription, StackStatus,
    StackTarget,
};
use tokio::process::Command;

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
];

const MAX_RETRIES: usize = 5;
const STACK_CAPABILITIES: &[&str] = &["CAPABILITY_IAM", "CAPABILITY_NAMED_IAM", "CAPABILITY_AUTO_EXPAND"];
const GAME_SERVER_CONTAINER: &str = "GameServer";
const SERVER_SDK_VERSION: &str = "5.2.0";

/// Runs the provider command line tool.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
}

impl AwsCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run one operation and parse its JSON output, retrying while throttled.
    async fn call<T: DeserializeOwned>(
        &self,
        profile: &str,
        region: &str,
        args: &[&str],
    ) -> RemoteResult<T> {
        let output = (|| self.run(profile, region, args))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(500))
                    .with_max_times(MAX_RETRIES),
            )
            .sleep(tokio::time::sleep)
            .when(is_throttled)
            .notify(|err, delay| {
                tracing::warn!(code = %err.code, ?delay, "Provider call throttled, retrying");
            })
            .await?;

        let output = if output.trim().is_empty() { "null" } else { output.as_str() };
        serde_json::from_str(output).map_err(|err| {
            RemoteError::new(
                "MalformedResponse",
                format!("unexpected output from {} {}: {err}", self.program, args.join(" ")),
            )
        })
    }

    async fn run(&self, profile: &str, region: &str, args: &[&str]) -> RemoteResult<String> {
        tracing::debug!(program = %self.program, operation = %args[..args.len().min(2)].join(" "), "Calling provider");

        let output = Command::new(&self.program)
            .args(args)
            .args(["--profile", profile, "--region", region, "--output", "json"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                RemoteError::new(
                    "ProviderToolUnavailable",
                    format!("failed to run {}: {err}", self.program),
                )
            })?;

        if !output.status.success() {
            return Err(parse_error(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_throttled(err: &RemoteError) -> bool {
    THROTTLING_CODES.contains(&err.code.as_str())
}

/// Extract code and message from `An error occurred (Code) when calling the Op operation: message`.
fn parse_error(stderr: &str) -> RemoteError {
    let stderr = stderr.trim();
    let parsed = stderr.split_once("An error occurred (").and_then(|(_, rest)| {
        let (code, rest) = rest.split_once(')')?;
        let message = rest
            .split_once("operation: ")
            .map(|(_, message)| message)
            .unwrap_or(rest);
        Some(RemoteError::new(code, message.trim()))
    });
    parsed.unwrap_or_else(|| RemoteError::new("ProviderCallFailed", stderr))
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksOutput {
    stacks: Vec<StackOutput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackOutput {
    stack_status: StackStatus,
    creation_time: Option<DateTime<Utc>>,
    last_updated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    outputs: Vec<StackOutputValue>,
    #[serde(default)]
    parameters: Vec<StackParameter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackOutputValue {
    output_key: String,
    output_value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackParameter {
    parameter_key: String,
    #[serde(default)]
    parameter_value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeChangeSetOutput {
    stack_id: String,
    change_set_id: String,
    execution_status: ChangeSetExecutionStatus,
    #[serde(default)]
    changes: Vec<ChangeOutput>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChangeOutput {
    resource_change: ResourceChangeOutput,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceChangeOutput {
    action: String,
    logical_resource_id: String,
    resource_type: String,
    replacement: Option<String>,
}

/// Implements [`StackClient`] with `aws cloudformation` and `aws s3`.
#[derive(Debug, Clone)]
pub struct AwsCliStackClient {
    cli: AwsCli,
}

impl AwsCliStackClient {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }

    async fn stack_accepts_updates(&self, target: &StackTarget) -> bool {
        match self.describe_stack(target).await {
            Ok(stack) => stack.status != StackStatus::ReviewInProgress,
            Err(_) => false,
        }
    }
}

impl StackClient for AwsCliStackClient {
    async fn validate_template(
        &self,
        profile: &str,
        region: &str,
        template_path: &Path,
    ) -> RemoteResult<()> {
        let template = file_url(template_path);
        let _: serde_json::Value = self
            .cli
            .call(
                profile,
                region,
                &["cloudformation", "validate-template", "--template-body", &template],
            )
            .await?;
        Ok(())
    }

    async fn create_change_set(
        &self,
        request: &DeploymentRequest,
        change_set_name: &str,
    ) -> RemoteResult<String> {
        let target = request.target();
        let change_set_type = if self.stack_accepts_updates(&target).await {
            "UPDATE"
        } else {
            "CREATE"
        };
        let template = file_url(&request.template_path);
        let parameters = file_url(&request.parameters_path);

        let mut args = vec![
            "cloudformation",
            "create-change-set",
            "--stack-name",
            request.stack_name.as_str(),
            "--change-set-name",
            change_set_name,
            "--change-set-type",
            change_set_type,
            "--template-body",
            template.as_str(),
            "--parameters",
            parameters.as_str(),
            "--capabilities",
        ];
        args.extend_from_slice(STACK_CAPABILITIES);

        let _: serde_json::Value = self.cli.call(&request.profile, &request.region, &args).await?;
        Ok(change_set_name.to_string())
    }

    async fn describe_change_set(
        &self,
        target: &StackTarget,
        change_set_name: &str,
    ) -> RemoteResult<ChangeSetDescription> {
        let output: DescribeChangeSetOutput = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &[
                    "cloudformation",
                    "describe-change-set",
                    "--stack-name",
                    &target.stack_name,
                    "--change-set-name",
                    change_set_name,
                ],
            )
            .await?;

        Ok(ChangeSetDescription {
            stack_id: output.stack_id,
            change_set_id: output.change_set_id,
            execution_status: output.execution_status,
            changes: output
                .changes
                .into_iter()
                .map(|change| ResourceChange {
                    action: change.resource_change.action,
                    logical_id: change.resource_change.logical_resource_id,
                    resource_type: change.resource_change.resource_type,
                    replacement: change.resource_change.replacement,
                })
                .collect(),
        })
    }

    async fn delete_change_set(&self, target: &StackTarget, change_set_name: &str) -> RemoteResult<()> {
        let _: serde_json::Value = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &[
                    "cloudformation",
                    "delete-change-set",
                    "--stack-name",
                    &target.stack_name,
                    "--change-set-name",
                    change_set_name,
                ],
            )
            .await?;
        Ok(())
    }

    async fn describe_stack(&self, target: &StackTarget) -> RemoteResult<StackDescription> {
        let output: DescribeStacksOutput = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &["cloudformation", "describe-stacks", "--stack-name", &target.stack_name],
            )
            .await?;

        let stack = output.stacks.into_iter().next().ok_or_else(|| {
            RemoteError::new(
                "ValidationError",
                format!("Stack with id {} does not exist", target.stack_name),
            )
        })?;

        let game_name = stack
            .parameters
            .iter()
            .find(|parameter| parameter.parameter_key == parameter_keys::GAME_NAME)
            .map(|parameter| parameter.parameter_value.clone());

        Ok(StackDescription {
            status: stack.stack_status,
            game_name,
            last_updated: stack.last_updated_time.or(stack.creation_time),
            outputs: stack
                .outputs
                .into_iter()
                .map(|output| (output.output_key, output.output_value))
                .collect::<BTreeMap<_, _>>(),
        })
    }

    async fn upload_build(&self, request: &DeploymentRequest) -> RemoteResult<()> {
        let (Some(folder), Some(key)) = (&request.build_folder, &request.build_artifact_key) else {
            return Err(RemoteError::new(
                "InvalidParameterValue",
                "the request carries no server build",
            ));
        };

        let archive = std::env::temp_dir().join(key);
        archive_folder(folder, &archive).await?;

        let source = archive.display().to_string();
        let destination = format!("s3://{}/{key}", request.bucket_name);
        let uploaded: RemoteResult<serde_json::Value> = self
            .cli
            .call(
                &request.profile,
                &request.region,
                &["s3", "cp", &source, &destination, "--only-show-errors"],
            )
            .await;

        if let Err(err) = tokio::fs::remove_file(&archive).await {
            tracing::warn!(archive = %archive.display(), error = %err, "Failed to remove build archive");
        }
        uploaded.map(|_| ())
    }

    async fn execute_change_set(&self, target: &StackTarget, change_set_name: &str) -> RemoteResult<()> {
        let _: serde_json::Value = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &[
                    "cloudformation",
                    "execute-change-set",
                    "--stack-name",
                    &target.stack_name,
                    "--change-set-name",
                    change_set_name,
                ],
            )
            .await?;
        Ok(())
    }

    async fn cancel_update_stack(&self, target: &StackTarget, client_token: &str) -> RemoteResult<()> {
        let _: serde_json::Value = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &[
                    "cloudformation",
                    "cancel-update-stack",
                    "--stack-name",
                    &target.stack_name,
                    "--client-request-token",
                    client_token,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_stack(&self, target: &StackTarget) -> RemoteResult<()> {
        let _: serde_json::Value = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &["cloudformation", "delete-stack", "--stack-name", &target.stack_name],
            )
            .await?;
        Ok(())
    }
}

/// Zip `folder` into `archive` with the platform archiver.
async fn archive_folder(folder: &Path, archive: &Path) -> RemoteResult<()> {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("powershell");
        command.arg("-Command").arg(format!(
            "Compress-Archive -Path '{}\\*' -DestinationPath '{}' -Force",
            folder.display(),
            archive.display()
        ));
        command
    } else {
        let mut command = Command::new("zip");
        command.arg("-qr").arg(archive).arg(".").current_dir(folder);
        command
    };

    tracing::info!(folder = %folder.display(), archive = %archive.display(), "Archiving server build");
    let status = command.status().await.map_err(|err| {
        RemoteError::new("BuildArchiveFailed", format!("failed to run archiver: {err}"))
    })?;
    if !status.success() {
        return Err(RemoteError::new(
            "BuildArchiveFailed",
            format!("archiving {} exited with {status}", folder.display()),
        ));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupDefinitionOutput {
    container_group_definition: GroupDefinitionBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupDefinitionBody {
    name: String,
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FleetOutput {
    container_fleet: FleetBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FleetBody {
    fleet_id: String,
    status: String,
}

/// Implements [`ContainerFleetClient`] with `aws gamelift`.
#[derive(Debug, Clone)]
pub struct AwsCliFleetClient {
    cli: AwsCli,
    fleet_role_arn: String,
}

impl AwsCliFleetClient {
    pub fn new(cli: AwsCli, fleet_role_arn: impl Into<String>) -> Self {
        Self {
            cli,
            fleet_role_arn: fleet_role_arn.into(),
        }
    }
}

impl ContainerFleetClient for AwsCliFleetClient {
    async fn create_group_definition(
        &self,
        target: &FleetTarget,
        spec: &GroupDefinitionSpec,
    ) -> RemoteResult<String> {
        let container = serde_json::json!({
            "ContainerName": GAME_SERVER_CONTAINER,
            "ImageUri": spec.image_uri,
            "ServerSdkVersion": SERVER_SDK_VERSION,
            "PortConfiguration": {
                "ContainerPortRanges": [
                    { "FromPort": spec.from_port, "ToPort": spec.to_port, "Protocol": "UDP" }
                ]
            }
        })
        .to_string();
        let memory = spec.total_memory_limit_mib.to_string();
        let vcpu = spec.total_vcpu_limit.to_string();

        let output: GroupDefinitionOutput = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &[
                    "gamelift",
                    "create-container-group-definition",
                    "--name",
                    &spec.name,
                    "--operating-system",
                    "AMAZON_LINUX_2023",
                    "--total-memory-limit-mebibytes",
                    &memory,
                    "--total-vcpu-limit",
                    &vcpu,
                    "--game-server-container-definition",
                    &container,
                ],
            )
            .await?;
        Ok(output.container_group_definition.name)
    }

    async fn describe_group_definition(
        &self,
        target: &FleetTarget,
        name: &str,
    ) -> RemoteResult<GroupDefinitionStatus> {
        let output: GroupDefinitionOutput = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &["gamelift", "describe-container-group-definition", "--name", name],
            )
            .await?;
        let status = output.container_group_definition.status;
        Ok(status
            .parse()
            .unwrap_or(GroupDefinitionStatus::Other(status)))
    }

    async fn create_fleet(
        &self,
        target: &FleetTarget,
        spec: &FleetSpec,
        group_definition: &str,
    ) -> RemoteResult<String> {
        let mut args = vec![
            "gamelift",
            "create-container-fleet",
            "--fleet-role-arn",
            self.fleet_role_arn.as_str(),
            "--game-server-container-group-definition-name",
            group_definition,
            "--description",
            spec.description.as_str(),
        ];
        if let Some(instance_type) = &spec.instance_type {
            args.extend(["--instance-type", instance_type.as_str()]);
        }

        let output: FleetOutput = self.cli.call(&target.profile, &target.region, &args).await?;
        Ok(output.container_fleet.fleet_id)
    }

    async fn describe_fleet(&self, target: &FleetTarget, fleet_id: &str) -> RemoteResult<FleetStatus> {
        let output: FleetOutput = self
            .cli
            .call(
                &target.profile,
                &target.region,
                &["gamelift", "describe-container-fleet", "--fleet-id", fleet_id],
            )
            .await?;
        let status = output.container_fleet.status;
        Ok(status.parse().unwrap_or(FleetStatus::Other(status)))
    }
}
