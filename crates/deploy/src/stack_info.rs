//! Latest known state of the current stack, as presented to a UI.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::{StackDescription, StackStatus};
use crate::waiter::DeploymentInfo;

/// Output key holding the client-facing API endpoint.
pub const API_GATEWAY_ENDPOINT_KEY: &str = "ApiGatewayEndpoint";
/// Output key holding the identity pool client id.
pub const USER_POOL_CLIENT_ID_KEY: &str = "UserPoolClientId";

pub const STATUS_NOTHING_DEPLOYED: &str = "No deployment";
pub const STATUS_DEPLOYMENT_STARTING: &str = "Deployment starting...";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeploymentStackInfo {
    /// Human readable status line.
    pub status: String,
    /// Raw provider status, absent when nothing is deployed.
    pub stack_status: Option<StackStatus>,
    /// Region, scenario, game and update time, formatted.
    pub details: Option<String>,
    pub outputs: BTreeMap<String, String>,
}

impl DeploymentStackInfo {
    /// Info that only carries a message, no stack.
    pub fn message(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }

    pub fn nothing_deployed() -> Self {
        Self::message(STATUS_NOTHING_DEPLOYED)
    }

    pub fn from_description(
        description: &StackDescription,
        region: &str,
        scenario_name: &str,
    ) -> Self {
        Self::build(
            &description.status,
            region,
            scenario_name,
            description.game_name.as_deref(),
            description.last_updated,
            &description.outputs,
        )
    }

    pub fn from_info(info: &DeploymentInfo) -> Self {
        Self::build(
            &info.stack_status,
            &info.region,
            &info.scenario_name,
            info.game_name.as_deref(),
            info.last_updated,
            &info.outputs,
        )
    }

    fn build(
        status: &StackStatus,
        region: &str,
        scenario_name: &str,
        game_name: Option<&str>,
        last_updated: Option<DateTime<Utc>>,
        outputs: &BTreeMap<String, String>,
    ) -> Self {
        let updated = last_updated
            .map(|time| time.format("%Y-%m-%d %I:%M %p").to_string())
            .unwrap_or_else(|| "-".to_string());

        Self {
            status: format!("Status: {status}"),
            stack_status: Some(status.clone()),
            details: Some(format!(
                "Region: {region}, Scenario: {scenario_name}, Game: {}, Updated: {updated}",
                game_name.unwrap_or("-")
            )),
            outputs: outputs.clone(),
        }
    }

    pub fn has_stack(&self) -> bool {
        self.details.is_some()
    }

    pub fn api_gateway_endpoint(&self) -> Option<&str> {
        self.outputs.get(API_GATEWAY_ENDPOINT_KEY).map(String::as_str)
    }

    pub fn user_pool_client_id(&self) -> Option<&str> {
        self.outputs.get(USER_POOL_CLIENT_ID_KEY).map(String::as_str)
    }

    /// A missing stack can always be deployed.
    pub fn is_modifiable(&self) -> bool {
        self.stack_status
            .as_ref()
            .is_none_or(StackStatus::is_modifiable)
    }
}
