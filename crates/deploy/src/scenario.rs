//! Built-in deployment scenarios and where their templates live.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

const HELP_URL: &str =
    "https://docs.aws.amazon.com/gamelift/latest/developerguide/unity-plug-in-scenario.html";

/// A deployment scenario: one template folder plus what it needs from the form.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    AuthOnly,
    SingleRegionFleet,
    MultiRegionQueue,
    SpotFleets,
    Flexmatch,
    ContainersSingleFleet,
    ContainersFlexmatch,
}

impl Scenario {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::AuthOnly => "Auth Only",
            Self::SingleRegionFleet => "Single-Region Fleet",
            Self::MultiRegionQueue => "Multi-Region Fleets with Queue and Custom Matchmaker",
            Self::SpotFleets => "SPOT Fleets with Queue and Custom Matchmaker",
            Self::Flexmatch => "FlexMatch",
            Self::ContainersSingleFleet => "Single-Region Container Fleet",
            Self::ContainersFlexmatch => "Containers FlexMatch",
        }
    }

    pub fn folder(&self) -> &'static str {
        match self {
            Self::AuthOnly => "scenario1_auth_only",
            Self::SingleRegionFleet => "scenario2_single_fleet",
            Self::MultiRegionQueue => "scenario3_mrf_queue",
            Self::SpotFleets => "scenario4_spot_fleets",
            Self::Flexmatch => "scenario5_flexmatch",
            Self::ContainersSingleFleet => "scenario3_containers_single_fleet",
            Self::ContainersFlexmatch => "scenario4_containers_flexmatch",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::AuthOnly => {
                "Sets up player authentication and a backend service, without any game servers."
            }
            Self::SingleRegionFleet => {
                "A game backend with a single fleet. Game sessions are searched for or created on demand."
            }
            Self::MultiRegionQueue => {
                "Fleets in several regions behind a queue, with a custom matchmaker."
            }
            Self::SpotFleets => "Spot and on-demand fleets behind a queue, with a custom matchmaker.",
            Self::Flexmatch => "Fleets placed by FlexMatch matchmaking.",
            Self::ContainersSingleFleet => "A single container fleet running the pushed image.",
            Self::ContainersFlexmatch => "A container fleet placed by FlexMatch matchmaking.",
        }
    }

    pub fn help_url(&self) -> &'static str {
        HELP_URL
    }

    /// Whether the scenario uploads a server build folder.
    pub fn has_game_server(&self) -> bool {
        matches!(
            self,
            Self::SingleRegionFleet | Self::MultiRegionQueue | Self::SpotFleets | Self::Flexmatch
        )
    }

    pub fn preferred_order(&self) -> u32 {
        match self {
            Self::AuthOnly => 1,
            Self::SingleRegionFleet => 2,
            Self::MultiRegionQueue => 3,
            Self::SpotFleets => 4,
            Self::Flexmatch => 5,
            Self::ContainersSingleFleet => 10,
            Self::ContainersFlexmatch => 11,
        }
    }

    /// Look a scenario up by its display name.
    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::iter().find(|scenario| scenario.display_name() == name)
    }
}

/// Locates scenario folders under a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioCatalog {
    root: PathBuf,
}

impl ScenarioCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All scenarios in their preferred order.
    pub fn scenarios(&self) -> Vec<Scenario> {
        let mut scenarios: Vec<Scenario> = Scenario::iter().collect();
        scenarios.sort_by_key(Scenario::preferred_order);
        scenarios
    }

    pub fn path_of(&self, scenario: Scenario) -> PathBuf {
        self.root.join(scenario.folder())
    }
}
