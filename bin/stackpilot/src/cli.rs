use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stackpilot_deploy::Scenario;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "stackpilot")]
#[command(
    author,
    version,
    about = "Deploy game backend stacks through reviewed change sets"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "STACKPILOT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a Stackpilot.toml configuration file.
    ///
    /// Defaults to `Stackpilot.toml` in the current directory, when present.
    #[arg(long, alias = "conf", env = "STACKPILOT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store the profile, region and bucket every deployment uses.
    Configure {
        #[arg(long)]
        profile: String,

        #[arg(long)]
        region: String,

        /// Bucket that receives lambda sources and server builds.
        #[arg(long)]
        bucket: String,
    },

    /// List the available deployment scenarios.
    Scenarios,

    /// Deploy a scenario for a game and watch the stack until it settles.
    ///
    /// Ctrl+C rolls the deployment back once the stack operation has started,
    /// and stops watching otherwise.
    Deploy(DeployArgs),

    /// Resume watching the last deployment, e.g. after an interrupted `deploy`.
    Wait,

    /// Show the saved settings and the state of the current stack.
    Status,

    /// Delete the stack of a game and watch the deletion.
    Delete {
        /// Game whose stack is deleted. Defaults to the last deployed game.
        #[arg(long)]
        game: Option<String>,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Build and push a container image, then create a container fleet for it.
    Containers(ContainersArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct DeployArgs {
    /// Scenario to deploy, see `stackpilot scenarios`.
    #[arg(long)]
    pub scenario: Option<Scenario>,

    /// Name of the game. Also names the stack.
    #[arg(long, alias = "game-name")]
    pub game: Option<String>,

    /// Folder holding the server build.
    #[arg(long)]
    pub build_folder: Option<PathBuf>,

    /// Server executable, inside the build folder.
    #[arg(long)]
    pub build_file: Option<PathBuf>,

    /// Operating system of the server build.
    #[arg(long)]
    pub build_os: Option<String>,

    #[arg(long)]
    pub fleet_name: Option<String>,

    #[arg(long)]
    pub build_name: Option<String>,

    /// Extra arguments passed to the server executable.
    #[arg(long, allow_hyphen_values = true)]
    pub launch_parameters: Option<String>,

    /// Apply the change set without asking for confirmation.
    #[arg(short, long)]
    pub yes: bool,

    /// Deploy a development build.
    #[arg(long)]
    pub development: bool,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ContainersArgs {
    /// Registry repository URI, `registry/repository`.
    #[arg(long)]
    pub repository_uri: String,

    #[arg(long, default_value = "latest")]
    pub tag: String,

    /// Local image id to tag and push instead of building one.
    #[arg(long)]
    pub image_id: Option<String>,

    /// Name of the container group definition.
    #[arg(long)]
    pub group_name: String,

    #[arg(long, default_value_t = 1024)]
    pub memory_mib: u32,

    #[arg(long, default_value_t = 1.0)]
    pub vcpu: f64,

    /// First game server port.
    #[arg(long, default_value_t = 7770)]
    pub from_port: u16,

    /// Last game server port.
    #[arg(long, default_value_t = 7780)]
    pub to_port: u16,

    #[arg(long)]
    pub instance_type: Option<String>,

    /// Forget finished steps and run the whole pipeline again.
    #[arg(long)]
    pub restart: bool,
}
