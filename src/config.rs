use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "anthive",
    about = "Ephemeral compute fleets and parallel order dispatch",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Roster file tracking the active fleet (default: ~/.anthive).
    #[arg(long, global = true, value_name = "PATH")]
    pub roster: Option<PathBuf>,

    /// Base URL of the provisioning API.
    #[arg(
        long,
        global = true,
        value_name = "URL",
        env = "ANTHIVE_API_URL",
        default_value = "https://api.anthive.dev"
    )]
    pub api_url: String,

    /// Bearer token for the provisioning API.
    #[arg(
        long,
        global = true,
        value_name = "TOKEN",
        env = "ANTHIVE_API_TOKEN",
        hide_env_values = true,
        default_value = ""
    )]
    pub api_token: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Assemble the fleet, reusing running members where possible.
    Up(UpArgs),

    /// Dispatch commands and payload files to every member.
    Order(OrderArgs),

    /// Terminate every tracked member and clear the roster.
    Down,

    /// Report provider-side state for every tracked member.
    Report,
}

#[derive(Args, Debug, Clone)]
pub struct UpArgs {
    /// SSH key pair name used to create and reach new members. A matching
    /// ~/.ssh/<KEY>.pem is used when present; the ssh agent otherwise.
    #[arg(short, long, value_name = "KEY")]
    pub key: String,

    /// Number of members the fleet should contain.
    #[arg(short = 's', long, value_name = "COUNT", default_value_t = 5)]
    pub servers: u32,

    /// Security group the members run under.
    #[arg(short, long, value_name = "GROUP", default_value = "default")]
    pub group: String,

    /// Availability zone to place members in.
    #[arg(short, long, value_name = "ZONE", default_value = "us-east-1d")]
    pub zone: String,

    /// Machine image for each member.
    #[arg(short, long, value_name = "IMAGE")]
    pub image: String,

    /// Instance type for each member.
    #[arg(short = 't', long = "type", value_name = "TYPE", default_value = "t3.micro")]
    pub instance_type: String,

    /// SSH username used to connect to members.
    #[arg(short = 'l', long, value_name = "LOGIN", default_value = "ubuntu")]
    pub login: String,

    /// VPC subnet id to launch members into.
    #[arg(short = 'v', long, value_name = "SUBNET")]
    pub subnet: Option<String>,

    /// Maximum bid price per spot member; on-demand members when omitted.
    #[arg(short, long, value_name = "BID")]
    pub bid: Option<f64>,
}

/// Commands run before payload files; within each kind, rounds run in the
/// order given.
#[derive(Args, Debug, Clone)]
#[command(group = ArgGroup::new("payload").required(true).multiple(true))]
pub struct OrderArgs {
    /// Command to run on every member (repeatable).
    #[arg(short = 'o', long = "order", value_name = "COMMAND", group = "payload")]
    pub orders: Vec<String>,

    /// Local payload file to upload and run on every member (repeatable).
    #[arg(short = 'f', long = "file", value_name = "PATH", group = "payload")]
    pub files: Vec<PathBuf>,

    /// Per-member execution timeout in seconds; 0 waits indefinitely.
    #[arg(long, value_name = "SECONDS", default_value_t = 600)]
    pub timeout: u64,
}
