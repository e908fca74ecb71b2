//! Command-line argument parsing.

use clap::{Parser, Subcommand, ValueEnum};

use topolab_orchestrator::TopologyVerb;

/// topolab node - emulated network topology orchestrator
#[derive(Parser, Debug)]
#[command(name = "topolab-node")]
#[command(about = "topolab node - emulated network topology orchestrator")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true, env = "TOPOLAB_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log as JSON objects
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to the lab file
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// Enable development mode (mock backends and management plane)
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a lifecycle verb on a topology or one of its devices
    Action {
        topology: String,
        verb: Verb,
        /// Only act on this device
        #[arg(long)]
        device: Option<String>,
        /// Skip the topology status guard
        #[arg(long)]
        force: bool,
        /// Keep monitoring started topologies until interrupted
        #[arg(long)]
        monitor: bool,
    },

    /// Run a verb on the link between two devices
    Link {
        topology: String,
        a_device: String,
        z_device: String,
        verb: LinkVerbArg,
        /// Delay in milliseconds for `set-delay`
        #[arg(long)]
        delay: Option<u32>,
    },

    /// Monitor a topology until interrupted
    Monitor {
        topology: String,
        /// Run a single probe round and status check
        #[arg(long)]
        once: bool,
    },

    /// Run the status check once and write the result
    Check { topology: String },

    /// Show the state event log
    Events {
        topology: String,
        /// Delete the log instead
        #[arg(long)]
        clear: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Define,
    Start,
    Stop,
    Reboot,
    HardReset,
    Undefine,
}

impl From<Verb> for TopologyVerb {
    fn from(verb: Verb) -> Self {
        match verb {
            Verb::Define => TopologyVerb::Define,
            Verb::Start => TopologyVerb::Start,
            Verb::Stop => TopologyVerb::Stop,
            Verb::Reboot => TopologyVerb::Reboot,
            Verb::HardReset => TopologyVerb::HardReset,
            Verb::Undefine => TopologyVerb::Undefine,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkVerbArg {
    Start,
    Stop,
    SetDelay,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action() {
        let args = Args::parse_from([
            "topolab-node", "--dev", "action", "lab", "hard-reset", "--device", "r1", "--force",
        ]);
        assert!(args.dev);
        match args.command {
            Command::Action { topology, verb, device, force, monitor } => {
                assert_eq!(topology, "lab");
                assert_eq!(TopologyVerb::from(verb), TopologyVerb::HardReset);
                assert_eq!(device.as_deref(), Some("r1"));
                assert!(force);
                assert!(!monitor);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_link_delay() {
        let args = Args::parse_from(["topolab-node", "link", "lab", "r1", "r2", "set-delay", "--delay", "25"]);
        match args.command {
            Command::Link { verb, delay, .. } => {
                assert_eq!(verb, LinkVerbArg::SetDelay);
                assert_eq!(delay, Some(25));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
