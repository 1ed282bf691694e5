use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Application Locker
///
/// Blocks protected applications until they are unlocked with a code from
/// an authenticator app, a single-use recovery key or a PIN.
#[derive(Parser, Debug)]
#[command(name = "app-locker")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Enroll an authenticator app and print recovery keys
    Setup {
        /// Email address used for reset codes
        #[arg(long)]
        identity: String,
    },
    /// List installed applications that can be protected
    Apps {
        /// Only show names containing this text (case-insensitive)
        #[arg(long)]
        filter: Option<String>,
    },
    /// Start protecting one or more applications
    Protect {
        /// Application names, as shown by `apps`
        #[arg(required = true)]
        apps: Vec<String>,
    },
    /// Stop protecting an application
    Unprotect {
        app: String,

        /// Authenticator code or recovery key (prompted if omitted)
        #[arg(long)]
        code: Option<String>,
    },
    /// Show protected applications
    List,
    /// Set the PIN accepted by `unlock-pin`
    SetPin {
        /// Authenticator code or recovery key (prompted if omitted)
        #[arg(long)]
        code: Option<String>,
    },
    /// Replace a lost authenticator using an emailed code
    Reset {
        #[command(subcommand)]
        command: ResetCommands,
    },
    /// Enforce locks until interrupted
    Run {
        /// Do not read commands from stdin
        #[arg(long)]
        no_console: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ResetCommands {
    /// Email a reset code
    Request {
        #[arg(long)]
        identity: String,
    },
    /// Enroll a new authenticator with the emailed code
    Complete {
        #[arg(long)]
        identity: String,

        #[arg(long)]
        code: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_protect_with_global_flags() {
        let args = Args::parse_from(["app-locker", "protect", "Notepad", "Google Chrome", "-v"]);
        assert!(args.verbose);
        match args.command {
            Commands::Protect { apps } => assert_eq!(apps, vec!["Notepad", "Google Chrome"]),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parses_reset_complete() {
        let args = Args::parse_from([
            "app-locker",
            "--config",
            "/tmp/c.toml",
            "reset",
            "complete",
            "--identity",
            "parent@example.com",
            "--code",
            "123456",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(
            args.command,
            Commands::Reset {
                command: ResetCommands::Complete { .. }
            }
        ));
    }

    #[test]
    fn protect_requires_an_app() {
        assert!(Args::try_parse_from(["app-locker", "protect"]).is_err());
    }
}
