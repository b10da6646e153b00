//! CLI argument definitions for the `medpass` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// MedPASS session client.
#[derive(Parser)]
#[command(
    name = "medpass",
    version,
    about = "Sign in to MedPASS and manage the local session",
    long_about = "Signs in with a MedPASS username/password or a Google account, keeps the \
                  session fresh, and answers route-guard questions for protected pages."
)]
pub struct Cli {
    /// Directory holding the encrypted session cache and its key.
    #[arg(long, global = true, env = "MEDPASS_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in with a MedPASS username and password.
    Login {
        #[arg(long, short)]
        username: String,
        /// Prompted for without echo when omitted.
        #[arg(long, short, env = "MEDPASS_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Sign in with Google and link the account to its NetID.
    Google {
        /// Page to return to after sign-in.
        #[arg(long)]
        return_to: Option<String>,
        /// Seconds to wait for the browser redirect.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Refresh the access token now.
    Refresh,

    /// Show who is signed in.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a usable access token, refreshing it if needed.
    Token,

    /// Sign out and forget the cached session.
    Logout,

    /// Decide what happens when navigating to PATH.
    Guard { path: String },

    /// Record that the signed-in user confirmed their NetID.
    VerifyNetid,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_login_and_guard() {
        let cli = Cli::parse_from(["medpass", "login", "--username", "jdoe", "-p", "pw"]);
        assert!(matches!(
            cli.command,
            Commands::Login { ref username, password: Some(_) } if username == "jdoe"
        ));

        let cli = Cli::parse_from(["medpass", "--data-dir", "/tmp/m", "guard", "/calendar"]);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/m"));
        assert!(matches!(cli.command, Commands::Guard { ref path } if path == "/calendar"));
    }

    #[test]
    fn verify_netid_is_kebab_case() {
        let cli = Cli::parse_from(["medpass", "verify-netid"]);
        assert!(matches!(cli.command, Commands::VerifyNetid));
    }
}
