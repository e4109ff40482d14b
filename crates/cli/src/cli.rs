use clap::{Args, Parser, Subcommand};

/// Rate-limited match history fetcher.
///
/// Fans a player's match list out to a worker pool that shares one request
/// budget, then caches the assembled history.
#[derive(Parser, Debug)]
#[command(name = "matchfan", about = "Rate-limited match history fan-out")]
pub struct CliArgs {
    /// Config profile; keys are read as `{PROFILE}_{KEY}` first
    #[arg(long, env = "MATCHFAN_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Store backend override: memory or redis
    #[arg(long, global = true)]
    pub backend: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the worker pool and reconciler until SIGINT/SIGTERM
    Run,

    /// Dispatch a fetch and follow it to completion in this process
    Fetch {
        #[command(flatten)]
        player: PlayerArgs,

        /// Skip the cache (the cooldown still applies)
        #[arg(long)]
        force: bool,

        /// Give up following after this many seconds
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },

    /// Show the current status snapshot for a player
    Status(PlayerArgs),

    /// Print the cached match history for a player
    History {
        #[command(flatten)]
        player: PlayerArgs,

        /// Zero-based page (page size from ARTIFACT_PAGE_SIZE)
        #[arg(long)]
        page: Option<usize>,
    },

    /// Run one reconciliation pass over live jobs
    Sweep,
}

#[derive(Args, Debug, Clone)]
pub struct PlayerArgs {
    /// Riot ID game name
    pub name: String,

    /// Riot ID tag line (without '#')
    pub tag: String,

    /// Platform: na, br, euw, eune, kr
    #[arg(long, short, default_value = "euw")]
    pub region: String,
}

impl PlayerArgs {
    pub fn handle(&self) -> matchfan_core::PlayerHandle {
        matchfan_core::PlayerHandle::new(&self.name, &self.tag, &self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fetch_with_flags() {
        let args = CliArgs::parse_from([
            "matchfan", "--backend", "redis", "fetch", "Faker", "KR1", "-r", "kr", "--force",
        ]);
        assert_eq!(args.backend.as_deref(), Some("redis"));
        match args.command {
            Command::Fetch { player, force, timeout_secs } => {
                assert_eq!(player.handle().to_string(), "Faker#KR1 (kr)");
                assert!(force);
                assert_eq!(timeout_secs, 600);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn history_page_is_optional() {
        let args = CliArgs::parse_from(["matchfan", "history", "a", "b"]);
        match args.command {
            Command::History { player, page } => {
                assert_eq!(player.region, "euw");
                assert!(page.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
