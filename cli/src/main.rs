mod commands;

use clap::Parser;
use commands::*;

use syncpoint_config::Config;

#[derive(Parser)]
#[command(name = "syncpoint-cli")]
#[command(about = "Syncpoint checkpoint operator CLI", long_about = None)]
struct Cli {
    /// Node API base URL (defaults to node_rpc_url from the config file)
    #[arg(long, global = true)]
    rpc: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let node_url = |cfg: &Config| cli.rpc.clone().unwrap_or_else(|| cfg.node_rpc_url.clone());

    match cli.command {
        Commands::GetCheckpoint => {
            let cfg = Config::load()?;
            get_checkpoint(&node_url(&cfg))
        }
        Commands::SendCheckpoint { hash } => {
            let cfg = Config::load()?;
            send_checkpoint(&node_url(&cfg), &hash)
        }
        Commands::SetCheckpointKey { key } => {
            let cfg = Config::load()?;
            set_checkpoint_key(&node_url(&cfg), &key)
        }
        Commands::Config { subcommand } => match subcommand {
            ConfigCommands::View => {
                let cfg = Config::load()?;
                println!("{}", cfg.view()?);
                Ok(())
            }
            ConfigCommands::Set { key, value } => {
                let mut cfg = Config::load()?;
                cfg.set_value(&key, &value)?;
                cfg.save()?;
                println!("{} updated", key);
                Ok(())
            }
            ConfigCommands::Init => {
                let path = Config::default_path();
                Config::default().save_to(&path)?;
                println!("Default configuration written to {}", path.display());
                Ok(())
            }
        },
    }
}
