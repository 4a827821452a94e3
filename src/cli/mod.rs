use crate::Result;
use crate::config::ConfigType;
use crate::ipc::client::IpcClient;
use clap::Parser;
use itertools::Itertools;

mod add;
mod clear;
mod pid;
mod probe;
mod reload;
mod remove;
mod reread;
mod restart;
mod run;
mod shutdown;
mod signal;
mod start;
mod status;
mod stop;
mod tail;
mod update;

#[derive(Debug, clap::Parser)]
#[clap(name = "warden", version, about = "Fleet process supervisor")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    Run(run::Run),
    Start(start::Start),
    Stop(stop::Stop),
    Restart(restart::Restart),
    Status(status::Status),
    Signal(signal::Signal),
    Tail(tail::Tail),
    Pid(pid::Pid),
    Clear(clear::Clear),
    Add(add::Add),
    Remove(remove::Remove),
    Reread(reread::Reread),
    Update(update::Update),
    Shutdown(shutdown::Shutdown),
    Reload(reload::Reload),
    #[clap(hide = true)]
    Probe(probe::Probe),
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    let result = match args.command {
        Command::Run(cmd) => cmd.run().await,
        Command::Start(cmd) => cmd.run().await,
        Command::Stop(cmd) => cmd.run().await,
        Command::Restart(cmd) => cmd.run().await,
        Command::Status(cmd) => cmd.run().await,
        Command::Signal(cmd) => cmd.run().await,
        Command::Tail(cmd) => cmd.run().await,
        Command::Pid(cmd) => cmd.run().await,
        Command::Clear(cmd) => cmd.run().await,
        Command::Add(cmd) => cmd.run().await,
        Command::Remove(cmd) => cmd.run().await,
        Command::Reread(cmd) => cmd.run().await,
        Command::Update(cmd) => cmd.run().await,
        Command::Shutdown(cmd) => cmd.run().await,
        Command::Reload(cmd) => cmd.run().await,
        Command::Probe(cmd) => cmd.run().await,
    };
    if let Err(err) = result {
        error!("{err:?}");
        // EX_SOFTWARE; clap reports usage errors as 2 on its own
        std::process::exit(70);
    }
    Ok(())
}

/// Expand CLI targets: a config-type word (domain|nodes|waveforms|process)
/// selects every group of that type; anything else passes through as a
/// namespec.
pub(crate) async fn expand_targets(client: &IpcClient, names: &[String]) -> Result<Vec<String>> {
    let mut out = vec![];
    for name in names {
        if let Ok(config_type) = name.parse::<ConfigType>() {
            let infos = client.get_config_info(None).await?;
            let groups: Vec<String> = infos
                .iter()
                .filter(|i| i.config_type == config_type.to_string())
                .map(|i| i.group.clone())
                .unique()
                .collect();
            if groups.is_empty() {
                warn!("no groups with config_type {config_type}");
            }
            out.extend(groups.into_iter().map(|g| format!("{g}:*")));
        } else {
            out.push(name.clone());
        }
    }
    Ok(out)
}
