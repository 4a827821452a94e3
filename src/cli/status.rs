use crate::Result;
use crate::config::make_namespec;
use crate::ipc::client::IpcClient;
use crate::states::ProcessState;
use comfy_table::{Table, presets};

/// Show process status
#[derive(Debug, clap::Args)]
pub struct Status {
    /// Restrict to these namespecs or a config type
    /// (domain|nodes|waveforms|process)
    names: Vec<String>,
}

impl Status {
    pub async fn run(&self) -> Result<()> {
        let client = IpcClient::connect().await?;
        let infos = client.get_all_process_info().await?;

        let filters = crate::cli::expand_targets(&client, &self.names).await?;
        let matches = |group: &str, name: &str| {
            if filters.is_empty() {
                return true;
            }
            let namespec = make_namespec(group, name);
            filters.iter().any(|f| {
                *f == namespec
                    || *f == format!("{group}:*")
                    || f.as_str() == group
                    || f.as_str() == name
            })
        };

        let mut table = Table::new();
        table.load_preset(presets::NOTHING);
        for info in infos {
            if !matches(&info.group, &info.name) {
                continue;
            }
            let statename = style_state(info.state, &info.statename);
            table.add_row(vec![
                make_namespec(&info.group, &info.name),
                statename,
                info.description.clone(),
            ]);
        }
        println!("{table}");
        Ok(())
    }
}

fn style_state(code: i32, name: &str) -> String {
    match ProcessState::from_code(code) {
        Some(ProcessState::Running) => console::style(name).green().to_string(),
        Some(ProcessState::Starting) | Some(ProcessState::Stopping) => {
            console::style(name).yellow().to_string()
        }
        Some(ProcessState::Backoff) | Some(ProcessState::Fatal) | Some(ProcessState::Unknown) => {
            console::style(name).red().to_string()
        }
        Some(ProcessState::Disabled) => console::style(name).dim().to_string(),
        _ => name.to_string(),
    }
}
