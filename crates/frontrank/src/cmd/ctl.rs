//! `ctl` - drive a running watcher over its control plane

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use frontrank_ctl::{connect_uri, wait_result, Command, CtlClient};

use crate::cmd::{watch_signals, QueryArgs};

const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Args, Debug)]
pub struct CtlArgs {
    /// Server URI (ipc://<path> or tcp://<host:port>)
    #[arg(long, default_value = "ipc:///tmp/frontrank.sock")]
    pub uri: String,

    /// Command: suspend | resume | period | state | config | query |
    /// plugin | unplugin | stop | start | info
    #[arg(long)]
    pub cmd: String,

    /// Poll interval for `period` / `start`, e.g. 30s
    #[arg(long)]
    pub interval: Option<String>,

    /// Plugin name for `plugin` / `unplugin`
    #[arg(long)]
    pub plugin: Option<String>,

    /// Plugin config file path for `plugin`
    #[arg(long)]
    pub plugin_config: Option<String>,

    /// Plugin library directory for `plugin`
    #[arg(long)]
    pub lib: Option<String>,

    #[command(flatten)]
    pub query: QueryArgs,

    /// Stay connected and print state broadcasts
    #[arg(long)]
    pub follow: bool,
}

impl CtlArgs {
    fn build_command(&self) -> Result<Command> {
        let mut cmd = Command::new(self.cmd.to_ascii_lowercase());

        match cmd.name.as_str() {
            "suspend" | "resume" | "state" | "info" | "stop" => {}
            "period" => match &self.interval {
                Some(interval) => {
                    cmd = cmd.arg("interval", interval);
                }
                None => bail!("period requires --interval"),
            },
            "config" | "query" => {
                for (key, value) in self.query.kwargs() {
                    cmd = cmd.arg(key, value);
                }
            }
            "start" => {
                if let Some(interval) = &self.interval {
                    cmd = cmd.arg("interval", interval);
                }
                for (key, value) in self.query.kwargs() {
                    cmd = cmd.arg(key, value);
                }
            }
            "plugin" => {
                let (Some(plugin), Some(config), Some(lib)) =
                    (&self.plugin, &self.plugin_config, &self.lib)
                else {
                    bail!("plugin requires --plugin, --plugin-config and --lib");
                };

                cmd = cmd
                    .arg("plugin", plugin)
                    .arg("config", config)
                    .arg("lib", lib);
            }
            "unplugin" => match &self.plugin {
                Some(plugin) => {
                    cmd = cmd.arg("plugin", plugin);
                }
                None => bail!("unplugin requires --plugin"),
            },
            other => bail!("unsupported command: {other}"),
        }

        Ok(cmd)
    }
}

pub async fn run(args: CtlArgs) -> Result<()> {
    let command = args.build_command()?;

    let client = connect_uri(&args.uri).await?;
    let mut rx = client.subscribe();

    client.start().await?;

    let msg_id = client.command(&command).await?;
    let result = wait_result(&mut rx, msg_id, RESULT_TIMEOUT).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if args.follow {
        let cancel = CancellationToken::new();
        watch_signals(cancel.clone());

        client.message_loop(
            "follow",
            None,
            Some(Box::new(|state| {
                println!(
                    "broadcast @ {}: {:?}",
                    state.timestamp.to_rfc3339(),
                    state.addr_list
                );
                Ok(())
            })),
            None,
            Some(Box::new(|| {
                info!("follow loop closed");
                Ok(())
            })),
        )?;

        cancel.cancelled().await;
    }

    client.release().await;

    if !result.is_ok() {
        bail!("{}: {}", result.cmd_name, result.message);
    }

    Ok(())
}
