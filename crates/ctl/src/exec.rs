//! Command executor
//!
//! Interprets one control command against the latency client, the plugin
//! registry and the handler set, and builds the result frame. Commands run
//! strictly one at a time on the server dispatch task; failures come back
//! as `rtn != 0` with a human-readable message.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use frontrank_core::{Reporter, Result as CoreResult, State};
use frontrank_plugin::{FrontPlugin, PluginContainer};

use crate::cmd::{CmdResult, Command, ResultKey};
use crate::server::CtlServer;

/// Execute one command and build its result.
pub(crate) async fn execute(svr: &CtlServer, cmd: &Command) -> CmdResult {
    info!(cmd = %cmd, "executing command");

    let name = cmd.name.to_ascii_lowercase();

    // `start` is the one command that works with an empty client slot
    if name == "start" {
        return exec_start(svr, cmd).await;
    }

    let Some(client) = svr.latency_client() else {
        return CmdResult::fail(&cmd.name, "no latency client");
    };

    match name.as_str() {
        "suspend" => {
            if client.suspend() {
                CmdResult::ok(&cmd.name).with_message("suspend success")
            } else {
                CmdResult::fail(&cmd.name, "suspend failed")
            }
        }
        "resume" => {
            if client.resume() {
                CmdResult::ok(&cmd.name).with_message("resume success")
            } else {
                CmdResult::fail(&cmd.name, "resume failed")
            }
        }
        "stop" => match svr.stop_latency_client().await {
            Ok(()) => CmdResult::ok(&cmd.name).with_message("latency client stopped"),
            Err(err) => CmdResult::fail(&cmd.name, format!("stop latency client failed: {err}")),
        },
        "period" => exec_period(&client, cmd).await,
        "state" => match client.last_state() {
            Some(state) => with_state(CmdResult::ok(&cmd.name), &state),
            None => CmdResult::fail(&cmd.name, "get last state failed"),
        },
        "config" => match client.set_config(&cmd.kw_args).await {
            Ok(()) => {
                match CmdResult::ok(&cmd.name).with_value(ResultKey::Config, &*client.config()) {
                    Ok(result) => result,
                    Err(err) => CmdResult::fail(&cmd.name, format!("marshal config failed: {err}")),
                }
            }
            Err(err) => CmdResult::fail(&cmd.name, format!("set config failed: {err}")),
        },
        "query" => match client.query_latency(&cmd.kw_args).await {
            Ok(state) => with_state(CmdResult::ok(&cmd.name), &state),
            Err(err) => CmdResult::fail(&cmd.name, format!("query latency failed: {err}")),
        },
        "plugin" => exec_plugin(&client, cmd).await,
        "unplugin" => exec_unplugin(&client, cmd).await,
        "info" => exec_info(svr, &client, cmd),
        _ => CmdResult::fail(&cmd.name, "unsupported command"),
    }
}

async fn exec_start(svr: &CtlServer, cmd: &Command) -> CmdResult {
    match svr.start_latency_client(&cmd.kw_args).await {
        Ok(client) => {
            let interval = humantime::format_duration(client.interval()).to_string();
            match CmdResult::ok(&cmd.name).with_value(ResultKey::Interval, &interval) {
                Ok(result) => result.with_message("latency client started"),
                Err(_) => CmdResult::ok(&cmd.name).with_message("latency client started"),
            }
        }
        Err(err) => CmdResult::fail(&cmd.name, format!("start latency client failed: {err}")),
    }
}

async fn exec_period(client: &frontrank_core::LatencyClient, cmd: &Command) -> CmdResult {
    let Some(raw) = cmd.kw_args.get("interval") else {
        return CmdResult::fail(&cmd.name, "no interval arg");
    };

    let interval = match humantime::parse_duration(raw) {
        Ok(interval) => interval,
        Err(err) => return CmdResult::fail(&cmd.name, format!("parse interval failed: {err}")),
    };

    if interval.is_zero() {
        return CmdResult::fail(&cmd.name, format!("invalid interval: {raw}"));
    }

    let origin = client.change_interval(interval).await;

    let result = CmdResult::ok(&cmd.name)
        .with_value(
            ResultKey::Origin,
            &humantime::format_duration(origin).to_string(),
        )
        .and_then(|r| {
            r.with_value(
                ResultKey::Interval,
                &humantime::format_duration(interval).to_string(),
            )
        });

    match result {
        Ok(result) => result,
        Err(err) => CmdResult::fail(&cmd.name, format!("marshal interval failed: {err}")),
    }
}

/// Bridges a loaded plugin into the reporter registry.
struct PluginReporter {
    plugin: Arc<dyn FrontPlugin>,
}

#[async_trait::async_trait]
impl Reporter for PluginReporter {
    async fn report(&self, state: Arc<State>) -> CoreResult<()> {
        let plugin = Arc::clone(&self.plugin);

        tokio::task::spawn_blocking(move || plugin.report_fronts(&state.addr_list))
            .await
            .map_err(|err| frontrank_core::Error::Reporter(err.to_string()))?
            .map_err(|err| frontrank_core::Error::Reporter(err.to_string()))
    }
}

async fn exec_plugin(client: &frontrank_core::LatencyClient, cmd: &Command) -> CmdResult {
    let Some(name) = cmd.kw_args.get("plugin") else {
        return CmdResult::fail(&cmd.name, "no plugin name");
    };
    let Some(cfg_path) = cmd.kw_args.get("config") else {
        return CmdResult::fail(&cmd.name, "no plugin config");
    };
    let Some(lib_dir) = cmd.kw_args.get("lib") else {
        return CmdResult::fail(&cmd.name, "no plugin base dir");
    };

    let container = match frontrank_plugin::load(Path::new(lib_dir), name) {
        Ok(container) => container,
        Err(err) => {
            return CmdResult::fail(&cmd.name, format!("create plugin failed: {err}"));
        }
    };

    if let Err(err) = init_plugin(&container, cfg_path.clone()).await {
        let _ = frontrank_plugin::unregister(name);
        return CmdResult::fail(&cmd.name, format!("init plugin failed: {err}"));
    }

    if let Err(err) = client.add_reporter(
        name,
        Arc::new(PluginReporter {
            plugin: container.plugin_arc(),
        }),
    ) {
        stop_plugin(&container).await;
        let _ = frontrank_plugin::unregister(name);
        return CmdResult::fail(&cmd.name, format!("add reporter failed: {err}"));
    }

    CmdResult::ok(&cmd.name).with_message(format!("plugin {name} loaded"))
}

async fn exec_unplugin(client: &frontrank_core::LatencyClient, cmd: &Command) -> CmdResult {
    let Some(name) = cmd.kw_args.get("plugin") else {
        return CmdResult::fail(&cmd.name, "no plugin name");
    };

    if let Err(err) = client.remove_reporter(name) {
        return CmdResult::fail(&cmd.name, format!("del reporter from client failed: {err}"));
    }

    let (container, warning) = match frontrank_plugin::unregister(name) {
        Ok(pair) => pair,
        Err(err) => {
            return CmdResult::fail(&cmd.name, format!("get registered plugin failed: {err}"));
        }
    };

    if let Some(warning) = warning {
        warn!(error = %warning, "unregister plugin with warning");
    }

    let plugin = container.plugin_arc();
    let join_result = tokio::task::spawn_blocking(move || {
        plugin.stop();
        plugin.join()
    })
    .await;

    match join_result {
        Ok(Ok(())) => CmdResult::ok(&cmd.name).with_message(format!("plugin {name} unloaded")),
        Ok(Err(err)) => CmdResult::fail(&cmd.name, format!("plugin stop failed: {err}")),
        Err(err) => CmdResult::fail(&cmd.name, format!("plugin stop failed: {err}")),
    }
}

fn exec_info(
    svr: &CtlServer,
    client: &frontrank_core::LatencyClient,
    cmd: &Command,
) -> CmdResult {
    let mut result = CmdResult::ok(&cmd.name);

    if let Some(state) = client.last_state() {
        result = with_state(result, &state);
        if !result.is_ok() {
            return result;
        }
    }

    let interval = humantime::format_duration(client.interval()).to_string();

    let filled = result
        .with_value(ResultKey::Interval, &interval)
        .and_then(|r| r.with_value(ResultKey::Plugins, &frontrank_plugin::list()))
        .and_then(|r| r.with_value(ResultKey::Handlers, &svr.handler_infos()));

    match filled {
        Ok(result) => result,
        Err(err) => CmdResult::fail(&cmd.name, format!("marshal info failed: {err}")),
    }
}

async fn init_plugin(
    container: &Arc<PluginContainer>,
    cfg_path: String,
) -> frontrank_plugin::Result<()> {
    let container = Arc::clone(container);

    tokio::task::spawn_blocking(move || container.plugin().init(&cfg_path))
        .await
        .unwrap_or_else(|_| Err(frontrank_plugin::Error::InitFailed(-1)))
}

async fn stop_plugin(container: &Arc<PluginContainer>) {
    let container = Arc::clone(container);

    let _ = tokio::task::spawn_blocking(move || {
        container.plugin().stop();
        container.plugin().join()
    })
    .await;
}

fn with_state(result: CmdResult, state: &State) -> CmdResult {
    let cmd_name = result.cmd_name.clone();

    match result.with_value(ResultKey::State, state) {
        Ok(result) => result,
        Err(err) => CmdResult::fail(cmd_name, format!("marshal state failed: {err}")),
    }
}
