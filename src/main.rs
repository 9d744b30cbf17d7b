use std::collections::HashMap;
use std::io::{self, Read};
use std::process;
use std::sync::Arc;

// 3rd-party libs
use clap::Parser;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use wireflow_core::runtime::diff::DeploymentType;
use wireflow_core::runtime::engine::{Engine, EngineBuilder};
use wireflow_core::runtime::events::Events;
use wireflow_core::runtime::model::json::helpers;
use wireflow_core::runtime::model::*;
use wireflow_core::runtime::registry::{RegistryBuilder, RegistryHandle};
use wireflow_core::runtime::settings::Settings;
use wireflow_core::runtime::storage::MemoryStorage;
use wireflow_core::*;

mod cliargs;
mod consts;
mod logging;

pub use cliargs::*;

#[derive(Debug, Clone)]
pub struct MsgInjectionEntry {
    pub nid: ElementId,
    pub msg: MsgHandle,
}

#[derive(Debug)]
struct App {
    _registry: RegistryHandle,
    engine: Engine,
    msgs_to_inject: Mutex<Vec<MsgInjectionEntry>>,
}

impl App {
    pub async fn new(elargs: Arc<CliArgs>, app_config: Option<&config::Config>) -> wireflow_core::Result<Self> {
        log::info!("Loading node registry...");
        let events = Arc::new(Events::new());
        events.on("runtime-event", |payload| {
            log::warn!("Runtime event: {:?}", payload);
        });
        let reg = RegistryBuilder::default().with_events(events.clone()).build()?;

        let settings = Arc::new(Settings::new(local_settings(app_config), Arc::new(MemoryStorage::new())));
        settings.load().await?;

        let mut msgs_to_inject = Vec::new();

        let flows_json = if elargs.stdin {
            log::info!("Loading flows JSON from stdin...");
            let mut buffer = Vec::new();
            io::stdin().read_to_end(&mut buffer)?;
            let json_str = String::from_utf8_lossy(&buffer);
            let flows_json: serde_json::Value = serde_json::from_str(&json_str)?;

            // Accept either a plain flows array or an object wrapping the
            // flows plus messages to inject after start:
            // {"flows": [...], "injections": [{"nid": "...", "msg": {...}}]}
            match flows_json {
                serde_json::Value::Object(ref obj) if obj.contains_key("flows") => {
                    if let Some(injections) = obj.get("injections").and_then(|x| x.as_array()) {
                        for injection in injections.iter() {
                            let nid = injection
                                .get("nid")
                                .and_then(helpers::parse_id_value)
                                .ok_or(WireflowError::BadArgument("nid"))?;
                            let msg = Msg::deserialize(&injection["msg"])?;
                            msgs_to_inject.push(MsgInjectionEntry { nid, msg: MsgHandle::new(msg) });
                        }
                    }
                    obj["flows"].clone()
                }
                other => other,
            }
        } else {
            log::info!("Loading flows file: {}", elargs.flows_path);
            let json_str = std::fs::read_to_string(&elargs.flows_path)?;
            serde_json::from_str(&json_str)?
        };

        let engine = EngineBuilder::default()
            .with_registry(reg.clone())
            .with_events(events)
            .with_settings(settings)
            .build(app_config)?;
        engine.set_flows(flows_json, DeploymentType::Full, false).await?;

        Ok(App { _registry: reg, engine, msgs_to_inject: Mutex::new(msgs_to_inject) })
    }

    async fn main_flow_task(self: Arc<Self>, cancel: CancellationToken) -> wireflow_core::Result<()> {
        self.engine.start().await?;

        {
            let mut entries = self.msgs_to_inject.lock().await;
            for e in entries.iter() {
                self.engine.inject_msg(&e.nid, e.msg.clone(), cancel.clone()).await?;
            }
            entries.clear();
        }

        cancel.cancelled().await;

        self.engine.stop().await?;
        log::info!("The flows engine stopped.");
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> wireflow_core::Result<()> {
        self.main_flow_task(cancel).await
    }
}

/// The read-only local settings layer, seeded from the configuration
/// file's `settings` section.
fn local_settings(app_config: Option<&config::Config>) -> HashMap<String, Variant> {
    let mut local = HashMap::new();
    if let Some(cfg) = app_config {
        if let Ok(table) = cfg.get_table("settings") {
            for (key, value) in table.into_iter() {
                if let Ok(jv) = value.try_deserialize::<serde_json::Value>() {
                    local.insert(key, Variant::from(jv));
                }
            }
        }
    }
    local
}

fn load_config(cli_args: &CliArgs) -> anyhow::Result<Option<config::Config>> {
    let home_dir = dirs_next::home_dir()
        .map(|x| x.join(".wireflow").to_string_lossy().to_string())
        .expect("Cannot get the `~/home` directory");

    let wireflow_home_dir = cli_args.home.clone().or(std::env::var("WIREFLOW_HOME").ok()).or(Some(home_dir));

    let run_env = cli_args.env.clone().or(std::env::var("WIREFLOW_RUN_ENV").ok()).unwrap_or("dev".to_string());

    if cli_args.verbose > 0 {
        if let Some(ref x) = wireflow_home_dir {
            eprintln!("$WIREFLOW_HOME={}", x);
        }
    }

    if let Some(md) = wireflow_home_dir.as_ref().and_then(|x| std::fs::metadata(x).ok()) {
        if md.is_dir() {
            let mut builder = config::Config::builder();

            builder = if let Some(hd) = wireflow_home_dir {
                builder
                    .add_source(config::File::with_name(&format!("{}/wireflowd.toml", hd)).required(false))
                    .add_source(config::File::with_name(&format!("{}/wireflowd.{}.toml", hd, run_env)).required(false))
                    .set_override("home_dir", hd)?
            } else {
                builder
            };

            builder = builder.set_override("run_env", run_env)?;
            let config = builder.build()?;
            return Ok(Some(config));
        }
    }
    if cli_args.verbose > 0 {
        eprintln!("The `$WIREFLOW_HOME` directory does not exist!");
    }
    Ok(None)
}

async fn app_main(cli_args: Arc<CliArgs>) -> anyhow::Result<()> {
    if cli_args.verbose > 0 {
        eprintln!("{} v{}\n", consts::APP_NAME, consts::APP_VERSION);
        eprintln!("Loading configuration...");
    }
    let cfg = load_config(&cli_args)?;

    logging::init(&cli_args, cfg.as_ref())?;

    let app = Arc::new(App::new(cli_args, cfg.as_ref()).await?);

    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl-C, stopping...");
            ctrl_c_cancel.cancel();
        }
    });

    app.run(cancel).await?;
    Ok(())
}

fn main() {
    let cli_args = Arc::new(CliArgs::parse());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build the tokio runtime");

    if let Err(e) = runtime.block_on(app_main(cli_args)) {
        eprintln!("Fatal error: {:?}", e);
        process::exit(1);
    }
}
