use clap::Parser;

const LONG_ABOUT: &str = r#"
Wireflow Daemon Program

Wireflow is a flow-based message routing runtime: flows of nodes wired
into a directed graph, executed concurrently on top of tokio.

Test a workflow on a desktop machine first, then ship wireflowd together
with the `flows.json` workflow file to the device that runs it.
"#;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about=LONG_ABOUT)]
pub struct CliArgs {
    /// Home directory of Wireflow, default is `~/.wireflow`
    #[arg(long)]
    pub home: Option<String>,

    /// Path of the 'flows.json' file.
    #[arg(short, long, default_value_t = default_flows_path())]
    pub flows_path: String,

    /// Path of the log configuration file.
    #[arg(short, long)]
    pub log_path: Option<String>,

    /// Verbose level.
    #[arg(short, long, default_value_t = 2)]
    pub verbose: usize,

    /// Read the workflow JSON from stdin.
    #[arg(short, long, default_value_t = false)]
    pub stdin: bool,

    /// The running environment, 'dev' or 'prod'. Default is `dev`.
    #[arg(long)]
    pub env: Option<String>,
}

fn default_flows_path() -> String {
    dirs_next::home_dir()
        .expect("Cannot find the $HOME dir")
        .join(".wireflow")
        .join("flows.json")
        .to_string_lossy()
        .to_string()
}
