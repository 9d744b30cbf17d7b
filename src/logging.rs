use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::CliArgs;

fn verbosity_to_level(verbose: usize) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Process logging: a log4rs config file when given, otherwise a console
/// appender at the CLI verbosity.
pub fn init(cli_args: &CliArgs, app_config: Option<&config::Config>) -> anyhow::Result<()> {
    let log_config_path = cli_args
        .log_path
        .clone()
        .or_else(|| app_config.and_then(|cfg| cfg.get::<String>("logging.config_path").ok()));

    if let Some(path) = log_config_path {
        log4rs::init_file(&path, Default::default())?;
        return Ok(());
    }

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("{d(%e %b %H:%M:%S)} - [{h({l})}] {m}{n}")))
        .build();

    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(verbosity_to_level(cli_args.verbose)))?;

    log4rs::init_config(config)?;
    Ok(())
}
