pub mod runtime;
pub mod text;
pub mod utils;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum WireflowError {
    #[error("Permission Denied")]
    PermissionDenied,

    #[error("Invalid 'flows.json': {0}")]
    BadFlowsJson(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid arguments: {0}")]
    BadArgument(&'static str),

    #[error("Invalid property expression: {0}")]
    InvalidExpr(String),

    #[error("Task cancelled")]
    TaskCancelled,

    #[error("{0}")]
    InvalidOperation(String),

    #[error("Out of range")]
    OutOfRange,

    #[error("Invalid configuration")]
    Configuration,

    #[error("Timed out")]
    Timeout,

    #[error("The type '{type_}' is already registered by module '{module}'")]
    TypeAlreadyRegistered { type_: String, module: String },

    #[error("The node set '{0}' provides no types")]
    SetHasNoTypes(String),

    #[error("The property '{0}' is read-only")]
    PropertyReadOnly(String),

    #[error("Not available: {0}")]
    NotAvailable(String),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] crate::Error), // source and Display delegate to anyhow::Error
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = anyhow::Error> = anyhow::Result<T, E>;

pub use anyhow::Context as ErrorContext;

impl WireflowError {
    pub fn invalid_operation(msg: &str) -> anyhow::Error {
        WireflowError::InvalidOperation(msg.into()).into()
    }

    pub fn invalid_expr(expr: &str) -> anyhow::Error {
        WireflowError::InvalidExpr(expr.into()).into()
    }
}

#[cfg(test)]
mod tests {

    #[ctor::ctor]
    fn initialize_test_logger() {
        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stdout)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new("[{h({l})}]\t{m}{n}")))
            .build();

        let config = log4rs::Config::builder()
            .appender(log4rs::config::Appender::builder().build("stderr", Box::new(stderr)))
            .build(log4rs::config::Root::builder().appender("stderr").build(log::LevelFilter::Warn))
            .unwrap();

        let _ = log4rs::init_config(config).unwrap();
    }
}
