use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use crate::runtime::model::Variant;

/// Numeric log levels. `Audit` and `Metric` sit outside the severity order
/// and pass only when a sink opts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off = 1,
    Fatal = 10,
    Error = 20,
    Warn = 30,
    Info = 40,
    Debug = 50,
    Trace = 60,
    Audit = 98,
    Metric = 99,
}

impl LogLevel {
    pub fn as_tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
            LogLevel::Audit => "audit",
            LogLevel::Metric => "metric",
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub msg: Variant,
    pub ts: SystemTime,
    pub type_: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub user: Option<String>,
    pub path: Option<String>,
    pub ip: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, msg: impl Into<Variant>) -> Self {
        LogRecord {
            level,
            msg: msg.into(),
            ts: SystemTime::now(),
            type_: None,
            name: None,
            id: None,
            user: None,
            path: None,
            ip: None,
        }
    }
}

/// Request information used to enrich audit records.
#[derive(Debug, Clone, Default)]
pub struct AuditRequestInfo {
    pub user: Option<String>,
    pub path: Option<String>,
    pub ip: Option<String>,
}

pub trait LogSink: Send + Sync {
    fn level(&self) -> LogLevel;
    fn metrics_on(&self) -> bool {
        false
    }
    fn audit_on(&self) -> bool {
        false
    }
    fn write(&self, record: &LogRecord);

    fn should_report(&self, level: LogLevel) -> bool {
        (level == LogLevel::Metric && self.metrics_on())
            || (level == LogLevel::Audit && self.audit_on())
            || (level as i32) <= (self.level() as i32)
    }
}

/// The runtime logger: fans records out to every sink whose gate passes.
/// Sink writes are serialised per sink by the sink itself; this struct
/// only guards its sink list.
#[derive(Default)]
pub struct Logger {
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish()
    }
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_console(level: LogLevel) -> Self {
        let logger = Self::new();
        logger.add_sink(Arc::new(ConsoleSink::new(level, false, false)));
        logger
    }

    pub fn add_sink(&self, sink: Arc<dyn LogSink>) {
        self.sinks.write().expect("logger lock").push(sink);
    }

    pub fn log(&self, record: LogRecord) {
        let sinks = self.sinks.read().expect("logger lock");
        for sink in sinks.iter() {
            if sink.should_report(record.level) {
                sink.write(&record);
            }
        }
    }

    pub fn fatal(&self, msg: impl Into<Variant>) {
        self.log(LogRecord::new(LogLevel::Fatal, msg));
    }

    pub fn error(&self, msg: impl Into<Variant>) {
        self.log(LogRecord::new(LogLevel::Error, msg));
    }

    pub fn warn(&self, msg: impl Into<Variant>) {
        self.log(LogRecord::new(LogLevel::Warn, msg));
    }

    pub fn info(&self, msg: impl Into<Variant>) {
        self.log(LogRecord::new(LogLevel::Info, msg));
    }

    pub fn debug(&self, msg: impl Into<Variant>) {
        self.log(LogRecord::new(LogLevel::Debug, msg));
    }

    pub fn trace(&self, msg: impl Into<Variant>) {
        self.log(LogRecord::new(LogLevel::Trace, msg));
    }

    pub fn metric(&self, msg: impl Into<Variant>) {
        self.log(LogRecord::new(LogLevel::Metric, msg));
    }

    /// Writes an audit record, enriched from the request when present.
    pub fn audit(&self, msg: impl Into<Variant>, req: Option<&AuditRequestInfo>) {
        let mut record = LogRecord::new(LogLevel::Audit, msg);
        if let Some(req) = req {
            record.user = req.user.clone();
            record.path = req.path.clone();
            record.ip = req.ip.clone();
        }
        self.log(record);
    }
}

/// Formats `D Mmm HH:MM:SS - [level] [type:name] message`, colorised per
/// level, and forwards to the process logger.
pub struct ConsoleSink {
    level: LogLevel,
    metrics_on: bool,
    audit_on: bool,
    write_lock: Mutex<()>,
}

impl ConsoleSink {
    pub fn new(level: LogLevel, metrics_on: bool, audit_on: bool) -> Self {
        ConsoleSink { level, metrics_on, audit_on, write_lock: Mutex::new(()) }
    }

    fn color_code(level: LogLevel) -> &'static str {
        match level {
            LogLevel::Fatal | LogLevel::Error => "\x1b[31m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Debug | LogLevel::Trace => "\x1b[36m",
            _ => "\x1b[37m",
        }
    }

    pub fn format(record: &LogRecord) -> String {
        let dt: chrono::DateTime<chrono::Local> = record.ts.into();
        let stamp = dt.format("%e %b %H:%M:%S");
        let msg_text = match &record.msg {
            Variant::String(s) => s.clone(),
            other => format!("{:?}", other),
        };
        let scope = match (&record.type_, &record.name) {
            (Some(t), Some(n)) => format!("[{}:{}] ", t, n),
            (Some(t), None) => format!("[{}] ", t),
            _ => String::new(),
        };
        format!("{} - [{}] {}{}", stamp, record.level.as_tag(), scope, msg_text)
    }
}

impl LogSink for ConsoleSink {
    fn level(&self) -> LogLevel {
        self.level
    }

    fn metrics_on(&self) -> bool {
        self.metrics_on
    }

    fn audit_on(&self) -> bool {
        self.audit_on
    }

    fn write(&self, record: &LogRecord) {
        let _guard = self.write_lock.lock().expect("console sink lock");
        let color = Self::color_code(record.level);
        eprintln!("{}{}\x1b[0m", color, Self::format(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        level: LogLevel,
        metrics_on: bool,
        audit_on: bool,
        count: AtomicUsize,
    }

    impl LogSink for CountingSink {
        fn level(&self) -> LogLevel {
            self.level
        }
        fn metrics_on(&self) -> bool {
            self.metrics_on
        }
        fn audit_on(&self) -> bool {
            self.audit_on
        }
        fn write(&self, _record: &LogRecord) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_should_report_gates() {
        let sink = CountingSink { level: LogLevel::Info, metrics_on: false, audit_on: false, count: AtomicUsize::new(0) };
        assert!(sink.should_report(LogLevel::Error));
        assert!(sink.should_report(LogLevel::Info));
        assert!(!sink.should_report(LogLevel::Debug));
        assert!(!sink.should_report(LogLevel::Metric));
        assert!(!sink.should_report(LogLevel::Audit));

        let metrics_sink =
            CountingSink { level: LogLevel::Off, metrics_on: true, audit_on: false, count: AtomicUsize::new(0) };
        assert!(metrics_sink.should_report(LogLevel::Metric));
        assert!(!metrics_sink.should_report(LogLevel::Audit));
        assert!(!metrics_sink.should_report(LogLevel::Error));
    }

    #[test]
    fn test_logger_dispatch_respects_levels() {
        let logger = Logger::new();
        let sink = Arc::new(CountingSink {
            level: LogLevel::Warn,
            metrics_on: false,
            audit_on: true,
            count: AtomicUsize::new(0),
        });
        logger.add_sink(sink.clone());

        logger.error("e");
        logger.warn("w");
        logger.info("suppressed");
        logger.metric("suppressed");
        logger.audit("a", None);

        assert_eq!(sink.count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_audit_enrichment() {
        let req = AuditRequestInfo {
            user: Some("alice".into()),
            path: Some("/flows".into()),
            ip: Some("127.0.0.1".into()),
        };
        let mut seen_user = None;
        {
            struct CaptureSink(std::sync::Mutex<Vec<LogRecord>>);
            impl LogSink for CaptureSink {
                fn level(&self) -> LogLevel {
                    LogLevel::Off
                }
                fn audit_on(&self) -> bool {
                    true
                }
                fn write(&self, record: &LogRecord) {
                    self.0.lock().unwrap().push(record.clone());
                }
            }
            let logger = Logger::new();
            let sink = Arc::new(CaptureSink(std::sync::Mutex::new(Vec::new())));
            logger.add_sink(sink.clone());
            logger.audit("flows.set", Some(&req));
            let records = sink.0.lock().unwrap();
            seen_user = records.first().and_then(|r| r.user.clone());
        }
        assert_eq!(seen_user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_console_format() {
        let mut record = LogRecord::new(LogLevel::Warn, "something happened");
        record.type_ = Some("inject".into());
        record.name = Some("tick".into());
        let line = ConsoleSink::format(&record);
        assert!(line.contains("[warn]"));
        assert!(line.contains("[inject:tick]"));
        assert!(line.ends_with("something happened"));
    }
}
