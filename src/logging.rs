use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

/// `log` backend writing to the targets of a [`LoggingConfig`].
pub struct CustomLogger {
    format: LogFormat,
    outputs: Vec<(LevelFilter, Mutex<BufWriter<Box<dyn Write + Send>>>)>,
    max_level: LevelFilter,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let format = config.format.unwrap_or_default();
        let default_level = config.level.unwrap_or_default();
        let targets = config.targets.unwrap_or_else(|| {
            vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]
        });

        let mut outputs = Vec::with_capacity(targets.len());
        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::Stderr => Box::new(std::io::stderr()),
                LogOutputType::File => {
                    let path = target.path.as_ref()
                        .ok_or("File output type requires path")?;
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?;
                    Box::new(file)
                }
            };
            let level = target.level.unwrap_or(default_level).to_level_filter();
            outputs.push((level, Mutex::new(BufWriter::new(writer))));
        }

        let max_level = outputs
            .iter()
            .map(|(level, _)| *level)
            .max()
            .unwrap_or(LevelFilter::Off);

        Ok(Self {
            format,
            outputs,
            max_level,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        log::set_max_level(logger.max_level);
        log::set_boxed_logger(Box::new(logger))?;
        Ok(())
    }

    fn format_record(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => format_text(record),
            LogFormat::Json => format_json(record),
        }
    }
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = self.format_record(record);
        for (level, writer) in &self.outputs {
            if record.level() <= *level {
                if let Ok(mut writer) = writer.lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for (_, writer) in &self.outputs {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

fn format_text(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    format!(
        "{} [{}] [{}] {}",
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level().to_string().to_uppercase(),
        record.target(),
        record.args()
    )
}

fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let log_entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "message": record.args().to_string(),
    });
    log_entry.to_string()
}

/// `env_logger` setup used when no `logging` block is configured.
/// `RUST_LOG` still overrides `log_level`.
pub fn init_fallback(log_level: Option<&str>, log_format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let level = log_level.unwrap_or("info");
    let format = parse_log_format(log_format.unwrap_or("text"))?;

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }
    builder.try_init()?;

    Ok(())
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}
