use crate::settings::env_true;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub component: String,
    pub debug: bool,
    /// Empty disables the log file.
    pub log_dir: String,
    /// Console output goes to stderr instead of stdout.
    pub stderr: bool,
}

pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

pub fn resolve_level(debug: bool) -> String {
    if debug || env_true("NBFLOW_DEBUG") {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("NBFLOW_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the computed level.
pub fn init_logging(config: &LogConfig) -> Option<LogGuard> {
    let level = resolve_level(config.debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir, &config.component) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stderr = config.stderr;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(stderr, file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct MultiWriter {
    console: Box<dyn Write + Send>,
    file: Option<Arc<Mutex<File>>>,
}

impl MultiWriter {
    fn new(stderr: bool, file: Option<Arc<Mutex<File>>>) -> Self {
        let console: Box<dyn Write + Send> = if stderr {
            Box::new(io::stderr())
        } else {
            Box::new(io::stdout())
        };
        Self { console, file }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.console.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.console.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, component: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{component}-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
