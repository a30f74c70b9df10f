use std::{
    env,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME: &str = "tars-monitor.log";

/// Keeps the log file open for the life of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

struct MultiWriter {
    stderr_enabled: bool,
    file: Option<Arc<Mutex<File>>>,
}

/// Install the global subscriber. Log lines go to the file under `log_dir`
/// and, when `log_stderr` is set, to stderr; stdout stays with the operator
/// printout.
pub fn init_logging(log_dir: &str, log_stderr: bool) -> Option<LogGuard> {
    let level = env::var("TARS_LOG_LEVEL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), log_stderr));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<File>>>, stderr_enabled: bool) -> Self {
        Self {
            stderr_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
