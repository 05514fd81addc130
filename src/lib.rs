pub mod agent_core;
pub mod config;
pub mod events;
pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for deskpilot.
///
/// - macOS: `~/Library/Application Support/deskpilot/`
/// - Linux: `$XDG_DATA_HOME/deskpilot/` (fallback `~/.local/share/deskpilot/`)
///
/// Falls back to `~/.deskpilot/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_local_dir() {
        return dir.join("deskpilot");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".deskpilot")
}

/// Initialize the tracing subscriber.
///
/// With a `log_dir`, logs go to `<log_dir>/deskpilot.log`:
/// 1. Existing logs are rotated (deskpilot.log → .1 → .2 → .3, keeps last 3).
/// 2. A fresh file is opened behind a line-flushing writer.
/// 3. A startup banner records the log path.
///
/// Without one, logs go to stderr. Falls back to stderr if the log file
/// cannot be opened.
pub fn init_tracing(log_dir: Option<&Path>) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("deskpilot=info,warn"));

    let Some(log_dir) = log_dir else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
        return;
    };

    let _ = std::fs::create_dir_all(log_dir);
    let log_path = log_dir.join("deskpilot.log");

    // Rotate: deskpilot.log.2 → .3, .1 → .2, deskpilot.log → .1
    rotate_log_file(&log_path, 3);

    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("deskpilot: cannot open {}: {e}; logging to stderr", log_path.display());
            return init_tracing(None);
        }
    };

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== deskpilot starting ==="
    );
}

/// Rotate log files: `deskpilot.log` → `deskpilot.log.1` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write,
/// so each log line survives a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
