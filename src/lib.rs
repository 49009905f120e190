pub mod mcp_client;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Return the platform-standard data directory for briefbot.
///
/// - macOS: `~/Library/Application Support/briefbot/`
/// - Windows: `{FOLDERID_RoamingAppData}\briefbot\`
/// - Linux: `$XDG_DATA_HOME/briefbot/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.briefbot/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("briefbot");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".briefbot")
}

/// Route `tracing` output to `<data_dir>/briefbot.log`.
///
/// The previous three runs are kept as `briefbot.log.1` to `.3`. The filter
/// comes from `RUST_LOG`, defaulting to `briefbot=info,warn`. Every line is
/// flushed as written, so the log is complete even if a tool server takes the
/// orchestrator down with it.
///
/// Falls back to stderr when the file cannot be opened; the returned path is
/// `None` in that case.
pub fn init_tracing() -> Option<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("briefbot.log");
    rotate_log_file(&log_path, 3);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("briefbot=info,warn"));

    let opened = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    let active_path = match opened {
        Ok(file) => {
            fmt::fmt()
                .with_env_filter(filter)
                .with_writer(LineFlushedFile::new(file))
                .with_ansi(false)
                .with_target(true)
                .init();
            Some(log_path)
        }
        Err(e) => {
            fmt::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .with_target(true)
                .init();
            tracing::warn!(
                path = %log_path.display(),
                error = %e,
                "cannot open log file, logging to stderr"
            );
            None
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        pid = std::process::id(),
        "briefbot starting"
    );

    active_path
}

/// Shift `briefbot.log` to `.1`, `.1` to `.2` and so on, dropping whatever
/// sat at `.{keep}`. Gaps in the chain are fine.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |n: u32| {
        let mut name = base_path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// Log sink that flushes the file after every write.
#[derive(Clone)]
struct LineFlushedFile(Arc<Mutex<File>>);

impl LineFlushedFile {
    fn new(file: File) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .0
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        f(&mut file)
    }
}

impl Write for LineFlushedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| {
            let written = file.write(buf)?;
            file.flush()?;
            Ok(written)
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LineFlushedFile {
    type Writer = LineFlushedFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
