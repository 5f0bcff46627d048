// Logging bootstrap for Airlink
// Installs the tracing subscriber; --debug sends DEBUG output to a file

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PATH: &str = "/tmp/airlink-debug.log";

/// Initialize logging
///
/// # Behavior
/// - If enabled=false: log to stderr, filtered by `RUST_LOG` (default `info`)
/// - If enabled=true: create/truncate the log file, write a header and log
///   everything at DEBUG and above to it
/// - A second call leaves the first subscriber in place
pub fn init(enabled: bool) -> io::Result<()> {
    if !enabled {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(LOG_FILE_PATH)?;

    writeln!(file, "=== Airlink Debug Log ===")?;
    writeln!(file, "Session started: {:?}", SystemTime::now())?;
    writeln!(file, "To monitor: tail -f {}", LOG_FILE_PATH)?;
    writeln!(file, "========================================\n")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();

    Ok(())
}
