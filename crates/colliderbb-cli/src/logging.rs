use crate::error::{CliError, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing_subscriber::{Layer, filter::LevelFilter, fmt, prelude::*};

/// Maps `-q` and the number of `-v` flags onto a level. Warnings are shown by default.
fn level_filter(verbosity: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbosity) {
        (true, _) => LevelFilter::ERROR,
        (false, 0) => LevelFilter::WARN,
        (false, 1) => LevelFilter::INFO,
        (false, 2) => LevelFilter::DEBUG,
        (false, _) => LevelFilter::TRACE,
    }
}

/// The log file records everything at DEBUG or above whatever the terminal shows,
/// so per-lens details of a failed verification can be read back afterwards.
fn file_filter(terminal: LevelFilter) -> LevelFilter {
    terminal.max(LevelFilter::DEBUG)
}

pub fn setup_logging(verbosity: u8, quiet: bool, log_file: Option<PathBuf>) -> Result<()> {
    let terminal = level_filter(verbosity, quiet);
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(terminal);

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(&path)?;
            Some(
                fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_filter(file_filter(terminal)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| CliError::Other(anyhow::anyhow!("Could not install the logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Once;
    use tracing::{debug, info, warn};

    static INIT: Once = Once::new();

    fn install_once() {
        INIT.call_once(|| {
            setup_logging(2, false, None).unwrap();
        });
    }

    #[test]
    fn flags_map_to_levels() {
        assert_eq!(level_filter(0, false), LevelFilter::WARN);
        assert_eq!(level_filter(1, false), LevelFilter::INFO);
        assert_eq!(level_filter(2, false), LevelFilter::DEBUG);
        assert_eq!(level_filter(9, false), LevelFilter::TRACE);
        assert_eq!(level_filter(3, true), LevelFilter::ERROR);
    }

    #[test]
    fn file_keeps_debug_detail() {
        assert_eq!(file_filter(LevelFilter::WARN), LevelFilter::DEBUG);
        assert_eq!(file_filter(LevelFilter::ERROR), LevelFilter::DEBUG);
        assert_eq!(file_filter(LevelFilter::TRACE), LevelFilter::TRACE);
    }

    #[test]
    #[serial]
    fn global_logger_accepts_engine_events() {
        install_once();
        info!(stage = 2, "Tuning started.");
        debug!(lens = "bb_lr.l1b1_01", "Configured lens.");
        warn!(ip = "ip8", "Leveling reached the iteration limit.");
    }

    #[test]
    #[serial]
    fn second_install_is_reported() {
        install_once();
        assert!(matches!(setup_logging(0, false, None), Err(CliError::Other(_))));
    }

    #[test]
    #[serial]
    fn file_layer_writes_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colliderbb.log");
        let layer = fmt::layer()
            .with_writer(File::create(&path).unwrap())
            .with_ansi(false)
            .with_thread_ids(true)
            .with_filter(file_filter(LevelFilter::WARN));

        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
            debug!(knob = "on_sep8", "Leveling step.");
            tracing::trace!("Not recorded.");
        });

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("Leveling step."));
        assert!(content.contains("ThreadId"));
        assert!(!content.contains("Not recorded."));
        assert!(!content.contains('\u{1b}'));
    }

    #[test]
    #[serial]
    #[cfg(unix)]
    fn directory_as_log_file_is_an_io_error() {
        assert!(matches!(
            setup_logging(0, false, Some(PathBuf::from("/"))),
            Err(CliError::Io(_))
        ));
    }
}
