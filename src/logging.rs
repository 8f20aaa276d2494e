use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Stdout plus the daemon log file.
fn tee_writer(file: File) -> impl for<'a> MakeWriter<'a> + Send + Sync + 'static {
    std::io::stdout.and(Arc::new(file))
}

/// Installs the global subscriber. `log_file` is appended to; if it cannot
/// be opened, logging continues on stdout only.
pub(crate) fn init(level: Level, log_file: Option<&Path>) {
    let file = log_file.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false);
    let _ = match file {
        Some(file) => {
            tracing::subscriber::set_global_default(builder.with_writer(tee_writer(file)).finish())
        }
        None => tracing::subscriber::set_global_default(
            builder.with_writer(std::io::stdout).finish(),
        ),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn writer_copies_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signdeck.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let make = tee_writer(file);
        let mut writer = make.make_writer();
        writer.write_all(b"hello log\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello log\n");
    }
}
