//! Consumer sinks for device output
//!
//! The reader loop owns its sink. Failures are reported back to the reader,
//! which logs them and carries on; a failed write is never retried.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

/// Line-oriented text display fed by the reader loop
pub trait ConsoleSink: Send {
    /// Bring the display to the foreground; called each time the console is
    /// enabled because a device arrived
    fn activate(&mut self) {}

    fn write(&mut self, text: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Called after every drain cycle while the console is enabled
    fn content_changed(&mut self) {}

    /// Release the display; called once on shutdown
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Sink writing to any [`Write`] implementation
pub struct WriterSink<W: Write + Send> {
    writer: Option<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    fn writer(&mut self) -> io::Result<&mut W> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }
}

impl WriterSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl WriterSink<std::fs::File> {
    /// Sink writing to a file, created if missing
    pub fn file(path: &Path, append: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> ConsoleSink for WriterSink<W> {
    fn write(&mut self, text: &str) -> io::Result<()> {
        self.writer()?.write_all(text.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_sink_writes_and_flushes() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write("hello ").unwrap();
        sink.write("world").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.writer.as_deref(), Some(&b"hello world"[..]));
    }

    #[test]
    fn test_writer_sink_rejects_writes_after_close() {
        let mut sink = WriterSink::new(Vec::new());
        sink.close().unwrap();
        assert_eq!(
            sink.write("late").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        // Closing twice is harmless
        sink.close().unwrap();
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("console.log");

        let mut sink = WriterSink::file(&path, true).unwrap();
        sink.write("one\n").unwrap();
        sink.close().unwrap();

        let mut sink = WriterSink::file(&path, true).unwrap();
        sink.write("two\n").unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_file_sink_truncates_without_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, "stale").unwrap();

        let mut sink = WriterSink::file(&path, false).unwrap();
        sink.write("fresh").unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh");
    }
}
