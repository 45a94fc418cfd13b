//! Packet sink
//!
//! Receives extracted packet payloads in order and forwards them downstream.
//! Writes are synchronous: a slow consumer stalls the event loop, there is no
//! queue in between.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Ordered consumer of packet payloads
pub trait PacketSink {
    /// Write one packet payload
    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Push buffered bytes downstream, called once per returned transfer
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PacketSink for Vec<u8> {
    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        self.extend_from_slice(payload);
        Ok(())
    }
}

impl<S: PacketSink + ?Sized> PacketSink for Box<S> {
    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        (**self).write_payload(payload)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Sink over any byte writer (stdout, a file, a pipe)
pub struct StreamSink<W: Write> {
    writer: W,
    bytes_written: u64,
}

impl<W: Write> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PacketSink for StreamSink<W> {
    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(payload)?;
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Where the PCM stream goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

impl OutputTarget {
    /// Parse an output argument; `-` means stdout and `~` is expanded
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "-" => OutputTarget::Stdout,
            path => OutputTarget::File(PathBuf::from(shellexpand::tilde(path).as_ref())),
        }
    }

    /// Open the target as a boxed writer
    pub fn open(&self) -> common::Result<StreamSink<Box<dyn Write + Send>>> {
        // Flushed once per transfer, never on 0x0A bytes
        let writer: Box<dyn Write + Send> = match self {
            OutputTarget::Stdout => Box::new(BufWriter::new(io::stdout())),
            OutputTarget::File(path) => Box::new(BufWriter::new(create_output_file(path)?)),
        };
        debug!("Opened output {}", self);
        Ok(StreamSink::new(writer))
    }
}

impl std::fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputTarget::Stdout => write!(f, "stdout"),
            OutputTarget::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn create_output_file(path: &Path) -> common::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            common::Error::Output(format!(
                "Failed to create output directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }
    File::create(path).map_err(|e| {
        common::Error::Output(format!("Failed to create {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that fails once the reader side is gone
    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_vec_sink_appends_in_order() {
        let mut sink = Vec::new();
        sink.write_payload(&[1, 2]).unwrap();
        sink.write_payload(&[3]).unwrap();
        assert_eq!(sink, vec![1, 2, 3]);
    }

    #[test]
    fn test_stream_sink_counts_bytes() {
        let mut sink = StreamSink::new(Vec::new());
        sink.write_payload(&[0u8; 180]).unwrap();
        sink.write_payload(&[1u8; 4]).unwrap();
        PacketSink::flush(&mut sink).unwrap();

        assert_eq!(sink.bytes_written(), 184);
        assert_eq!(sink.into_inner().len(), 184);
    }

    #[test]
    fn test_stream_sink_reports_broken_pipe() {
        let mut sink = StreamSink::new(ClosedPipe);
        let err = sink.write_payload(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(sink.bytes_written(), 0);
    }

    #[test]
    fn test_output_target_parse() {
        assert_eq!(OutputTarget::parse("-"), OutputTarget::Stdout);
        assert_eq!(OutputTarget::parse(""), OutputTarget::Stdout);
        assert_eq!(
            OutputTarget::parse("/tmp/m8.pcm"),
            OutputTarget::File(PathBuf::from("/tmp/m8.pcm"))
        );
        assert_eq!(OutputTarget::Stdout.to_string(), "stdout");
    }

    #[test]
    fn test_file_target_holds_bytes_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcm");
        let target = OutputTarget::File(path.clone());

        let mut sink = target.open().unwrap();
        // Newline bytes are ordinary samples and must not force a write
        sink.write_payload(&[0x0A, 0x01, 0x0A, 0x02]).unwrap();
        assert!(std::fs::read(&path).unwrap().is_empty());

        PacketSink::flush(&mut sink).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x0A, 0x01, 0x0A, 0x02]);
    }

    #[test]
    fn test_file_target_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capture.pcm");
        let target = OutputTarget::File(path.clone());

        let mut sink = target.open().unwrap();
        sink.write_payload(&[9u8; 8]).unwrap();
        PacketSink::flush(&mut sink).unwrap();
        drop(sink);

        assert_eq!(std::fs::read(path).unwrap(), vec![9u8; 8]);
    }
}
