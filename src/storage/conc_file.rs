use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use crc32fast::Hasher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::engine::ConcLine;

/// Upper bound for a single framed line
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Append-only writer of concordance lines.
/// Frame layout: [u32 len LE][u32 crc32 LE][bincode ConcLine]
pub struct ConcFileWriter {
    pub path: PathBuf,
    pub writer: BufWriter<File>,
    pub lines_written: u64,
}

impl ConcFileWriter {
    /// Start a fresh file, discarding anything already there
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(ConcFileWriter::from_file(path, file))
    }

    /// Wrap a file the caller already opened and truncated
    pub fn from_file(path: &Path, file: File) -> Self {
        ConcFileWriter {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            lines_written: 0,
        }
    }

    pub fn write_line(&mut self, line: &ConcLine) -> Result<()> {
        let data = bincode::serialize(line)?;
        let mut hasher = Hasher::new();
        hasher.update(&data);

        self.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        self.writer.write_all(&hasher.finalize().to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.lines_written += 1;
        Ok(())
    }

    pub fn write_all(&mut self, lines: &[ConcLine]) -> Result<()> {
        for line in lines {
            self.write_line(line)?;
        }
        Ok(())
    }

    /// Make everything written so far visible to readers in other processes
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(self.lines_written)
    }
}

/// Reader bounded by the published size. The on-disk length is never trusted:
/// a producer may still be appending past `bound`.
pub struct ConcFileReader {
    pub reader: BufReader<File>,
    pub bound: u64,
    pub position: u64,
}

impl ConcFileReader {
    pub fn open(path: &Path, bound: u64) -> Result<Self> {
        let file = File::open(path)?;
        Ok(ConcFileReader {
            reader: BufReader::new(file),
            bound,
            position: 0,
        })
    }

    pub fn next_line(&mut self) -> Result<Option<ConcLine>> {
        if self.position >= self.bound {
            return Ok(None);
        }
        let data = self.next_frame()?;
        self.position += 1;
        Ok(Some(bincode::deserialize(&data)?))
    }

    /// Skip `count` lines without decoding them
    pub fn skip(&mut self, count: u64) -> Result<()> {
        let target = (self.position + count).min(self.bound);
        while self.position < target {
            self.next_frame()?;
            self.position += 1;
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 8];
        self.reader.read_exact(&mut header).map_err(|e| truncated(self.position, e))?;

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_FRAME_LEN {
            return Err(Error::new(
                ErrorKind::StorageUnavailable,
                format!("concordance frame {} too large ({} bytes)", self.position, len),
            ));
        }

        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data).map_err(|e| truncated(self.position, e))?;

        let mut hasher = Hasher::new();
        hasher.update(&data);
        if hasher.finalize() != crc {
            return Err(Error::new(
                ErrorKind::StorageUnavailable,
                format!("checksum mismatch in concordance line {}", self.position),
            ));
        }
        Ok(data)
    }
}

fn truncated(position: u64, err: std::io::Error) -> Error {
    Error::new(
        ErrorKind::StorageUnavailable,
        format!("concordance file shorter than published size at line {}: {}", position, err),
    )
}

/// Lines `[offset, offset + limit)` clipped to `bound`
pub fn read_range(path: &Path, offset: u64, limit: u64, bound: u64) -> Result<Vec<ConcLine>> {
    let mut reader = ConcFileReader::open(path, bound)?;
    reader.skip(offset)?;

    let mut lines = Vec::new();
    while (lines.len() as u64) < limit {
        match reader.next_line()? {
            Some(line) => lines.push(line),
            None => break,
        }
    }
    Ok(lines)
}

pub fn read_all(path: &Path, bound: u64) -> Result<Vec<ConcLine>> {
    read_range(path, 0, bound, bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line(pos: u64) -> ConcLine {
        ConcLine {
            position: pos,
            kwic_len: 1,
            left: vec!["the".to_string()],
            kwic: vec![format!("w{}", pos)],
            right: vec![],
            aligned: vec![],
            group: None,
        }
    }

    #[test]
    fn test_reader_respects_bound_not_file_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.conc");

        let mut writer = ConcFileWriter::create(&path).unwrap();
        for pos in 0..10 {
            writer.write_line(&line(pos)).unwrap();
        }
        writer.flush().unwrap();

        let lines = read_all(&path, 4).unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3].position, 3);

        let page = read_range(&path, 8, 5, 10).unwrap();
        assert_eq!(page.iter().map(|l| l.position).collect::<Vec<_>>(), vec![8, 9]);
    }

    #[test]
    fn test_bound_beyond_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.conc");

        let mut writer = ConcFileWriter::create(&path).unwrap();
        writer.write_line(&line(0)).unwrap();
        writer.finish().unwrap();

        let err = read_all(&path, 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StorageUnavailable);
    }

    #[test]
    fn test_empty_concordance_reads_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.conc");
        assert_eq!(ConcFileWriter::create(&path).unwrap().finish().unwrap(), 0);
        assert!(read_range(&path, 0, 10, 0).unwrap().is_empty());
    }
}
