use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use bytes::BytesMut;

use super::{spare, Body, BodyGenerator, BodyState, RandomAccessBody};

const REGION_CHUNK: u64 = 64 * 1024;

/// A body reading a region of a file.
///
/// The body is random access, so connections without a TLS layer can send it
/// with [`Connection::send_file_region`][crate::Connection::send_file_region].
#[derive(Debug, Clone)]
pub struct FileBodyGenerator {
    path: PathBuf,
    offset: u64,
    length: Option<u64>,
}

impl FileBodyGenerator {
    /// The whole file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBodyGenerator {
            path: path.into(),
            offset: 0,
            length: None,
        }
    }

    /// `length` bytes starting at `offset`.
    pub fn region(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        FileBodyGenerator {
            path: path.into(),
            offset,
            length: Some(length),
        }
    }
}

impl BodyGenerator for FileBodyGenerator {
    fn create_body(&self) -> io::Result<Box<dyn Body>> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();

        let available = file_len.saturating_sub(self.offset);
        let length = self.length.map(|l| l.min(available)).unwrap_or(available);

        file.seek(SeekFrom::Start(self.offset))?;

        trace!("File body {:?} offset {} length {}", self.path, self.offset, length);

        Ok(Box::new(FileBody {
            file: Some(file),
            offset: self.offset,
            length,
            position: 0,
        }))
    }
}

struct FileBody {
    file: Option<File>,
    offset: u64,
    length: u64,
    position: u64,
}

impl FileBody {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file body is closed"))
    }
}

impl Body for FileBody {
    fn content_length(&self) -> i64 {
        self.length as i64
    }

    fn transfer_to(&mut self, target: &mut BytesMut) -> io::Result<BodyState> {
        let remaining = self.length - self.position;
        if remaining == 0 {
            return Ok(BodyState::Stop);
        }

        let n = (spare(target) as u64).min(remaining) as usize;
        let start = target.len();
        target.resize(start + n, 0);

        let read = match self.file()?.read(&mut target[start..]) {
            Ok(read) => read,
            Err(e) => {
                target.truncate(start);
                return Err(e);
            }
        };
        target.truncate(start + read);

        if read == 0 && n > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than body length",
            ));
        }

        self.position += read as u64;

        if self.position == self.length {
            Ok(BodyState::Stop)
        } else {
            Ok(BodyState::Continue)
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.take();
        Ok(())
    }

    fn as_random_access(&mut self) -> Option<&mut dyn RandomAccessBody> {
        Some(self)
    }
}

impl RandomAccessBody for FileBody {
    fn region_length(&self) -> u64 {
        self.length
    }

    fn transfer_region(&mut self, position: u64, target: &mut dyn io::Write) -> io::Result<u64> {
        if position >= self.length {
            return Ok(0);
        }

        let amount = (self.length - position).min(REGION_CHUNK);
        let offset = self.offset;

        let file = self.file()?;
        file.seek(SeekFrom::Start(offset + position))?;

        let copied = io::copy(&mut file.take(amount), target)?;

        if copied == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shorter than body length",
            ));
        }

        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn temp_file(name: &str, content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ureq-engine-{}-{}",
            std::process::id(),
            name
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    fn read_all(body: &mut dyn Body) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut buf = BytesMut::with_capacity(4);
            let state = body.transfer_to(&mut buf).unwrap();
            out.extend_from_slice(&buf);
            if state == BodyState::Stop {
                return out;
            }
        }
    }

    #[test]
    fn whole_file() {
        let path = temp_file("whole", b"0123456789");
        let gen = FileBodyGenerator::new(&path);
        let mut body = gen.create_body().unwrap();
        assert_eq!(body.content_length(), 10);
        assert_eq!(read_all(&mut *body), b"0123456789");
        body.close().unwrap();
        body.close().unwrap();
    }

    #[test]
    fn file_region() {
        let path = temp_file("region", b"0123456789");
        let gen = FileBodyGenerator::region(&path, 2, 5);
        let mut body = gen.create_body().unwrap();
        assert_eq!(body.content_length(), 5);
        assert_eq!(read_all(&mut *body), b"23456");
    }

    #[test]
    fn region_clamped_to_file() {
        let path = temp_file("clamped", b"0123456789");
        let gen = FileBodyGenerator::region(&path, 8, 100);
        let body = gen.create_body().unwrap();
        assert_eq!(body.content_length(), 2);
    }

    #[test]
    fn random_access() {
        let path = temp_file("random", b"0123456789");
        let gen = FileBodyGenerator::region(&path, 1, 8);
        let mut body = gen.create_body().unwrap();
        let ra = body.as_random_access().unwrap();
        assert_eq!(ra.region_length(), 8);

        let mut out = Vec::new();
        let n = ra.transfer_region(3, &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"45678");

        assert_eq!(ra.transfer_region(8, &mut out).unwrap(), 0);
    }

    #[test]
    fn missing_file() {
        let gen = FileBodyGenerator::new("/definitely/not/here");
        assert!(gen.create_body().is_err());
    }
}
