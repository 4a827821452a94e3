//! Byte-range reads and overflow-aware tailing of log files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogReadError {
    #[error("no such file")]
    NoFile,
    #[error("bad arguments")]
    BadArguments,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Read `length` bytes from `path` starting at `offset`. A negative offset
/// reads the last `|offset|` bytes and requires `length == 0`.
pub fn read_file(path: &Path, offset: i64, length: i64) -> Result<Vec<u8>, LogReadError> {
    let mut f = File::open(path).map_err(|_| LogReadError::NoFile)?;

    if offset < 0 {
        if length != 0 {
            return Err(LogReadError::BadArguments);
        }
        let size = f.seek(SeekFrom::End(0))? as i64;
        let start = size.saturating_sub(offset.abs());
        f.seek(SeekFrom::Start(start as u64))?;
        let mut data = Vec::new();
        f.read_to_end(&mut data)?;
        Ok(data)
    } else {
        if length < 0 {
            return Err(LogReadError::BadArguments);
        }
        f.seek(SeekFrom::Start(offset as u64))?;
        if length == 0 {
            let mut data = Vec::new();
            f.read_to_end(&mut data)?;
            Ok(data)
        } else {
            let mut data = vec![0u8; length as usize];
            let n = read_up_to(&mut f, &mut data)?;
            data.truncate(n);
            Ok(data)
        }
    }
}

/// Tail `length` bytes from `path` starting at `offset`. When the file has
/// grown past `offset + length`, the window is snapped to the end of the file
/// and `overflow` is reported. Returns (bytes, next offset, overflow); errors
/// degrade to an empty read so callers can poll.
pub fn tail_file(path: &Path, offset: i64, length: i64) -> (Vec<u8>, i64, bool) {
    let mut overflow = false;
    let mut offset = offset.max(0);
    let length = length.max(1);

    let Ok(mut f) = File::open(path) else {
        return (vec![], offset, false);
    };
    let Ok(size) = f.seek(SeekFrom::End(0)) else {
        return (vec![], offset, false);
    };
    let size = size as i64;

    if size > offset + length {
        overflow = true;
        offset = size - length;
    }

    if f.seek(SeekFrom::Start(offset as u64)).is_err() {
        return (vec![], offset, false);
    }
    let mut data = vec![0u8; length as usize];
    match read_up_to(&mut f, &mut data) {
        Ok(n) => {
            data.truncate(n);
            let next = offset + data.len() as i64;
            (data, next, overflow)
        }
        Err(_) => (vec![], offset, false),
    }
}

fn read_up_to(f: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match f.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn read_forward_range() {
        let f = fixture(b"0123456789");
        assert_eq!(read_file(f.path(), 2, 4).unwrap(), b"2345");
        assert_eq!(read_file(f.path(), 0, 0).unwrap(), b"0123456789");
        assert_eq!(read_file(f.path(), 8, 100).unwrap(), b"89");
    }

    #[test]
    fn read_from_end() {
        let f = fixture(b"0123456789");
        assert_eq!(read_file(f.path(), -3, 0).unwrap(), b"789");
        assert_eq!(read_file(f.path(), -100, 0).unwrap(), b"0123456789");
        assert!(matches!(
            read_file(f.path(), -3, 5),
            Err(LogReadError::BadArguments)
        ));
    }

    #[test]
    fn missing_file_is_no_file() {
        assert!(matches!(
            read_file(Path::new("/nonexistent/x.log"), 0, 0),
            Err(LogReadError::NoFile)
        ));
    }

    #[test]
    fn tail_without_overflow() {
        let f = fixture(b"abcdef");
        let (bytes, offset, overflow) = tail_file(f.path(), 0, 100);
        assert_eq!(bytes, b"abcdef");
        assert_eq!(offset, 6);
        assert!(!overflow);
    }

    #[test]
    fn tail_overflow_snaps_to_end() {
        let f = fixture(b"abcdefghij");
        let (bytes, offset, overflow) = tail_file(f.path(), 0, 4);
        assert_eq!(bytes, b"ghij");
        assert_eq!(offset, 10);
        assert!(overflow);
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let (bytes, offset, overflow) = tail_file(Path::new("/nonexistent/x.log"), 5, 10);
        assert_eq!(bytes, b"");
        assert_eq!(offset, 5);
        assert!(!overflow);
    }
}
