//! Streaming pack codec
//!
//! Layout: `"DPCK"`, version (u32 LE), object count (u32 LE), then per
//! object: kind (u8), id (32 bytes), raw size (u32 LE), compressed size
//! (u32 LE) and the zstd-compressed storage encoding. The pack ends with the
//! SHA-256 of everything before it.

use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use zstd::stream::encode_all as zstd_encode;

use crate::object::{Object, ObjectId, ObjectKind};

/// Pack magic
pub const PACK_MAGIC: &[u8; 4] = b"DPCK";

/// Packfile version
pub const PACK_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("pack I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a pack stream")]
    BadMagic,

    #[error("unknown pack version: {0}")]
    UnsupportedVersion(u32),

    #[error("object of {0} bytes does not fit in a pack")]
    ObjectTooLarge(usize),

    #[error("corrupt pack entry: {0}")]
    Corrupt(String),

    #[error("pack entry {expected} decodes to {actual}")]
    IdMismatch { expected: ObjectId, actual: ObjectId },

    #[error("pack announced {expected} objects, got {actual}")]
    CountMismatch { expected: u32, actual: u32 },

    #[error("pack checksum mismatch")]
    ChecksumMismatch,
}

/// Totals of a written pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSummary {
    pub objects: u32,
    pub bytes: u64,
    pub checksum: String,
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn size_u32(len: usize) -> Result<u32, PackError> {
    u32::try_from(len).map_err(|_| PackError::ObjectTooLarge(len))
}

/// Writes objects to a pack stream as they arrive
pub struct PackWriter<W: Write> {
    out: HashingWriter<W>,
    expected: u32,
    written: u32,
    level: i32,
}

impl<W: Write> PackWriter<W> {
    /// Start a pack that will hold exactly `count` objects
    pub fn new(inner: W, count: u32, level: i32) -> Result<Self, PackError> {
        let mut out = HashingWriter {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        };
        out.write_all(PACK_MAGIC)?;
        out.write_all(&PACK_VERSION.to_le_bytes())?;
        out.write_all(&count.to_le_bytes())?;
        Ok(Self {
            out,
            expected: count,
            written: 0,
            level,
        })
    }

    pub fn write_object(&mut self, object: &Object) -> Result<(), PackError> {
        if self.written >= self.expected {
            return Err(PackError::CountMismatch {
                expected: self.expected,
                actual: self.written + 1,
            });
        }
        let raw = object
            .to_bytes()
            .map_err(|e| PackError::Corrupt(format!("cannot encode object: {}", e)))?;
        let compressed = zstd_encode(&raw[..], self.level)?;
        let raw_len = size_u32(raw.len())?;
        let compressed_len = size_u32(compressed.len())?;

        self.out.write_all(&[object.kind().code()])?;
        self.out.write_all(object.id().as_bytes())?;
        self.out.write_all(&raw_len.to_le_bytes())?;
        self.out.write_all(&compressed_len.to_le_bytes())?;
        self.out.write_all(&compressed)?;
        self.written += 1;
        Ok(())
    }

    /// Append the trailer. Fails if fewer objects than announced were written.
    pub fn finish(self) -> Result<(W, PackSummary), PackError> {
        if self.written != self.expected {
            return Err(PackError::CountMismatch {
                expected: self.expected,
                actual: self.written,
            });
        }
        let HashingWriter {
            mut inner,
            hasher,
            bytes,
        } = self.out;
        let digest = hasher.finalize();
        inner.write_all(&digest)?;
        inner.flush()?;
        Ok((
            inner,
            PackSummary {
                objects: self.written,
                bytes: bytes + digest.len() as u64,
                checksum: hex::encode(digest),
            },
        ))
    }
}

/// Reads and verifies objects from a pack stream
pub struct PackReader<R: Read> {
    input: HashingReader<R>,
    count: u32,
    remaining: u32,
    done: bool,
}

impl<R: Read> PackReader<R> {
    pub fn new(inner: R) -> Result<Self, PackError> {
        let mut input = HashingReader {
            inner,
            hasher: Sha256::new(),
        };
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != PACK_MAGIC {
            return Err(PackError::BadMagic);
        }
        let version = read_u32(&mut input)?;
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let count = read_u32(&mut input)?;
        Ok(Self {
            input,
            count,
            remaining: count,
            done: false,
        })
    }

    /// Object count announced in the header
    pub fn count(&self) -> u32 {
        self.count
    }

    fn read_entry(&mut self) -> Result<Object, PackError> {
        let mut kind = [0u8; 1];
        self.input.read_exact(&mut kind)?;
        let kind = ObjectKind::from_code(kind[0])
            .ok_or_else(|| PackError::Corrupt(format!("unknown object kind {}", kind[0])))?;
        let mut id = [0u8; 32];
        self.input.read_exact(&mut id)?;
        let expected = ObjectId::new(id);
        let raw_len = read_u32(&mut self.input)? as usize;
        let compressed_len = read_u32(&mut self.input)? as usize;

        let mut compressed = Vec::new();
        (&mut self.input)
            .take(compressed_len as u64)
            .read_to_end(&mut compressed)?;
        if compressed.len() != compressed_len {
            return Err(PackError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        // Bounded by the announced size; a larger frame is an error.
        let raw = zstd::bulk::decompress(&compressed, raw_len)?;
        if raw.len() != raw_len {
            return Err(PackError::Corrupt(format!(
                "{} inflates to {} bytes, expected {}",
                expected,
                raw.len(),
                raw_len
            )));
        }
        let object = Object::from_bytes(&raw)
            .map_err(|e| PackError::Corrupt(format!("cannot decode {}: {}", expected, e)))?;
        let actual = object.id();
        if actual != expected || object.kind() != kind {
            return Err(PackError::IdMismatch { expected, actual });
        }
        Ok(object)
    }

    fn verify_trailer(&mut self) -> Result<(), PackError> {
        let digest = std::mem::take(&mut self.input.hasher).finalize();
        let mut trailer = [0u8; 32];
        self.input.inner.read_exact(&mut trailer)?;
        if digest.as_slice() != trailer {
            return Err(PackError::ChecksumMismatch);
        }
        Ok(())
    }
}

impl<R: Read> Iterator for PackReader<R> {
    type Item = Result<Object, PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.remaining == 0 {
            self.done = true;
            return self.verify_trailer().err().map(Err);
        }
        self.remaining -= 1;
        let entry = self.read_entry();
        if entry.is_err() {
            self.done = true;
        }
        Some(entry)
    }
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Blob, Commit, Tree, TreeEntry, mode};

    fn sample() -> Vec<Object> {
        let blob = Blob::new(b"hello world".to_vec());
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new("hello".into(), blob.id(), ObjectKind::Blob, mode::FILE));
        let commit = Commit::new(tree.id(), vec![], "me".into(), "first".into(), 1, 0);
        vec![Object::Blob(blob), Object::Tree(tree), Object::Commit(commit)]
    }

    fn write_pack(objects: &[Object]) -> Vec<u8> {
        let mut writer = PackWriter::new(Vec::new(), objects.len() as u32, 3).unwrap();
        for object in objects {
            writer.write_object(object).unwrap();
        }
        writer.finish().unwrap().0
    }

    #[test]
    fn test_pack_write_and_read() {
        let objects = sample();
        let bytes = write_pack(&objects);
        let reader = PackReader::new(&bytes[..]).unwrap();
        assert_eq!(PackReader::count(&reader), 3);
        let read: Vec<Object> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(read, objects);
    }

    #[test]
    fn test_pack_empty() {
        let bytes = write_pack(&[]);
        assert_eq!(bytes.len(), 12 + 32);
        assert_eq!(PackReader::new(&bytes[..]).unwrap().count(), 0);
        assert!(PackReader::new(&bytes[..]).unwrap().next().is_none());
    }

    #[test]
    fn test_pack_compression() {
        let large = Object::Blob(Blob::new(vec![b'A'; 10_000]));
        let bytes = write_pack(std::slice::from_ref(&large));
        assert!(bytes.len() < 1_000);
        let read: Vec<Object> = PackReader::new(&bytes[..]).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(read, vec![large]);
    }

    #[test]
    fn test_pack_detects_corruption() {
        let mut bytes = write_pack(&sample());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let result: Result<Vec<Object>, _> = PackReader::new(&bytes[..]).unwrap().collect();
        assert!(matches!(result, Err(PackError::ChecksumMismatch)));

        let mut bytes = write_pack(&sample());
        bytes[0] = b'X';
        assert!(matches!(PackReader::new(&bytes[..]), Err(PackError::BadMagic)));
    }

    #[test]
    fn test_pack_inflation_capped_at_announced_size() {
        let large = Object::Blob(Blob::new(vec![b'A'; 10_000]));
        let mut bytes = write_pack(std::slice::from_ref(&large));
        // magic, version, count, kind, id, then the raw size
        bytes[45..49].copy_from_slice(&64u32.to_le_bytes());
        let mut reader = PackReader::new(&bytes[..]).unwrap();
        assert!(matches!(reader.next(), Some(Err(PackError::Io(_)))));
    }

    #[test]
    fn test_pack_count_must_match() {
        let mut writer = PackWriter::new(Vec::new(), 2, 3).unwrap();
        writer.write_object(&sample()[0]).unwrap();
        assert!(matches!(
            writer.finish(),
            Err(PackError::CountMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_pack_truncated() {
        let bytes = write_pack(&sample());
        let cut = &bytes[..bytes.len() / 2];
        let result: Result<Vec<Object>, _> = PackReader::new(cut).unwrap().collect();
        assert!(result.is_err());
    }
}
