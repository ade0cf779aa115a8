//! In-memory storage for binary attachment content
//!
//! A [`Blob`] is written once, committed, and then read any number of times.
//! Content lives in fixed-size chunks that are never reallocated, so appending
//! never copies bytes that were already stored.
use crate::error::{XmlError, XmlErrorKind, XmlResult, bail};
use std::io::{Read, Seek, SeekFrom, Write};

/// Default size of a single chunk, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// The lifecycle phase of a [`Blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPhase {
    /// Nothing has been written yet
    New,

    /// Content is being appended
    Writing,

    /// Content is final and can be read
    Committed,
}

/// An append-then-read byte buffer made of fixed-size chunks.
///
/// Before [`Blob::commit`] only appending is legal; afterwards only reading is.
/// Reads never share cursor state, so any number of [`BlobReader`]s can read
/// the same committed blob at different offsets.
///
/// # Example
/// ```rust
/// use lazy_xmltree::Blob;
///
/// let mut blob = Blob::with_chunk_size(4);
/// blob.append(b"hello ").unwrap();
/// blob.append(b"world").unwrap();
/// blob.commit();
///
/// assert_eq!(blob.total_length(), 11);
/// assert_eq!(blob.read(6, 5).unwrap(), b"world");
/// ```
#[derive(Debug, Clone)]
pub struct Blob {
    chunk_size: usize,
    chunks: Vec<Box<[u8]>>,

    /// Bytes used in the last chunk
    index: usize,
    phase: BlobPhase,
}
impl Blob {
    /// Creates an empty blob using [`DEFAULT_CHUNK_SIZE`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Creates an empty blob with the given chunk size.
    /// A chunk size of zero is treated as 1.
    #[must_use]
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunks: vec![],
            index: 0,
            phase: BlobPhase::New,
        }
    }

    /// Creates a committed blob holding a copy of the given bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8], chunk_size: usize) -> Self {
        let mut blob = Self::with_chunk_size(chunk_size);
        blob.push_bytes(bytes);
        blob.phase = BlobPhase::Committed;
        blob
    }

    /// Returns the current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> BlobPhase {
        self.phase
    }

    /// Returns true once [`Blob::commit`] has been called.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.phase == BlobPhase::Committed
    }

    /// Returns the configured chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of bytes appended so far. Valid in every phase.
    #[must_use]
    pub fn total_length(&self) -> usize {
        match self.chunks.len() {
            0 => 0,
            n => (n - 1) * self.chunk_size + self.index,
        }
    }

    /// Alias of [`Blob::total_length`].
    #[must_use]
    pub fn len(&self) -> usize {
        self.total_length()
    }

    /// Return true if no bytes were appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_length() == 0
    }

    /// Appends bytes to the blob, returning the number of bytes written.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob was already committed.
    pub fn append(&mut self, bytes: &[u8]) -> XmlResult<usize> {
        self.ensure_writable()?;
        Ok(self.push_bytes(bytes))
    }

    /// Streams bytes from `reader` directly into the chunks.
    ///
    /// Reads until end of input, or until `limit` bytes were received.
    /// If `commit` is true the blob is committed afterward.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob was already committed,
    /// or an IO error if the reader fails.
    pub fn read_from<R: Read>(
        &mut self,
        reader: &mut R,
        limit: Option<u64>,
        commit: bool,
    ) -> XmlResult<u64> {
        self.ensure_writable()?;
        let limit = limit.unwrap_or(u64::MAX);
        let mut received = 0u64;

        while received < limit {
            if self.chunks.is_empty() || self.index == self.chunk_size {
                self.add_chunk();
            }

            let room = (self.chunk_size - self.index) as u64;
            let want = room.min(limit - received) as usize;
            let start = self.index;
            let Some(chunk) = self.chunks.last_mut() else {
                break;
            };

            let n = match reader.read(&mut chunk[start..start + want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            self.index += n;
            received += n as u64;
        }

        if commit {
            self.commit();
        }
        Ok(received)
    }

    /// Ends the writing phase. Calling it again has no effect.
    pub fn commit(&mut self) {
        if self.phase != BlobPhase::Committed {
            tracing::trace!(length = self.total_length(), "blob committed");
            self.phase = BlobPhase::Committed;
        }
    }

    /// Reads up to `len` bytes starting at `offset`.
    /// Reads past the end return a short, possibly empty, result.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob is not committed yet.
    pub fn read(&self, offset: usize, len: usize) -> XmlResult<Vec<u8>> {
        self.ensure_readable()?;
        let end = offset.saturating_add(len).min(self.total_length());
        let mut out = Vec::with_capacity(end.saturating_sub(offset));

        let mut pos = offset;
        while pos < end {
            let chunk = &self.chunks[pos / self.chunk_size];
            let start = pos % self.chunk_size;
            let n = (self.chunk_size - start).min(end - pos);
            out.extend_from_slice(&chunk[start..start + n]);
            pos += n;
        }

        Ok(out)
    }

    /// Copies bytes starting at `offset` into `buf`, returning how many were copied.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob is not committed yet.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> XmlResult<usize> {
        self.ensure_readable()?;
        let end = offset.saturating_add(buf.len()).min(self.total_length());

        let mut pos = offset;
        let mut written = 0;
        while pos < end {
            let chunk = &self.chunks[pos / self.chunk_size];
            let start = pos % self.chunk_size;
            let n = (self.chunk_size - start).min(end - pos);
            buf[written..written + n].copy_from_slice(&chunk[start..start + n]);
            pos += n;
            written += n;
        }

        Ok(written)
    }

    /// Returns an independent reader positioned at the start of the blob.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob is not committed yet.
    pub fn reader(&self) -> XmlResult<BlobReader<'_>> {
        self.ensure_readable()?;
        Ok(BlobReader {
            blob: self,
            position: 0,
        })
    }

    /// Iterates over the filled part of each chunk, in order.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob is not committed yet.
    pub fn chunks(&self) -> XmlResult<impl Iterator<Item = &[u8]>> {
        self.ensure_readable()?;
        let last = self.chunks.len().saturating_sub(1);
        Ok(self.chunks.iter().enumerate().map(move |(i, chunk)| {
            if i == last {
                &chunk[..self.index]
            } else {
                &chunk[..]
            }
        }))
    }

    /// Writes the whole content to `writer`, chunk by chunk.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob is not committed yet,
    /// or an IO error if the writer fails.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> XmlResult<()> {
        for chunk in self.chunks()? {
            writer.write_all(chunk)?;
        }
        Ok(())
    }

    /// Returns a copy of the full content.
    ///
    /// # Errors
    /// Returns a `LifecycleViolation` if the blob is not committed yet.
    pub fn to_vec(&self) -> XmlResult<Vec<u8>> {
        self.read(0, self.total_length())
    }

    fn push_bytes(&mut self, mut bytes: &[u8]) -> usize {
        let total = bytes.len();
        if self.phase == BlobPhase::New {
            self.phase = BlobPhase::Writing;
        }

        while !bytes.is_empty() {
            if self.chunks.is_empty() || self.index == self.chunk_size {
                self.add_chunk();
            }

            let n = (self.chunk_size - self.index).min(bytes.len());
            let start = self.index;
            if let Some(chunk) = self.chunks.last_mut() {
                chunk[start..start + n].copy_from_slice(&bytes[..n]);
            }

            self.index += n;
            bytes = &bytes[n..];
        }

        total
    }

    fn add_chunk(&mut self) {
        self.chunks.push(vec![0; self.chunk_size].into_boxed_slice());
        self.index = 0;
    }

    fn ensure_writable(&mut self) -> XmlResult<()> {
        match self.phase {
            BlobPhase::Committed => bail!(XmlErrorKind::LifecycleViolation(
                "cannot append to a committed blob".into()
            )),
            BlobPhase::New => {
                self.phase = BlobPhase::Writing;
                Ok(())
            }
            BlobPhase::Writing => Ok(()),
        }
    }

    fn ensure_readable(&self) -> XmlResult<()> {
        if self.phase != BlobPhase::Committed {
            bail!(XmlErrorKind::LifecycleViolation(
                "cannot read a blob before it is committed".into()
            ));
        }
        Ok(())
    }
}
impl Default for Blob {
    fn default() -> Self {
        Self::new()
    }
}
impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        if self.phase != other.phase || self.total_length() != other.total_length() {
            return false;
        }

        // Chunk sizes may differ, so compare byte-wise through the committed view
        match (self.to_vec(), other.to_vec()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// A cursor over a committed [`Blob`].
///
/// Each reader owns its own position; readers never interfere with one another.
#[derive(Debug, Clone)]
pub struct BlobReader<'b> {
    blob: &'b Blob,
    position: usize,
}
impl BlobReader<'_> {
    /// Current offset into the blob.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes remaining from the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.blob.total_length().saturating_sub(self.position)
    }
}
impl Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self
            .blob
            .read_into(self.position, buf)
            .map_err(std::io::Error::from)?;
        self.position += n;
        Ok(n)
    }
}
impl Seek for BlobReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.blob.total_length() as i128;
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::End(n) => len + i128::from(n),
            SeekFrom::Current(n) => self.position as i128 + i128::from(n),
        };

        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before the start of the blob",
            ));
        }

        self.position = usize::try_from(target).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek offset overflow")
        })?;
        Ok(self.position as u64)
    }
}

impl From<XmlError> for std::io::Error {
    fn from(err: XmlError) -> Self {
        match err.kind {
            XmlErrorKind::Io(e) => e,
            kind => std::io::Error::other(kind.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_append_crosses_chunks() {
        let mut blob = Blob::with_chunk_size(4);
        assert_eq!(blob.phase(), BlobPhase::New);

        assert_eq!(blob.append(b"abcdefghij").unwrap(), 10);
        assert_eq!(blob.phase(), BlobPhase::Writing);
        assert_eq!(blob.total_length(), 10);

        blob.commit();
        blob.commit();
        assert_eq!(blob.to_vec().unwrap(), b"abcdefghij");
        assert_eq!(blob.read(3, 4).unwrap(), b"defg");
    }

    #[test]
    fn test_exact_chunk_boundary() {
        let mut blob = Blob::with_chunk_size(4);
        blob.append(b"abcd").unwrap();
        assert_eq!(blob.total_length(), 4);
        blob.append(b"efgh").unwrap();
        assert_eq!(blob.total_length(), 8);
        blob.commit();

        let chunks: Vec<&[u8]> = blob.chunks().unwrap().collect();
        assert_eq!(chunks, vec![&b"abcd"[..], &b"efgh"[..]]);
    }

    #[test]
    fn test_lifecycle_violations() {
        let mut blob = Blob::new();
        blob.append(b"data").unwrap();

        let err = blob.read(0, 4).unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::LifecycleViolation(_)));
        assert!(blob.reader().is_err());

        blob.commit();
        let err = blob.append(b"more").unwrap_err();
        assert!(matches!(err.kind, XmlErrorKind::LifecycleViolation(_)));
        assert_eq!(blob.total_length(), 4);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let blob = Blob::from_bytes(b"12345", 2);
        assert_eq!(blob.read(3, 10).unwrap(), b"45");
        assert!(blob.read(5, 10).unwrap().is_empty());
        assert!(blob.read(100, 1).unwrap().is_empty());
    }

    #[test]
    fn test_empty_blob() {
        let mut blob = Blob::new();
        blob.commit();
        assert_eq!(blob.total_length(), 0);
        assert!(blob.to_vec().unwrap().is_empty());
        assert_eq!(blob.chunks().unwrap().count(), 0);
    }

    #[test]
    fn test_read_from_stream() {
        let data: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let mut blob = Blob::with_chunk_size(64);
        let n = blob
            .read_from(&mut data.as_slice(), Some(700), true)
            .unwrap();
        assert_eq!(n, 700);
        assert!(blob.is_committed());
        assert_eq!(blob.to_vec().unwrap(), &data[..700]);
    }

    #[test]
    fn test_write_to() {
        let blob = Blob::from_bytes(b"some content", 5);
        let mut out = vec![];
        blob.write_to(&mut out).unwrap();
        assert_eq!(out, b"some content");
    }

    #[test]
    fn test_independent_readers() {
        let blob = Blob::from_bytes(b"0123456789", 3);
        let mut a = blob.reader().unwrap();
        let mut b = blob.reader().unwrap();

        let mut buf = [0u8; 4];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");

        b.seek(SeekFrom::Start(6)).unwrap();
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"6789");

        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"4567");
        assert_eq!(a.remaining(), 2);

        // mark/reset
        a.seek(SeekFrom::Current(-4)).unwrap();
        assert_eq!(a.position(), 4);
        assert!(a.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn test_random_read_write() {
        let mut rng = rand::thread_rng();
        for size in [0usize, 1, 4095, 4096, 4097, 20_000, 65_537] {
            let mut data = vec![0u8; size];
            rng.fill(&mut data[..]);

            let mut blob = Blob::new();
            let mut offset = 0;
            while offset < data.len() {
                let n = (512 + rng.gen_range(0..1024)).min(data.len() - offset);
                assert_eq!(blob.append(&data[offset..offset + n]).unwrap(), n);
                offset += n;
            }
            blob.commit();
            assert_eq!(blob.total_length(), size);

            let mut reader = blob.reader().unwrap();
            let mut copy = Vec::with_capacity(size);
            let mut buffer = [0u8; 2048];
            loop {
                let start = rng.gen_range(0..512);
                let len = 512 + rng.gen_range(0..1024);
                let n = reader.read(&mut buffer[start..start + len]).unwrap();
                if n == 0 {
                    break;
                }
                copy.extend_from_slice(&buffer[start..start + n]);
            }
            assert_eq!(copy, data);

            for _ in 0..32 {
                let offset = rng.gen_range(0..=size);
                let len = rng.gen_range(0..3000);
                let end = (offset + len).min(size);
                assert_eq!(blob.read(offset, len).unwrap(), &data[offset..end]);
            }
        }
    }
}
