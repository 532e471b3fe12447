//! MODE Z (zlib-compressed data channel) framing.
//!
//! Not present in `sorng-ftp` itself; grounded on the sibling
//! `sorng-compression-vendor` crate in the same source repository, which
//! vendors `flate2` (and `zstd`, unused here — MODE Z is zlib-only) for the
//! monorepo's compression needs.

use crate::error::{EngineError, EngineResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Wraps a byte sink, deflating everything written to it before handing it
/// to the underlying data connection writer.
pub struct ZlibSender<W: Write> {
    inner: ZlibEncoder<W>,
}

impl<W: Write> ZlibSender<W> {
    pub fn new(writer: W, level: u32) -> Self {
        Self {
            inner: ZlibEncoder::new(writer, Compression::new(level)),
        }
    }

    pub fn write_chunk(&mut self, buf: &[u8]) -> EngineResult<()> {
        self.inner
            .write_all(buf)
            .map_err(|e| EngineError::decompression_failed(format!("MODE Z deflate error: {}", e)))
    }

    /// Must be called once the whole file has been fed in, to flush the
    /// final deflate block before the caller closes the socket.
    pub fn finish(self) -> EngineResult<W> {
        self.inner
            .finish()
            .map_err(|e| EngineError::decompression_failed(format!("MODE Z flush error: {}", e)))
    }
}

/// Wraps a byte source, inflating everything read from it.
pub struct ZlibReceiver<R: Read> {
    inner: ZlibDecoder<R>,
}

impl<R: Read> ZlibReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: ZlibDecoder::new(reader),
        }
    }

    /// Reads and inflates up to `buf.len()` decompressed bytes. Any zlib
    /// stream corruption is reported as `EngineErrorKind::DecompressionFailed`
    /// — one of the three data-channel failure classes the transport layer
    /// distinguishes.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        self.inner
            .read(buf)
            .map_err(|e| EngineError::decompression_failed(format!("MODE Z inflate error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_small_buffer() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut compressed = Vec::new();
        {
            let mut sender = ZlibSender::new(&mut compressed, 6);
            sender.write_chunk(&original).unwrap();
            sender.finish().unwrap();
        }
        let mut receiver = ZlibReceiver::new(&compressed[..]);
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = receiver.read_chunk(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, original);
    }

    #[test]
    fn garbage_input_is_a_decompression_error() {
        let mut receiver = ZlibReceiver::new(&b"not a zlib stream at all"[..]);
        let mut buf = [0u8; 16];
        assert!(receiver.read_chunk(&mut buf).is_err());
    }
}
