use crate::crypto::{unpad_final_block, DecryptionKey, FileBlockSize, FusFileAes128};

use std::io::{self, Read};

use cipher::generic_array::typenum::Unsigned;
use crc32fast::Hasher;

const BLOCK: usize = FileBlockSize::USIZE;
const CHUNK_SIZE: usize = 1024 * 1024;

/// Streaming AES-128-ECB decryption of the firmware archive. The last
/// ciphertext block is held back until the inner reader reaches EOF so that
/// the PKCS#7 padding can be stripped without knowing the length up front.
pub struct DecryptReader<R> {
    inner: R,
    cipher: FusFileAes128,
    chunk: Box<[u8]>,
    /// Ciphertext that has been read but not decrypted yet
    pending: Vec<u8>,
    /// Plaintext ready to be returned
    output: Vec<u8>,
    output_pos: usize,
    finished: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(inner: R, key: &DecryptionKey) -> Self {
        Self {
            inner,
            cipher: FusFileAes128::new(key),
            chunk: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
            pending: Vec::with_capacity(CHUNK_SIZE + BLOCK),
            output: Vec::with_capacity(CHUNK_SIZE + BLOCK),
            output_pos: 0,
            finished: false,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn invalid(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
    }

    fn fill(&mut self) -> io::Result<()> {
        self.output.clear();
        self.output_pos = 0;

        let n = loop {
            match self.inner.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.pending.extend_from_slice(&self.chunk[..n]);

        let ready = if n == 0 {
            self.finished = true;

            if self.pending.is_empty() {
                return Err(Self::invalid("Encrypted data is empty"));
            } else if self.pending.len() % BLOCK != 0 {
                return Err(Self::invalid("Encrypted data is not a multiple of the block size"));
            }

            self.pending.len()
        } else {
            // Always keep at least one complete block for the final unpad
            (self.pending.len() - 1) / BLOCK * BLOCK
        };

        if ready == 0 {
            return Ok(());
        }

        self.cipher.decrypt_in_place(&mut self.pending[..ready])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.output.extend_from_slice(&self.pending[..ready]);
        self.pending.drain(..ready);

        if self.finished {
            let last = self.output.len() - BLOCK;
            let len = unpad_final_block(&self.output[last..])
                .ok_or_else(|| Self::invalid("Invalid padding in final block"))?;
            self.output.truncate(last + len);
        }

        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.output_pos == self.output.len() {
            if self.finished {
                return Ok(0);
            }
            self.fill()?;
        }

        let n = buf.len().min(self.output.len() - self.output_pos);
        buf[..n].copy_from_slice(&self.output[self.output_pos..self.output_pos + n]);
        self.output_pos += n;

        Ok(n)
    }
}

/// Computes the CRC32 of everything read through it.
pub struct CrcReader<R> {
    inner: R,
    hasher: Hasher,
    count: u64,
}

impl<R: Read> CrcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            count: 0,
        }
    }

    /// Number of bytes read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// CRC32 of the bytes read so far.
    pub fn crc32(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// CRC32 of the entire contents of a reader.
pub fn crc32_of(reader: impl Read) -> io::Result<u32> {
    let mut reader = CrcReader::new(reader);
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.crc32())
}
