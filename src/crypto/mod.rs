//! Packet encryption
//!
//! Packets are encrypted with the recipient's RSA-2048 public key in
//! independent PKCS#1 v1.5 blocks: 245 bytes of plaintext become one
//! 256-byte ciphertext block. Both directions are streaming adapters so the
//! gzip layer can sit directly on top of them.

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Plaintext bytes per block
pub const PLAIN_BLOCK: usize = 245;

/// Ciphertext bytes per block
pub const CIPHER_BLOCK: usize = 256;

/// Modulus size matching the block sizes above
pub const KEY_BITS: usize = CIPHER_BLOCK * 8;

/// Crypto errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Key is {0} bits, expected {KEY_BITS}")]
    KeySize(usize),

    #[error("Ciphertext length {0} is not a multiple of {CIPHER_BLOCK}")]
    MalformedLength(usize),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// A peer's own keypair
#[derive(Clone)]
pub struct PeerKeys {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl std::fmt::Debug for PeerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerKeys")
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

impl PeerKeys {
    /// Generate a fresh RSA-2048 keypair
    pub fn generate() -> CryptoResult<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)?;
        Ok(Self::from_private(private))
    }

    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Load a PKCS#8 PEM private key
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let pem = std::fs::read_to_string(path)?;
        let private =
            RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
        check_size(&RsaPublicKey::from(&private))?;
        Ok(Self::from_private(private))
    }

    /// Write the keypair as `<dir>/private.pem` and `<dir>/public.pem`
    pub fn save(&self, dir: &Path) -> CryptoResult<()> {
        std::fs::create_dir_all(dir)?;

        let private = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        std::fs::write(dir.join("private.pem"), private.as_bytes())?;

        let public = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Pem(e.to_string()))?;
        std::fs::write(dir.join("public.pem"), public)?;
        Ok(())
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }
}

/// Load a peer's PEM public key
pub fn load_public_key(path: &Path) -> CryptoResult<RsaPublicKey> {
    let pem = std::fs::read_to_string(path)?;
    let key = RsaPublicKey::from_public_key_pem(&pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
    check_size(&key)?;
    Ok(key)
}

fn check_size(key: &RsaPublicKey) -> CryptoResult<()> {
    if key.size() != CIPHER_BLOCK {
        return Err(CryptoError::KeySize(key.size() * 8));
    }
    Ok(())
}

/// Writer that encrypts everything written to it, block by block
pub struct BlockEncryptor<'k, W: Write> {
    key: &'k RsaPublicKey,
    inner: W,
    pending: Vec<u8>,
}

impl<'k, W: Write> BlockEncryptor<'k, W> {
    pub fn new(key: &'k RsaPublicKey, inner: W) -> Self {
        Self {
            key,
            inner,
            pending: Vec::with_capacity(PLAIN_BLOCK),
        }
    }

    fn seal(&mut self, end: usize) -> CryptoResult<()> {
        let block = self
            .key
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &self.pending[..end])?;
        self.inner.write_all(&block)?;
        self.pending.drain(..end);
        Ok(())
    }

    /// Encrypt the final partial block and hand back the inner writer
    pub fn finish(mut self) -> CryptoResult<W> {
        if !self.pending.is_empty() {
            let end = self.pending.len();
            self.seal(end)?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BlockEncryptor<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= PLAIN_BLOCK {
            self.seal(PLAIN_BLOCK).map_err(into_io)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // A partial block can only be sealed by finish().
        self.inner.flush()
    }
}

/// Reader that decrypts 256-byte blocks from the inner reader
pub struct BlockDecryptor<'k, R: Read> {
    key: &'k RsaPrivateKey,
    inner: R,
    plain: Vec<u8>,
    pos: usize,
}

impl<'k, R: Read> BlockDecryptor<'k, R> {
    pub fn new(key: &'k RsaPrivateKey, inner: R) -> Self {
        Self {
            key,
            inner,
            plain: Vec::with_capacity(PLAIN_BLOCK),
            pos: 0,
        }
    }

    /// Decrypt the next block, returning false at a clean end of input
    fn next_block(&mut self) -> CryptoResult<bool> {
        let mut block = [0u8; CIPHER_BLOCK];
        let mut filled = 0;
        while filled < CIPHER_BLOCK {
            let n = self.inner.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        match filled {
            0 => Ok(false),
            CIPHER_BLOCK => {
                self.plain = self.key.decrypt(Pkcs1v15Encrypt, &block)?;
                self.pos = 0;
                Ok(true)
            }
            partial => Err(CryptoError::MalformedLength(partial)),
        }
    }
}

impl<R: Read> Read for BlockDecryptor<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if !self.next_block().map_err(into_io)? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn into_io(e: CryptoError) -> io::Error {
    match e {
        CryptoError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}


#[cfg(test)]
mod tests {
    use super::test_keys::{alice, bob};
    use super::*;
    use tempfile::TempDir;

    fn encrypt_blocks(key: &RsaPublicKey, plain: &[u8]) -> CryptoResult<Vec<u8>> {
        let blocks = plain.len().div_ceil(PLAIN_BLOCK);
        let mut writer = BlockEncryptor::new(key, Vec::with_capacity(blocks * CIPHER_BLOCK));
        writer.write_all(plain)?;
        writer.finish()
    }

    fn decrypt_blocks(key: &RsaPrivateKey, cipher: &[u8]) -> CryptoResult<Vec<u8>> {
        if cipher.len() % CIPHER_BLOCK != 0 {
            return Err(CryptoError::MalformedLength(cipher.len()));
        }
        let mut plain = Vec::with_capacity(cipher.len() / CIPHER_BLOCK * PLAIN_BLOCK);
        BlockDecryptor::new(key, cipher).read_to_end(&mut plain)?;
        Ok(plain)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_block_roundtrip_lengths() {
        let keys = alice();
        for len in [0, 1, 244, 245, 246, 490, 491, 1000, 4096] {
            let plain = pattern(len);
            let cipher = encrypt_blocks(keys.public_key(), &plain).unwrap();
            assert_eq!(cipher.len(), len.div_ceil(PLAIN_BLOCK) * CIPHER_BLOCK);
            assert_eq!(decrypt_blocks(keys.private_key(), &cipher).unwrap(), plain);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = encrypt_blocks(alice().public_key(), b"secret").unwrap();
        assert!(decrypt_blocks(bob().private_key(), &cipher).is_err());
    }

    #[test]
    fn test_truncated_ciphertext() {
        let cipher = encrypt_blocks(alice().public_key(), &pattern(300)).unwrap();
        assert!(matches!(
            decrypt_blocks(alice().private_key(), &cipher[..300]),
            Err(CryptoError::MalformedLength(300))
        ));
    }

    #[test]
    fn test_streaming_in_small_writes() {
        let keys = alice();
        let plain = pattern(700);
        let mut writer = BlockEncryptor::new(keys.public_key(), Vec::new());
        for chunk in plain.chunks(7) {
            writer.write_all(chunk).unwrap();
        }
        let cipher = writer.finish().unwrap();
        assert_eq!(cipher.len(), 3 * CIPHER_BLOCK);

        let mut reader = BlockDecryptor::new(keys.private_key(), &cipher[..]);
        let mut out = Vec::new();
        let mut buf = [0u8; 13];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, plain);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        alice().save(dir.path()).unwrap();

        let loaded = PeerKeys::load(&dir.path().join("private.pem")).unwrap();
        assert_eq!(loaded.public_key(), alice().public_key());

        let public = load_public_key(&dir.path().join("public.pem")).unwrap();
        assert_eq!(&public, alice().public_key());
    }
}
