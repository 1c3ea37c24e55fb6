//! Packet codec
//!
//! Outbound: envelope header and body are framed, gzip-compressed and then
//! encrypted for the recipient in one streaming pass. Inbound runs the same
//! pipeline in reverse and uses the command registry to pick the body type.

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::io::{self, Read, Write};
use thiserror::Error;

use super::ids::{get_id, put_id};
use super::message::{Envelope, Message};
use super::registry::CommandRegistry;
use crate::clock::PseudoTime;
use crate::crypto::{BlockDecryptor, BlockEncryptor, CryptoError, CIPHER_BLOCK};

/// Largest UDP payload we will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest decompressed frame accepted
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Header size: command(4) + message id(16) + sender id(16) + timestamp(8)
pub const HEADER_SIZE: usize = 44;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Incomplete message")]
    Incomplete,

    #[error("Unknown command code {0}")]
    UnknownCommand(i32),

    #[error("Unknown value tag {0}")]
    UnknownValueTag(i32),

    #[error("Lists nested deeper than {0}")]
    TooDeep(usize),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Negative length {0}")]
    NegativeLength(i32),

    #[error("{0} unread bytes after message body")]
    TrailingBytes(usize),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Fail with [`CodecError::Incomplete`] unless `n` more bytes are available
pub fn need(buf: &impl Buf, n: usize) -> CodecResult<()> {
    if buf.remaining() < n {
        return Err(CodecError::Incomplete);
    }
    Ok(())
}

/// Frames, compresses and encrypts envelopes
#[derive(Debug, Clone, Default)]
pub struct PacketCodec {
    registry: CommandRegistry,
}

impl PacketCodec {
    pub fn new(registry: CommandRegistry) -> Self {
        Self { registry }
    }

    /// Plain frame: header then body
    pub fn encode_frame(&self, envelope: &Envelope) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_i32(envelope.command);
        put_id(&mut buf, &envelope.id);
        put_id(&mut buf, &envelope.sender);
        envelope.timestamp.encode(&mut buf);
        envelope.message.encode_body(&mut buf);
        buf
    }

    /// Parse a plain frame
    pub fn decode_frame(&self, frame: &[u8]) -> CodecResult<Envelope> {
        let mut buf = frame;
        need(&buf, HEADER_SIZE)?;

        let command = buf.get_i32();
        let kind = self
            .registry
            .lookup(command)
            .ok_or(CodecError::UnknownCommand(command))?;
        let id = get_id(&mut buf)?;
        let sender = get_id(&mut buf)?;
        let timestamp = PseudoTime::decode(&mut buf)?;
        let message = Message::decode_body(kind, &mut buf)?;

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }

        Ok(Envelope {
            command,
            id,
            sender,
            timestamp,
            message,
        })
    }

    /// Frame, compress and encrypt an envelope for one recipient
    pub fn seal(&self, envelope: &Envelope, recipient: &RsaPublicKey) -> CodecResult<Vec<u8>> {
        let frame = self.encode_frame(envelope);

        let encryptor = BlockEncryptor::new(recipient, Vec::new());
        let mut gz = GzEncoder::new(encryptor, Compression::default());
        gz.write_all(&frame)?;
        let packet = gz.finish()?.finish()?;

        if packet.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::MessageTooLarge(packet.len(), MAX_DATAGRAM_SIZE));
        }
        Ok(packet)
    }

    /// Decrypt, decompress and parse a datagram
    pub fn open(&self, packet: &[u8], key: &RsaPrivateKey) -> CodecResult<Envelope> {
        if packet.is_empty() || packet.len() % CIPHER_BLOCK != 0 {
            return Err(CryptoError::MalformedLength(packet.len()).into());
        }

        let gz = GzDecoder::new(BlockDecryptor::new(key, packet));
        let mut frame = Vec::new();
        gz.take(MAX_FRAME_SIZE as u64 + 1).read_to_end(&mut frame)?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(frame.len(), MAX_FRAME_SIZE));
        }

        self.decode_frame(&frame)
    }
}
