//! AES-256-CTR stream transform.
//!
//! Encrypted layout: `IV (16 bytes) || ciphertext (len == plaintext len)`.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::key::EncryptionKey;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Length of the random IV written in front of every encrypted stream.
/// Any size announced to a receiver must include this overhead.
pub const IV_LEN: usize = 16;

/// Size of the plaintext chunks pushed through the keystream.
pub const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encrypted stream is missing its 16-byte IV preamble")]
    ShortPreamble,

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn new_cipher(key: &EncryptionKey, iv: &[u8; IV_LEN]) -> Result<Aes256Ctr, CipherError> {
    Aes256Ctr::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CipherError::InvalidKey(e.to_string()))
}

/// Encrypts `src` into `dst`, chunk by chunk.
///
/// Returns the number of bytes written to `dst`: `IV_LEN + plaintext length`.
pub async fn encrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut cipher = new_cipher(key, &iv)?;

    dst.write_all(&iv).await?;
    let written = copy_stream(&mut cipher, src, dst).await?;

    Ok(IV_LEN as u64 + written)
}

/// Decrypts `src` into `dst`. The IV preamble is consumed first.
///
/// Returns the number of plaintext bytes written to `dst`.
pub async fn decrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    if let Err(e) = src.read_exact(&mut iv).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CipherError::ShortPreamble,
            _ => CipherError::Io(e),
        });
    }
    let mut cipher = new_cipher(key, &iv)?;

    copy_stream(&mut cipher, src, dst).await
}

async fn copy_stream<R, W>(
    cipher: &mut Aes256Ctr,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    dst.flush().await?;
    Ok(total)
}
