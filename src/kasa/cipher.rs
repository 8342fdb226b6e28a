// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plug wire cipher and TCP framing.
//!
//! Plugs obfuscate every message with an autokey XOR: the first byte is
//! XORed with [`INITIAL_KEY`] and every ciphertext byte becomes the key for
//! the next one. UDP datagrams carry the ciphertext alone; TCP messages are
//! prefixed with the big-endian plaintext length.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::KasaError;

/// Key applied to the first byte of every message.
pub const INITIAL_KEY: u8 = 171;

/// Largest TCP response accepted from a plug.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Obfuscates `plain`.
#[must_use]
pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plain
        .iter()
        .map(|&byte| {
            key ^= byte;
            key
        })
        .collect()
}

/// Reverses [`encrypt`].
#[must_use]
pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|&byte| {
            let plain = key ^ byte;
            key = byte;
            plain
        })
        .collect()
}

/// Encrypts `plain` and prefixes it with its length, as sent over TCP.
///
/// # Errors
///
/// [`KasaError::Frame`] if the message does not fit a 32-bit length.
pub fn frame(plain: &[u8]) -> Result<Vec<u8>, KasaError> {
    let len = u32::try_from(plain.len())
        .map_err(|_| KasaError::Frame(format!("message of {} bytes", plain.len())))?;
    let mut framed = Vec::with_capacity(4 + plain.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend(encrypt(plain));
    Ok(framed)
}

/// Sends `request` to a plug over TCP and returns the decrypted response.
///
/// # Errors
///
/// - [`KasaError::Io`] if the connection fails or `timeout` elapses
/// - [`KasaError::Frame`] if the response length is zero, oversized or the
///   body is not UTF-8
pub async fn call(addr: SocketAddr, request: &str, timeout: Duration) -> Result<String, KasaError> {
    tracing::debug!(addr = %addr, request = %request, "Calling plug over TCP");
    tokio::time::timeout(timeout, exchange(addr, request))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no response from {addr} after {} ms", timeout.as_millis()),
            )
        })?
}

async fn exchange(addr: SocketAddr, request: &str) -> Result<String, KasaError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&frame(request.as_bytes())?).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(KasaError::Frame(format!("response length {len}")));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    String::from_utf8(decrypt(&body)).map_err(|e| KasaError::Frame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn encrypt_chains_ciphertext_as_key() {
        // 171 ^ b'{' = 208, 208 ^ b'}' = 173
        assert_eq!(encrypt(b"{}"), vec![208, 173]);
        assert_eq!(decrypt(&[208, 173]), b"{}".to_vec());
    }

    #[test]
    fn decrypt_reverses_encrypt() {
        let query = br#"{"system":{"get_sysinfo":null}}"#;
        assert_ne!(encrypt(query), query.to_vec());
        assert_eq!(decrypt(&encrypt(query)), query.to_vec());
        assert!(encrypt(b"").is_empty());
    }

    #[test]
    fn frame_prefixes_plaintext_length() {
        let framed = frame(b"{}").unwrap();
        assert_eq!(&framed[..4], &[0, 0, 0, 2]);
        assert_eq!(&framed[4..], &[208, 173]);
    }

    #[tokio::test]
    async fn call_exchanges_framed_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let plug = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut body).await.unwrap();
            let request = String::from_utf8(decrypt(&body)).unwrap();

            stream.write_all(&frame(br#"{"ok":true}"#).unwrap()).await.unwrap();
            request
        });

        let response = call(addr, r#"{"ping":null}"#, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, r#"{"ok":true}"#);
        assert_eq!(plug.await.unwrap(), r#"{"ping":null}"#);
    }

    #[tokio::test]
    async fn call_rejects_empty_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut body).await.unwrap();
            stream.write_all(&[0, 0, 0, 0]).await.unwrap();
        });

        let err = call(addr, "{}", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, KasaError::Frame(_)));
    }
}
