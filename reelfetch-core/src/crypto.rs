use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use aes::Aes128;
use bytes::Bytes;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, KeyIvInit};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CryptoError, DownloadError};
use crate::types::FragmentKey;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
#[cfg(test)]
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: f64 = 1.15;

/// Decrypts fragments keyed by `#EXT-X-KEY` tags. Caches key bytes per URI
/// within a download; the pipeline threads a fresh cache per download so a
/// new `EXT-X-KEY` URI simply misses rather than needing explicit eviction.
pub struct FragmentCryptor {
    http_client: Client,
    key_cache: Mutex<HashMap<String, Bytes>>,
}

impl FragmentCryptor {
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            key_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Decrypt `ciphertext` under `key`. Plaintext (no uri/iv) passes through
    /// unchanged. Failures are wrapped as `DecryptionFailed`.
    pub async fn decrypt(
        &self,
        key: &Option<FragmentKey>,
        ciphertext: Bytes,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        let key = match key {
            Some(k) if !k.is_plaintext() => k,
            _ => return Ok(ciphertext),
        };
        let uri = key.uri.as_ref().expect("checked by is_plaintext");
        let iv_raw = key.iv.as_ref().expect("checked by is_plaintext");

        let key_bytes = self
            .fetch_key_cached(uri, retries, cancel)
            .await
            .map_err(DownloadError::from)?;
        let iv = normalize_iv(iv_raw).map_err(DownloadError::from)?;

        let mut buffer = ciphertext.to_vec();
        let decrypted_len = {
            let cipher = Aes128CbcDec::new_from_slices(&key_bytes, &iv)
                .map_err(|err| CryptoError::Cipher(err.to_string()))
                .map_err(DownloadError::from)?;
            cipher
                .decrypt_padded_mut::<Pkcs7>(&mut buffer)
                .map_err(|err| CryptoError::Cipher(err.to_string()))
                .map_err(DownloadError::from)?
                .len()
        };
        buffer.truncate(decrypted_len);
        Ok(Bytes::from(buffer))
    }

    async fn fetch_key_cached(
        &self,
        uri: &str,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        if let Some(cached) = self.key_cache.lock().unwrap().get(uri).cloned() {
            return Ok(cached);
        }

        let bytes = fetch_with_retry(&self.http_client, uri, retries, cancel).await?;
        if bytes.len() != 16 {
            return Err(DownloadError::from(CryptoError::InvalidKeyLength(
                bytes.len(),
            )));
        }
        self.key_cache
            .lock()
            .unwrap()
            .insert(uri.to_string(), bytes.clone());
        Ok(bytes)
    }
}

async fn fetch_with_retry(
    client: &Client,
    uri: &str,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<Bytes, DownloadError> {
    let attempts = retries.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match client.get(uri).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => match response.bytes().await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => last_error = Some(err),
            },
            Err(err) => last_error = Some(err),
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if attempt + 1 < attempts {
            let delay = INITIAL_BACKOFF.mul_f64(BACKOFF_FACTOR.powi(attempt as i32));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
        }
    }
    Err(DownloadError::Fetch {
        uri: uri.to_string(),
        cause: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Strip optional `0x` prefix, right-pad with `0` to 32 hex chars, truncate
/// to 32, decode to exactly 16 bytes. Idempotent: `normalize(normalize(x))
/// == normalize(x)`.
pub fn normalize_iv(raw: &str) -> Result<[u8; 16], CryptoError> {
    let stripped = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")).unwrap_or(raw);
    let mut padded = stripped.to_string();
    if padded.len() < 32 {
        padded.push_str(&"0".repeat(32 - padded.len()));
    } else if padded.len() > 32 {
        debug!(raw, "IV longer than 16 bytes, truncating");
    }
    padded.truncate(32);
    let mut iv = [0u8; 16];
    hex::decode_to_slice(&padded, &mut iv).map_err(|_| CryptoError::InvalidIv(raw.to_string()))?;
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::BlockEncryptMut;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// One-shot blocking HTTP server returning `key_bytes` as the body of
    /// any GET request; enough to exercise `FragmentCryptor::fetch_key_cached`
    /// against a real network round trip.
    fn spawn_key_server(key_bytes: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind key server");
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    key_bytes.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.write_all(&key_bytes);
            }
        });
        port
    }

    #[tokio::test]
    async fn decrypt_recovers_plaintext_through_real_aes_128_cbc_pkcs7() {
        let key_bytes: [u8; 16] = *b"0123456789abcdef";
        let iv: [u8; 16] = *b"fedcba9876543210";
        let plaintext = b"this is real fragment media bytes, long enough to span blocks".to_vec();

        let ciphertext = Aes128CbcEnc::new_from_slices(&key_bytes, &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let port = spawn_key_server(key_bytes.to_vec());
        let cryptor = FragmentCryptor::new(Client::new());
        let key = FragmentKey {
            uri: Some(format!("http://127.0.0.1:{port}/key")),
            iv: Some(hex::encode(iv)),
        };
        let cancel = CancellationToken::new();

        let recovered = cryptor
            .decrypt(&Some(key), Bytes::from(ciphertext), 2, &cancel)
            .await
            .unwrap();
        assert_eq!(recovered.as_ref(), plaintext.as_slice());
    }

    #[tokio::test]
    async fn decrypt_fails_with_wrong_key_length() {
        let port = spawn_key_server(b"too-short".to_vec());
        let cryptor = FragmentCryptor::new(Client::new());
        let key = FragmentKey {
            uri: Some(format!("http://127.0.0.1:{port}/key")),
            iv: Some(hex::encode([0u8; 16])),
        };
        let cancel = CancellationToken::new();
        let result = cryptor
            .decrypt(&Some(key), Bytes::from_static(b"irrelevant-ciphertext-16"), 1, &cancel)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            DownloadError::DecryptionFailed(CryptoError::InvalidKeyLength(_))
        ));
    }

    #[test]
    fn normalize_iv_is_idempotent() {
        let a = normalize_iv("0x0f").unwrap();
        let reencoded = hex::encode(a);
        let b = normalize_iv(&reencoded).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_iv_pads_short_input() {
        let iv = normalize_iv("0f").unwrap();
        assert_eq!(iv.len(), 16);
        assert_eq!(iv[0], 0x0f);
        assert_eq!(iv[1], 0x00);
    }

    #[test]
    fn normalize_iv_truncates_long_input() {
        let iv = normalize_iv("00112233445566778899aabbccddeeff00112233").unwrap();
        assert_eq!(iv.len(), 16);
        assert_eq!(iv[0], 0x00);
        assert_eq!(iv[1], 0x11);
    }

    #[test]
    fn normalize_iv_rejects_non_hex() {
        assert!(normalize_iv("not-hex-at-all-zz").is_err());
    }

    #[tokio::test]
    async fn plaintext_passthrough_when_key_absent() {
        let cryptor = FragmentCryptor::new(Client::new());
        let cancel = CancellationToken::new();
        let data = Bytes::from_static(b"hello");
        let out = cryptor.decrypt(&None, data.clone(), 3, &cancel).await.unwrap();
        assert_eq!(out, data);
    }
}
