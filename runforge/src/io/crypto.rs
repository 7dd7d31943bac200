//! Authenticated file encryption for run archives.
//!
//! Layout of a `.enc` file:
//!
//! ```text
//! magic (8) | key check (32) | nonce prefix (8) | frame | frame | ...
//! frame = flag (1) | ciphertext length (u32 LE) | AES-256-GCM ciphertext
//! ```
//!
//! Plaintext is sealed in 1 MiB chunks. The nonce of chunk `i` is the random prefix
//! followed by `i` as a big-endian `u32`; the flag byte is bound as associated data and
//! is `1` only on the final frame, so truncation at a frame boundary is detected.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};

const MAGIC: &[u8; 8] = b"RFENC\x00\x01\n";
const CHECK_DOMAIN: &[u8] = b"runforge-key-check\0";
const CHUNK_SIZE: usize = 1024 * 1024;
const TAG_LEN: usize = 16;
const FLAG_MORE: u8 = 0;
const FLAG_LAST: u8 = 1;

/// 256-bit key that seals run archives.
#[derive(Clone, PartialEq, Eq)]
pub struct ArchiveKey([u8; 32]);

impl ArchiveKey {
    /// Derive the key from a user/password pair: SHA-256 of `"<user>:<password>"`.
    pub fn derive(user: &str, password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Value stored in the archive header to recognise the right key without
    /// attempting decryption.
    fn check_value(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(CHECK_DOMAIN);
        hasher.update(self.0);
        hasher.finalize().into()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArchiveKey(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("archive was sealed with a different key")]
    CredentialMismatch,
    #[error("{0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encrypt `src` into `dest`.
///
/// Output goes to `<dest>.part` first and is renamed into place only once the final
/// frame is on disk.
#[instrument(skip_all, fields(src = %src.display(), dest = %dest.display()))]
pub fn encrypt_file(src: &Path, dest: &Path, key: &ArchiveKey) -> Result<(), CryptoError> {
    let part = part_path(dest);
    let result = (|| -> Result<(), CryptoError> {
        let reader = BufReader::new(File::open(src)?);
        let file = File::create(&part)?;
        let mut writer = BufWriter::new(file);
        seal(reader, &mut writer, key, CHUNK_SIZE)?;
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&part);
        return Err(err);
    }
    fs::rename(&part, dest)?;
    debug!("archive sealed");
    Ok(())
}

/// Decrypt `src` into `dest`. A partially written `dest` is removed on failure.
#[instrument(skip_all, fields(src = %src.display(), dest = %dest.display()))]
pub fn decrypt_file(src: &Path, dest: &Path, key: &ArchiveKey) -> Result<(), CryptoError> {
    let reader = BufReader::new(File::open(src)?);
    let result = (|| -> Result<(), CryptoError> {
        let mut writer = BufWriter::new(File::create(dest)?);
        open(reader, &mut writer, key)?;
        writer.flush()?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

/// Path of the in-progress output for `dest`.
pub fn part_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    name.into()
}

fn seal<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    key: &ArchiveKey,
    chunk_size: usize,
) -> Result<(), CryptoError> {
    let prefix: [u8; 8] = rand::random();
    writer.write_all(MAGIC)?;
    writer.write_all(&key.check_value())?;
    writer.write_all(&prefix)?;

    let cipher = key.cipher();
    let mut current = vec![0u8; chunk_size];
    let mut next = vec![0u8; chunk_size];
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut counter: u32 = 0;
    loop {
        let next_len = read_full(&mut reader, &mut next)?;
        let flag = if next_len == 0 { FLAG_LAST } else { FLAG_MORE };
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce(&prefix, counter)),
                Payload {
                    msg: &current[..current_len],
                    aad: &[flag],
                },
            )
            .map_err(|_| CryptoError::Corrupt("encryption failed".to_string()))?;
        let len = u32::try_from(sealed.len())
            .map_err(|_| CryptoError::Corrupt("frame too large".to_string()))?;
        writer.write_all(&[flag])?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&sealed)?;
        if flag == FLAG_LAST {
            return Ok(());
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::Corrupt("input too large".to_string()))?;
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }
}

fn open<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    key: &ArchiveKey,
) -> Result<(), CryptoError> {
    let mut magic = [0u8; 8];
    read_exact_or_corrupt(&mut reader, &mut magic, "header")?;
    if &magic != MAGIC {
        return Err(CryptoError::Corrupt("not a runforge archive".to_string()));
    }
    let mut check = [0u8; 32];
    read_exact_or_corrupt(&mut reader, &mut check, "header")?;
    if check != key.check_value() {
        return Err(CryptoError::CredentialMismatch);
    }
    let mut prefix = [0u8; 8];
    read_exact_or_corrupt(&mut reader, &mut prefix, "header")?;

    let cipher = key.cipher();
    let mut counter: u32 = 0;
    loop {
        let mut head = [0u8; 5];
        read_exact_or_corrupt(&mut reader, &mut head, "frame header")?;
        let flag = head[0];
        if flag != FLAG_MORE && flag != FLAG_LAST {
            return Err(CryptoError::Corrupt(format!("bad frame flag {flag}")));
        }
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if len < TAG_LEN || len > CHUNK_SIZE + TAG_LEN {
            return Err(CryptoError::Corrupt(format!("bad frame length {len}")));
        }
        let mut sealed = vec![0u8; len];
        read_exact_or_corrupt(&mut reader, &mut sealed, "frame")?;
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce(&prefix, counter)),
                Payload {
                    msg: &sealed,
                    aad: &[flag],
                },
            )
            .map_err(|_| CryptoError::Corrupt(format!("frame {counter} failed authentication")))?;
        writer.write_all(&plain)?;
        if flag == FLAG_LAST {
            break;
        }
        counter = counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::Corrupt("too many frames".to_string()))?;
    }

    let mut trailing = [0u8; 1];
    if reader.read(&mut trailing)? != 0 {
        return Err(CryptoError::Corrupt(
            "unexpected data after final frame".to_string(),
        ));
    }
    Ok(())
}

fn nonce(prefix: &[u8; 8], counter: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..8].copy_from_slice(prefix);
    out[8..].copy_from_slice(&counter.to_be_bytes());
    out
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn read_exact_or_corrupt<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), CryptoError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CryptoError::Corrupt(format!("archive truncated in {what}"))
        } else {
            CryptoError::Io(err)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(data: &[u8], key: &ArchiveKey, chunk_size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        seal(data, &mut out, key, chunk_size).expect("seal");
        out
    }

    fn opened(data: &[u8], key: &ArchiveKey) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        open(data, &mut out, key)?;
        Ok(out)
    }

    #[test]
    fn key_derivation_is_stable_and_redacted() {
        let a = ArchiveKey::derive("alice", "secret");
        assert_eq!(a, ArchiveKey::derive("alice", "secret"));
        assert_ne!(a, ArchiveKey::derive("alice", "Secret"));
        assert_ne!(a, ArchiveKey::derive("alic", "e:secret"));
        assert_eq!(format!("{a:?}"), "ArchiveKey(<redacted>)");
    }

    #[test]
    fn seals_across_chunk_boundaries() {
        let key = ArchiveKey::derive("u", "p");
        for len in [0usize, 1, 15, 16, 17, 48, 100] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let out = sealed(&data, &key, 16);
            assert_eq!(opened(&out, &key).expect("open"), data, "len {len}");
        }
    }

    #[test]
    fn wrong_key_is_a_credential_mismatch() {
        let out = sealed(b"payload", &ArchiveKey::derive("u", "p"), 16);
        let err = opened(&out, &ArchiveKey::derive("u", "q")).unwrap_err();
        assert!(matches!(err, CryptoError::CredentialMismatch));
    }

    #[test]
    fn truncation_and_tampering_are_corruption() {
        let key = ArchiveKey::derive("u", "p");
        let out = sealed(&[7u8; 40], &key, 16);

        // Drop the final frame entirely: the stream now ends on a non-final frame.
        let last_frame_len = 1 + 4 + 8 + TAG_LEN;
        let truncated = &out[..out.len() - last_frame_len];
        assert!(matches!(
            opened(truncated, &key).unwrap_err(),
            CryptoError::Corrupt(_)
        ));

        let mut tampered = out.clone();
        let idx = tampered.len() - 3;
        tampered[idx] ^= 0xff;
        assert!(matches!(
            opened(&tampered, &key).unwrap_err(),
            CryptoError::Corrupt(_)
        ));

        let mut trailing = out.clone();
        trailing.push(0);
        assert!(matches!(
            opened(&trailing, &key).unwrap_err(),
            CryptoError::Corrupt(_)
        ));

        assert!(matches!(
            opened(b"garbage!", &key).unwrap_err(),
            CryptoError::Corrupt(_)
        ));
    }

    #[test]
    fn encrypt_file_renames_part_into_place() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("run.tar.gz");
        let enc = temp.path().join("run.tar.gz.enc");
        let back = temp.path().join("back.tar.gz");
        let data = vec![42u8; CHUNK_SIZE + 10];
        fs::write(&src, &data).expect("write");
        let key = ArchiveKey::derive("u", "p");

        encrypt_file(&src, &enc, &key).expect("encrypt");
        assert!(enc.exists());
        assert!(!part_path(&enc).exists());

        decrypt_file(&enc, &back, &key).expect("decrypt");
        assert_eq!(fs::read(&back).expect("read"), data);

        let err = decrypt_file(&enc, &back, &ArchiveKey::derive("u", "x")).unwrap_err();
        assert!(matches!(err, CryptoError::CredentialMismatch));
        assert!(!back.exists());
    }
}
