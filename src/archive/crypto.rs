// src/archive/crypto.rs

//! Payload file encryption
//!
//! Files are encrypted in the format written by
//! `openssl enc -aes-256-cbc -salt`: the magic `Salted__`, an 8-byte
//! salt, then AES-256-CBC ciphertext with PKCS#7 padding. Key and IV come
//! from OpenSSL's `EVP_BytesToKey` with MD5 and a single iteration, so
//! `openssl enc -d -aes-256-cbc -md md5` decrypts these files.

use crate::error::{Error, Result};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use md5::{Digest, Md5};
use rand::RngCore;
use std::fs;
use std::io::{self, BufRead, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Leading marker of a salted file
pub const MAGIC: &[u8; 8] = b"Salted__";

const SALT_LEN: usize = 8;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN;
const BLOCK_LEN: usize = 16;

/// Passphrase attempts before giving up on a file
pub const MAX_PASSPHRASE_ATTEMPTS: u32 = 3;

/// Where decryption passphrases come from
pub trait PassphraseSource {
    /// Passphrase for attempt `attempt` (starting at 1)
    fn passphrase(&mut self, attempt: u32) -> Result<String>;

    /// Called after a passphrase decrypted a file
    fn accepted(&mut self, _passphrase: &str) {}
}

/// A passphrase given up front (command line or config)
#[derive(Debug, Clone)]
pub struct FixedPassphrase(pub String);

impl PassphraseSource for FixedPassphrase {
    fn passphrase(&mut self, _attempt: u32) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads passphrases from the terminal, remembering the last good one
#[derive(Debug, Default)]
pub struct PromptPassphrase {
    cached: Option<String>,
}

impl PassphraseSource for PromptPassphrase {
    fn passphrase(&mut self, attempt: u32) -> Result<String> {
        if attempt == 1
            && let Some(cached) = &self.cached
        {
            return Ok(cached.clone());
        }

        let mut stderr = io::stderr();
        write!(stderr, "Passphrase: ")?;
        stderr.flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn accepted(&mut self, passphrase: &str) {
        self.cached = Some(passphrase.to_string());
    }
}

/// OpenSSL `EVP_BytesToKey` (MD5, one round) for a 32-byte key and 16-byte IV
fn derive_key_iv(passphrase: &[u8], salt: &[u8]) -> ([u8; 32], [u8; 16]) {
    let mut material = Vec::with_capacity(48);
    let mut previous: Vec<u8> = Vec::new();

    while material.len() < 48 {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(passphrase);
        hasher.update(salt);
        previous = hasher.finalize().to_vec();
        material.extend_from_slice(&previous);
    }

    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&material[..32]);
    iv.copy_from_slice(&material[32..48]);
    (key, iv)
}

/// Encrypt with a caller-chosen salt
pub fn encrypt_with_salt(plaintext: &[u8], passphrase: &str, salt: [u8; SALT_LEN]) -> Vec<u8> {
    let (key, iv) = derive_key_iv(passphrase.as_bytes(), &salt);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ciphertext);
    out
}

/// Encrypt with a random salt
pub fn encrypt_bytes(plaintext: &[u8], passphrase: &str) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    encrypt_with_salt(plaintext, passphrase, salt)
}

/// Decrypt; a bad header or length is corruption, bad padding is a wrong passphrase
pub fn decrypt_bytes(data: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    if !is_encrypted(data) {
        return Err(Error::CorruptEncryptedFile("missing salt header".to_string()));
    }
    let body = &data[HEADER_LEN..];
    if body.is_empty() || body.len() % BLOCK_LEN != 0 {
        return Err(Error::CorruptEncryptedFile(format!(
            "ciphertext length {} is not a positive multiple of {}",
            body.len(),
            BLOCK_LEN
        )));
    }

    let (key, iv) = derive_key_iv(passphrase.as_bytes(), &data[MAGIC.len()..HEADER_LEN]);
    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| Error::PassphraseError("bad decrypt".to_string()))
}

/// Whether `data` starts with the salted header
pub fn is_encrypted(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data.starts_with(MAGIC)
}

/// Replace a file's contents atomically, keeping its mode and ownership
fn replace_contents(path: &Path, contents: &[u8]) -> Result<()> {
    let original = fs::metadata(path)
        .map_err(|e| Error::IoError(format!("Failed to stat {}: {}", path.display(), e)))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| Error::IoError(format!("Failed to create temp file in {}: {}", dir.display(), e)))?;
    tmp.write_all(contents)?;
    tmp.flush()?;

    fs::set_permissions(tmp.path(), original.permissions())?;
    if let Err(e) = std::os::unix::fs::chown(tmp.path(), Some(original.uid()), Some(original.gid())) {
        warn!("Failed to preserve ownership of {}: {}", path.display(), e);
    }

    tmp.persist(path)
        .map_err(|e| Error::IoError(format!("Failed to replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Encrypt a file in place
pub fn encrypt_file(path: &Path, passphrase: &str) -> Result<()> {
    let plaintext = fs::read(path)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
    replace_contents(path, &encrypt_bytes(&plaintext, passphrase))?;
    debug!("Encrypted {}", path.display());
    Ok(())
}

/// Decrypt a file in place, asking `source` up to three times
pub fn decrypt_file(path: &Path, source: &mut dyn PassphraseSource) -> Result<()> {
    let data = fs::read(path)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?;

    for attempt in 1..=MAX_PASSPHRASE_ATTEMPTS {
        let passphrase = source.passphrase(attempt)?;
        match decrypt_bytes(&data, &passphrase) {
            Ok(plaintext) => {
                source.accepted(&passphrase);
                replace_contents(path, &plaintext)?;
                debug!("Decrypted {}", path.display());
                return Ok(());
            }
            Err(Error::PassphraseError(_)) => {
                warn!("Incorrect passphrase for {} (attempt {})", path.display(), attempt);
            }
            Err(Error::CorruptEncryptedFile(msg)) => {
                return Err(Error::CorruptEncryptedFile(format!("{}: {}", path.display(), msg)));
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::PassphraseError(format!(
        "Unable to decrypt {} after {} attempts",
        path.display(),
        MAX_PASSPHRASE_ATTEMPTS
    )))
}
