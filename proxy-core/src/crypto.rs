use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::config::CmsConfig;
use crate::error::{ProxyError, Result};

/// RSA-PKCS#1v1.5-SHA256 verify/sign, behind a pluggable backend so the
/// same call sites work whether the math runs in this process or across an
/// ABI boundary into a foreign library.
pub trait CryptoEngine: Send + Sync {
    /// `false` on a malformed key, a bad signature, or zero-length input.
    fn verify(&self, payload: &[u8], signature: &[u8], public_key_pem: &str) -> bool;

    /// `None` on a malformed key or zero-length payload.
    fn sign(&self, payload: &[u8], private_key_pem: &str) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoEngineKind {
    Native,
    Foreign,
}

impl std::str::FromStr for CryptoEngineKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "native" => Ok(CryptoEngineKind::Native),
            "foreign" => Ok(CryptoEngineKind::Foreign),
            other => Err(format!("unknown crypto engine '{other}', want native or foreign")),
        }
    }
}

/// Loaded once at startup: the selected engine plus the two pieces of key
/// material the core ever needs (§3's "Crypto materials").
pub struct CryptoMaterials {
    engine: Box<dyn CryptoEngine>,
    trust_anchor_pem: Option<String>,
    signing_key_pem: Option<String>,
}

impl CryptoMaterials {
    pub fn load(cfg: &CmsConfig, kind: CryptoEngineKind) -> Result<Self> {
        let trust_anchor_pem = cfg
            .client_trust_store
            .as_deref()
            .map(read_trust_anchor)
            .transpose()?;
        let signing_key_pem = cfg
            .proxy_private_key
            .as_deref()
            .map(|path| {
                std::fs::read_to_string(path)
                    .map_err(|e| ProxyError::Crypto(format!("reading proxy private key '{path}': {e}")))
            })
            .transpose()?;

        let engine: Box<dyn CryptoEngine> = match kind {
            CryptoEngineKind::Native => Box::new(NativeEngine),
            CryptoEngineKind::Foreign => Box::new(ForeignEngine),
        };

        Ok(CryptoMaterials {
            engine,
            trust_anchor_pem,
            signing_key_pem,
        })
    }

    pub fn engine(&self) -> &dyn CryptoEngine {
        self.engine.as_ref()
    }

    pub fn trust_anchor_pem(&self) -> Option<&str> {
        self.trust_anchor_pem.as_deref()
    }

    pub fn signing_key_pem(&self) -> Option<&str> {
        self.signing_key_pem.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn for_test(kind: CryptoEngineKind) -> Self {
        let private = test_key();
        let public = RsaPublicKey::from(&*private);
        let signing_key_pem = (*private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode test private key"))
        .clone();
        let trust_anchor_pem = public
            .to_public_key_pem(LineEnding::LF)
            .expect("encode test public key");
        let engine: Box<dyn CryptoEngine> = match kind {
            CryptoEngineKind::Native => Box::new(NativeEngine),
            CryptoEngineKind::Foreign => Box::new(ForeignEngine),
        };
        CryptoMaterials {
            engine,
            trust_anchor_pem: Some(trust_anchor_pem),
            signing_key_pem: Some(signing_key_pem),
        }
    }
}

/// Read the client trust store and return the PEM-encoded SubjectPublicKeyInfo
/// of its trust anchor. Simplified from the full "first certificate of a CA
/// bundle" contract: this proxy expects the trust store file to already hold
/// the anchor's SPKI public key in PEM form, sidestepping X.509 certificate
/// parsing (no certificate parser is part of the reference stack).
fn read_trust_anchor(path: &str) -> Result<String> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| ProxyError::Crypto(format!("reading client trust store '{path}': {e}")))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| ProxyError::Crypto(format!("parsing client trust store '{path}': {e}")))?;
    Ok(pem)
}

fn load_private_key(pem: &str) -> Option<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .ok()
}

fn load_public_key(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem).ok()
}

#[cfg(test)]
fn test_key() -> std::sync::Arc<RsaPrivateKey> {
    use std::sync::OnceLock;
    static KEY: OnceLock<std::sync::Arc<RsaPrivateKey>> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        std::sync::Arc::new(RsaPrivateKey::new(&mut rng, 2048).expect("generate test RSA key"))
    })
    .clone()
}

/// The `rsa`/`sha2` backend: signing and verification happen in this process.
pub struct NativeEngine;

impl CryptoEngine for NativeEngine {
    fn verify(&self, payload: &[u8], signature: &[u8], public_key_pem: &str) -> bool {
        if payload.is_empty() || signature.is_empty() {
            return false;
        }
        let Some(key) = load_public_key(public_key_pem) else {
            return false;
        };
        let digest = Sha256::digest(payload);
        key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok()
    }

    fn sign(&self, payload: &[u8], private_key_pem: &str) -> Option<Vec<u8>> {
        if payload.is_empty() {
            return None;
        }
        let key = load_private_key(private_key_pem)?;
        let digest = Sha256::digest(payload);
        key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).ok()
    }
}

/// A stand-in for a foreign-library backend: the same verify/sign math,
/// reached through the flat byte-in/byte-out ABI described in the external
/// interfaces, compiled into this same binary rather than a second shared
/// object. The boundary shapes match exactly, so a real FFI library could
/// replace `ffi` without touching `ForeignEngine` or its callers.
pub struct ForeignEngine;

impl CryptoEngine for ForeignEngine {
    fn verify(&self, payload: &[u8], signature: &[u8], public_key_pem: &str) -> bool {
        if payload.is_empty() || signature.is_empty() {
            return false;
        }
        unsafe {
            ffi::verify(
                payload.as_ptr(),
                payload.len(),
                signature.as_ptr(),
                signature.len(),
                public_key_pem.as_ptr(),
                public_key_pem.len(),
            )
        }
    }

    fn sign(&self, payload: &[u8], private_key_pem: &str) -> Option<Vec<u8>> {
        if payload.is_empty() {
            return None;
        }
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let mut out_cap: usize = 0;
        let ok = unsafe {
            ffi::sign(
                payload.as_ptr(),
                payload.len(),
                private_key_pem.as_ptr(),
                private_key_pem.len(),
                &mut out_ptr,
                &mut out_len,
                &mut out_cap,
            )
        };
        if !ok {
            return None;
        }
        let sig = unsafe { std::slice::from_raw_parts(out_ptr, out_len) }.to_vec();
        unsafe { ffi::release(out_ptr, out_len, out_cap) };
        Some(sig)
    }
}

/// The foreign ABI surface itself (§6's "Foreign crypto ABI"): plain
/// `extern "C"` functions operating on raw pointers and lengths, with a
/// paired `release` the caller must invoke once it has copied `sign`'s
/// output into its own memory.
mod ffi {
    use super::{NativeEngine, CryptoEngine};

    /// # Safety
    /// `payload`/`sig`/`pubkey` must point at valid, readable byte ranges of
    /// at least `payload_len`/`sig_len`/`pubkey_len` bytes, and `pubkey` must
    /// be valid UTF-8.
    pub unsafe extern "C" fn verify(
        payload: *const u8,
        payload_len: usize,
        sig: *const u8,
        sig_len: usize,
        pubkey: *const u8,
        pubkey_len: usize,
    ) -> bool {
        let payload = std::slice::from_raw_parts(payload, payload_len);
        let sig = std::slice::from_raw_parts(sig, sig_len);
        let pubkey = std::str::from_utf8_unchecked(std::slice::from_raw_parts(pubkey, pubkey_len));
        NativeEngine.verify(payload, sig, pubkey)
    }

    /// # Safety
    /// `payload`/`privkey` must point at valid, readable byte ranges;
    /// `privkey` must be valid UTF-8. `out_ptr`/`out_len`/`out_cap` must be
    /// valid, writable out-parameters. On success the caller owns the
    /// allocation at `*out_ptr` until it calls [`release`].
    pub unsafe extern "C" fn sign(
        payload: *const u8,
        payload_len: usize,
        privkey: *const u8,
        privkey_len: usize,
        out_ptr: *mut *mut u8,
        out_len: *mut usize,
        out_cap: *mut usize,
    ) -> bool {
        let payload = std::slice::from_raw_parts(payload, payload_len);
        let privkey =
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(privkey, privkey_len));
        match NativeEngine.sign(payload, privkey) {
            Some(mut sig) => {
                *out_ptr = sig.as_mut_ptr();
                *out_len = sig.len();
                *out_cap = sig.capacity();
                std::mem::forget(sig);
                true
            }
            None => false,
        }
    }

    /// # Safety
    /// `ptr`/`len`/`cap` must be exactly the triple most recently returned by
    /// [`sign`] for an allocation not yet released.
    pub unsafe extern "C" fn release(ptr: *mut u8, len: usize, cap: usize) {
        if ptr.is_null() {
            return;
        }
        drop(Vec::from_raw_parts(ptr, len, cap));
    }
}
