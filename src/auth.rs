//! Basic and Digest access authentication against a pre-supplied
//! account table.
//!
//! Digest nonces are server-issued opaque strings kept in a bounded
//! LRU ledger; a nonce expires after a short validity window and its
//! `nc` counter must be strictly monotonic, which is what defeats
//! replays.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lru::LruCache;
use parking_lot::Mutex;

use crate::request::RequestHead;

const NONCE_WINDOW: Duration = Duration::from_secs(300);
const NONCE_LEDGER_SIZE: usize = 1024;

/// How clients must authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    #[default]
    None,
    Basic,
    DigestAccess,
}

struct NonceEntry {
    issued: Instant,
    last_nc: Option<u32>,
}

/// Validates credentials for every request on a server that has
/// authentication enabled.
pub(crate) struct Authenticator {
    method: AuthMethod,
    realm: String,
    accounts: HashMap<String, String>,
    nonces: Mutex<LruCache<String, NonceEntry>>,
}

impl Authenticator {
    pub(crate) fn new(
        method: AuthMethod,
        realm: String,
        accounts: HashMap<String, String>,
    ) -> Option<Authenticator> {
        if method == AuthMethod::None {
            return None;
        }
        Some(Authenticator {
            method,
            realm,
            accounts,
            nonces: Mutex::new(LruCache::new(
                NonZeroUsize::new(NONCE_LEDGER_SIZE).unwrap(),
            )),
        })
    }

    /// Check the request's credentials. On failure the error carries
    /// the `WWW-Authenticate` challenge to send with the 401.
    pub(crate) fn check(&self, head: &RequestHead) -> Result<(), String> {
        let authorization = head.header("authorization");
        let ok = match self.method {
            AuthMethod::None => true,
            AuthMethod::Basic => authorization
                .and_then(|v| v.strip_prefix("Basic "))
                .map(|v| self.check_basic(v.trim()))
                .unwrap_or(false),
            AuthMethod::DigestAccess => authorization
                .and_then(|v| v.strip_prefix("Digest "))
                .map(|v| self.check_digest(v, head.method.as_str()))
                .unwrap_or(false),
        };
        if ok {
            Ok(())
        } else {
            Err(self.challenge())
        }
    }

    fn challenge(&self) -> String {
        match self.method {
            AuthMethod::Basic | AuthMethod::None => {
                format!("Basic realm=\"{}\"", self.realm)
            }
            AuthMethod::DigestAccess => {
                let nonce = self.issue_nonce();
                format!(
                    "Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\"",
                    self.realm, nonce
                )
            }
        }
    }

    /// Mint a fresh nonce and remember it in the ledger.
    pub(crate) fn issue_nonce(&self) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        self.nonces.lock().put(
            nonce.clone(),
            NonceEntry {
                issued: Instant::now(),
                last_nc: None,
            },
        );
        nonce
    }

    fn check_basic(&self, encoded: &str) -> bool {
        let Ok(decoded) = BASE64.decode(encoded) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, password)) = decoded.split_once(':') else {
            return false;
        };
        match self.accounts.get(user) {
            Some(secret) => ct_eq(secret.as_bytes(), password.as_bytes()),
            None => false,
        }
    }

    fn check_digest(&self, params: &str, method: &str) -> bool {
        let params = parse_digest_params(params);
        let (Some(username), Some(realm), Some(nonce), Some(uri), Some(response)) = (
            params.get("username"),
            params.get("realm"),
            params.get("nonce"),
            params.get("uri"),
            params.get("response"),
        ) else {
            return false;
        };
        if realm != &self.realm {
            return false;
        }
        if let Some(algorithm) = params.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return false;
            }
        }
        let Some(secret) = self.accounts.get(username) else {
            return false;
        };

        // The nonce must be one we issued, still inside its window.
        // With qop the nonce count must strictly increase.
        let qop = params.get("qop");
        let mut ledger = self.nonces.lock();
        let expired = match ledger.get(nonce) {
            None => return false,
            Some(entry) => entry.issued.elapsed() > NONCE_WINDOW,
        };
        if expired {
            ledger.pop(nonce);
            return false;
        }
        let Some(entry) = ledger.get_mut(nonce) else {
            return false;
        };
        let nc = match qop {
            Some(q) if q == "auth" => {
                let Some(nc_hex) = params.get("nc") else {
                    return false;
                };
                let Ok(nc) = u32::from_str_radix(nc_hex, 16) else {
                    return false;
                };
                if entry.last_nc.map_or(false, |last| nc <= last) {
                    return false;
                }
                Some(nc)
            }
            Some(_) => return false,
            None => None,
        };

        let ha1 = md5_hex(&format!("{username}:{realm}:{secret}"));
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let expected = match qop {
            Some(_) => {
                let nc_hex = params.get("nc").map(|s| s.as_str()).unwrap_or("");
                let cnonce = match params.get("cnonce") {
                    Some(c) => c,
                    None => return false,
                };
                md5_hex(&format!("{ha1}:{nonce}:{nc_hex}:{cnonce}:auth:{ha2}"))
            }
            None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
        };

        if !ct_eq(expected.as_bytes(), response.to_ascii_lowercase().as_bytes()) {
            return false;
        }
        if let Some(nc) = nc {
            entry.last_nc = Some(nc);
        }
        true
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

// Byte comparison without an early exit on the first mismatch.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Split `k="v", k=v, ...` respecting quoted values.
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after_key = after_key.trim_start();
        let (value, remainder) = if let Some(stripped) = after_key.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => (&stripped[..end], &stripped[end + 1..]),
                None => (stripped, ""),
            }
        } else {
            match after_key.find(',') {
                Some(end) => (&after_key[..end], &after_key[end..]),
                None => (after_key, ""),
            }
        };
        params.insert(key, value.trim().to_string());
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }
    params
}
