//! HTTP-Digest authentication (RFC 2617) for DESCRIBE requests.
//!
//! The server keeps a user/secret table ([`AuthDatabase`]) and a
//! per-connection [`DigestContext`] holding the realm and nonce of the most
//! recent challenge. A request authenticates when its
//! `Authorization: Digest` response matches the MD5 computation of
//! RFC 2617 §3.2.2 over the stored credential; anything else earns a fresh
//! challenge with a new random nonce.
//!
//! Secrets may be stored either as plaintext passwords or as precomputed
//! `MD5(username:realm:password)` values so that the cleartext never has to
//! live in the server's memory.

use std::collections::HashMap;
use std::fmt::Write as _;

use parking_lot::RwLock;
use rand::RngCore;

/// Realm used when the host application does not pick one.
pub const DEFAULT_REALM: &str = "Streaming Media Server";

/// A user/secret table plus the realm it belongs to.
pub struct AuthDatabase {
    realm: String,
    passwords_are_md5: bool,
    users: RwLock<HashMap<String, String>>,
}

impl AuthDatabase {
    /// Create a database of plaintext passwords for `realm`.
    pub fn new(realm: &str) -> Self {
        AuthDatabase {
            realm: realm.to_string(),
            passwords_are_md5: false,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Create a database whose stored secrets are precomputed
    /// `MD5(username:realm:password)` hex digests.
    pub fn with_hashed_passwords(realm: &str) -> Self {
        AuthDatabase {
            passwords_are_md5: true,
            ..Self::new(realm)
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn passwords_are_md5(&self) -> bool {
        self.passwords_are_md5
    }

    /// Add (or overwrite) a user record.
    pub fn add_user(&self, username: &str, secret: &str) {
        self.users
            .write()
            .insert(username.to_string(), secret.to_string());
    }

    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
    }

    pub fn lookup_secret(&self, username: &str) -> Option<String> {
        self.users.read().get(username).cloned()
    }
}

/// Per-connection digest state: the realm and nonce of the challenge the
/// client is expected to answer.
///
/// A connection starts with no nonce, so the first authenticated request
/// always fails and triggers a challenge; this is the normal RFC 2617
/// handshake.
#[derive(Default)]
pub struct DigestContext {
    realm: Option<String>,
    nonce: Option<String>,
}

impl DigestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Install a fresh random nonce for `realm`, invalidating any response
    /// computed against the previous one.
    pub fn regenerate(&mut self, realm: &str) {
        self.realm = Some(realm.to_string());
        self.nonce = Some(random_nonce());
    }
}

/// 128 bits from the OS CSPRNG, hex-encoded.
fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(32), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Compute the digest response of RFC 2617 §3.2.2 (no qop):
/// `MD5(HA1 ":" nonce ":" MD5(method ":" uri))` where `HA1` is
/// `MD5(username ":" realm ":" password)`, or the stored digest itself when
/// the database holds precomputed hashes.
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    secret: &str,
    secret_is_md5: bool,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = if secret_is_md5 {
        secret.to_string()
    } else {
        md5_hex(&format!("{username}:{realm}:{secret}"))
    };
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_lookup() {
        let db = AuthDatabase::new("R");
        db.add_user("alice", "s3cret");
        assert_eq!(db.lookup_secret("alice").as_deref(), Some("s3cret"));
        assert_eq!(db.lookup_secret("bob"), None);

        db.remove_user("alice");
        assert_eq!(db.lookup_secret("alice"), None);
    }

    #[test]
    fn nonce_is_fresh_and_well_formed() {
        let mut ctx = DigestContext::new();
        assert!(ctx.nonce().is_none());

        ctx.regenerate("R");
        let first = ctx.nonce().unwrap().to_string();
        assert_eq!(first.len(), 32);
        assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));

        ctx.regenerate("R");
        assert_ne!(ctx.nonce().unwrap(), first);
    }

    #[test]
    fn digest_matches_rfc2617_reference() {
        // The worked example from RFC 2069 §2.4 / RFC 2617 §3.5, reduced to
        // the no-qop computation this server performs.
        let response = compute_digest_response(
            "Mufasa",
            "testrealm@host.com",
            "CircleOfLife",
            false,
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
        );
        assert_eq!(response, "1949323746fe6a43ef61f9606e7febea");
    }

    #[test]
    fn precomputed_ha1_matches_plaintext() {
        let ha1 = format!("{:x}", md5::compute("alice:R:s3cret"));
        let from_password =
            compute_digest_response("alice", "R", "s3cret", false, "abc", "DESCRIBE", "rtsp://h/s");
        let from_hash =
            compute_digest_response("alice", "R", &ha1, true, "abc", "DESCRIBE", "rtsp://h/s");
        assert_eq!(from_password, from_hash);
    }
}
