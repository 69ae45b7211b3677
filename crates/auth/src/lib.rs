use std::collections::HashMap;

use sha2::Digest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Registry of trusted peers: identity (key fingerprint) to the SHA-256
/// digest of the peer's channel token. The transport-level key exchange is
/// outside this crate; presenting a token whose digest matches the book is
/// what makes a sender identity "verified" here.
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    peers: HashMap<String, String>,
}

impl PeerBook {
    pub fn new() -> Self {
        PeerBook {
            peers: HashMap::new(),
        }
    }

    pub fn insert(&mut self, identity: impl Into<String>, token: &str) {
        self.peers.insert(identity.into(), token_digest(token));
    }

    pub fn insert_digest(&mut self, identity: impl Into<String>, digest: impl Into<String>) {
        self.peers.insert(identity.into(), digest.into());
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Lines of `identity = <64 lowercase hex>`; `#` comments and blank
    /// lines are skipped.
    pub fn parse(contents: &str) -> Result<Self, AuthError> {
        let mut book = PeerBook::new();

        for (idx, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (identity, digest) = line.split_once('=').ok_or_else(|| AuthError {
                code: "ERR_PEERS_FILE_PARSE",
                message: format!("invalid peers line {} (expected IDENTITY = DIGEST)", idx + 1),
            })?;

            let identity = identity.trim();
            let digest = digest.trim();
            if identity.is_empty() || !is_lower_hex_64(digest) {
                return Err(AuthError {
                    code: "ERR_PEERS_FILE_PARSE",
                    message: format!(
                        "invalid peers line {} (digest must be 64 lowercase hex chars)",
                        idx + 1
                    ),
                });
            }

            book.peers.insert(identity.to_string(), digest.to_string());
        }

        Ok(book)
    }

    pub fn load(path: &str) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path).map_err(|_| AuthError {
            code: "ERR_PEERS_FILE_READ",
            message: format!("failed to read peers file at {}", path),
        })?;
        Self::parse(&contents)
    }

    /// Verifies a presented identity+token pair against the book.
    pub fn verify(&self, identity: &str, token: &str) -> Result<String, AuthError> {
        let expected = self.peers.get(identity).ok_or_else(|| AuthError {
            code: "ERR_UNKNOWN_PEER",
            message: format!("peer `{}` is not registered", identity),
        })?;

        if token_digest(token) != *expected {
            return Err(AuthError {
                code: "ERR_PEER_TOKEN_MISMATCH",
                message: format!("token presented by `{}` does not verify", identity),
            });
        }

        Ok(identity.to_string())
    }
}

pub fn token_digest(token: &str) -> String {
    hex::encode(sha2::Sha256::digest(token.as_bytes()))
}

fn is_lower_hex_64(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 64 {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_registered_peer_with_matching_token() {
        let mut book = PeerBook::new();
        book.insert("fp_alice", "alice-secret");
        assert_eq!(
            book.verify("fp_alice", "alice-secret").unwrap(),
            "fp_alice"
        );
    }

    #[test]
    fn verify_rejects_unknown_peer_and_wrong_token() {
        let mut book = PeerBook::new();
        book.insert("fp_alice", "alice-secret");

        let err = book.verify("fp_bob", "whatever").unwrap_err();
        assert_eq!(err.code, "ERR_UNKNOWN_PEER");

        let err = book.verify("fp_alice", "wrong").unwrap_err();
        assert_eq!(err.code, "ERR_PEER_TOKEN_MISMATCH");
    }

    #[test]
    fn parse_reads_peers_file_and_rejects_bad_digests() {
        let contents = format!(
            "# trusted peers\nfp_alice = {}\n\nfp_bob = {}\n",
            token_digest("a"),
            token_digest("b")
        );
        let book = PeerBook::parse(&contents).unwrap();
        assert!(book.verify("fp_alice", "a").is_ok());
        assert!(book.verify("fp_bob", "b").is_ok());

        let err = PeerBook::parse("fp_alice = nothex").unwrap_err();
        assert_eq!(err.code, "ERR_PEERS_FILE_PARSE");
    }
}
