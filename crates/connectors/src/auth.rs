//! HTTP authentication for connector requests.
//!
//! Basic credentials are attached up front. Digest credentials need the
//! server's challenge, so the first request goes out bare and is repeated
//! with an `Authorization` header when the server answers 401.

use md5::Md5;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Credentials from a descriptor's `auth` block.
///
/// Accepts `{"auth_type": "basic"|"digest", "username", "password"}` as well
/// as the flat `basic_username` / `digest_username` spelling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawAuth")]
pub enum HttpAuth {
    Basic { username: String, password: String },
    Digest { username: String, password: String },
}

#[derive(Deserialize)]
struct RawAuth {
    auth_type: Option<String>,
    username: Option<String>,
    password: Option<String>,
    basic_username: Option<String>,
    basic_password: Option<String>,
    digest_username: Option<String>,
    digest_password: Option<String>,
}

impl TryFrom<RawAuth> for HttpAuth {
    type Error = String;

    fn try_from(raw: RawAuth) -> Result<Self, Self::Error> {
        if let Some(username) = raw.basic_username {
            return Ok(HttpAuth::Basic {
                username,
                password: raw.basic_password.unwrap_or_default(),
            });
        }
        if let Some(username) = raw.digest_username {
            return Ok(HttpAuth::Digest {
                username,
                password: raw.digest_password.unwrap_or_default(),
            });
        }

        let username = raw
            .username
            .ok_or_else(|| "auth requires a username".to_string())?;
        let password = raw.password.unwrap_or_default();
        match raw.auth_type.as_deref().unwrap_or("basic") {
            "basic" => Ok(HttpAuth::Basic { username, password }),
            "digest" => Ok(HttpAuth::Digest { username, password }),
            other => Err(format!("unsupported auth_type \"{}\"", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn hash(self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }
}

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop_auth: bool,
    pub algorithm: DigestAlgorithm,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Digest")?.trim_start();

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut algorithm = DigestAlgorithm::Md5;

        for (key, value) in split_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                "algorithm" => {
                    algorithm = match value.to_ascii_uppercase().as_str() {
                        "MD5" => DigestAlgorithm::Md5,
                        "SHA-256" => DigestAlgorithm::Sha256,
                        _ => return None,
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop_auth,
            algorithm,
        })
    }

    /// Header value answering this challenge for one request.
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = self
            .algorithm
            .hash(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = self.algorithm.hash(&format!("{}:{}", method, uri));
        let nc = "00000001";

        let response = if self.qop_auth {
            self.algorithm
                .hash(&format!("{}:{}:{}:{}:auth:{}", ha1, self.nonce, nc, cnonce, ha2))
        } else {
            self.algorithm.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            username,
            self.realm,
            self.nonce,
            uri,
            self.algorithm.name(),
            response
        );
        if self.qop_auth {
            header.push_str(&format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

pub fn generate_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Split `a="x, y", b=z` into pairs, honouring quotes.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                params.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    params.push(current);

    params
        .into_iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_both_auth_spellings() {
        let typed: HttpAuth =
            serde_json::from_value(json!({"auth_type": "digest", "username": "u", "password": "p"}))
                .unwrap();
        assert!(matches!(typed, HttpAuth::Digest { .. }));

        let flat: HttpAuth =
            serde_json::from_value(json!({"basic_username": "u", "basic_password": "p"})).unwrap();
        assert_eq!(
            flat,
            HttpAuth::Basic {
                username: "u".into(),
                password: "p".into()
            }
        );

        assert!(serde_json::from_value::<HttpAuth>(json!({"auth_type": "ntlm", "username": "u"}))
            .is_err());
    }

    #[test]
    fn rfc2617_example_response() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap();
        assert!(challenge.qop_auth);
        assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);

        let header = challenge.authorization(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "0a4f113b",
        );
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn rejects_non_digest_challenge() {
        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_none());
    }
}
