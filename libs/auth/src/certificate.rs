use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;
use sha1::{Digest, Sha1};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AuthError;

const ASSERTION_LIFETIME_SECS: i64 = 600;

/// X.509 client credential: signs client assertions with the private key and
/// identifies the certificate by its SHA-1 thumbprint.
pub struct CertificateCredential {
    thumbprint: String,
    chain: Vec<String>,
    key: EncodingKey,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    iat: i64,
    exp: i64,
}

impl CertificateCredential {
    pub fn from_files(pem_file: impl AsRef<Path>, key_file: impl AsRef<Path>) -> Result<Self, AuthError> {
        let pem_file = pem_file.as_ref();
        let key_file = key_file.as_ref();
        let certificate = std::fs::read_to_string(pem_file).map_err(|err| {
            AuthError::InvalidConfiguration(format!(
                "cannot read certificate {}: {err}",
                pem_file.display()
            ))
        })?;
        let key = std::fs::read(key_file).map_err(|err| {
            AuthError::InvalidConfiguration(format!(
                "cannot read private key {}: {err}",
                key_file.display()
            ))
        })?;
        Self::from_pem(&certificate, &key)
    }

    pub fn from_pem(certificate_pem: &str, key_pem: &[u8]) -> Result<Self, AuthError> {
        let chain = pem_blocks(certificate_pem, "CERTIFICATE")?;
        let Some(leaf) = chain.first() else {
            return Err(AuthError::InvalidConfiguration(
                "certificate file contains no CERTIFICATE block".into(),
            ));
        };
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha1::digest(leaf));
        let key = EncodingKey::from_rsa_pem(key_pem).map_err(|err| {
            AuthError::InvalidConfiguration(format!("invalid RSA private key: {err}"))
        })?;
        Ok(Self {
            thumbprint,
            chain: chain.iter().map(|der| STANDARD.encode(der)).collect(),
            key,
        })
    }

    /// Base64url SHA-1 of the leaf certificate, sent as `x5t`.
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Signed RS256 client assertion for `audience` (the token endpoint).
    pub fn client_assertion(
        &self,
        client_id: &str,
        audience: &str,
        send_x5c: bool,
    ) -> Result<String, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = AssertionClaims {
            aud: audience,
            iss: client_id,
            sub: client_id,
            jti: Uuid::new_v4().to_string(),
            nbf: now,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.x5t = Some(self.thumbprint.clone());
        if send_x5c {
            header.x5c = Some(self.chain.clone());
        }
        encode(&header, &claims, &self.key)
            .map_err(|err| AuthError::TokenAcquisition(format!("cannot sign client assertion: {err}")))
    }
}

impl std::fmt::Debug for CertificateCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCredential")
            .field("thumbprint", &self.thumbprint)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

fn pem_blocks(pem: &str, label: &str) -> Result<Vec<Vec<u8>>, AuthError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(&begin) {
        let after = &rest[start + begin.len()..];
        let Some(stop) = after.find(&end) else {
            return Err(AuthError::InvalidConfiguration(format!(
                "unterminated {label} block"
            )));
        };
        let body: String = after[..stop]
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect();
        let der = STANDARD.decode(body).map_err(|err| {
            AuthError::InvalidConfiguration(format!("invalid base64 in {label} block: {err}"))
        })?;
        blocks.push(der);
        rest = &after[stop + end.len()..];
    }
    Ok(blocks)
}
