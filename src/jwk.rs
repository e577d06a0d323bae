//! Public JWK export for registering a `private_key_jwt` client.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{traits::PublicKeyParts, RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_KEY_ID: &str = "team-sync-key-1";

#[derive(Debug, Error)]
pub enum JwkError {
    #[error("Not an RSA public or private key in PEM form")]
    UnsupportedKey,

    #[error("Failed to serialize JWKS: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Accepts SPKI or PKCS#1 public keys, and PKCS#8 or PKCS#1 private keys.
fn parse_public_key(pem: &str) -> Result<RsaPublicKey, JwkError> {
    if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
        return Ok(key);
    }
    if let Ok(key) = RsaPublicKey::from_pkcs1_pem(pem) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(key.to_public_key());
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
        return Ok(key.to_public_key());
    }
    Err(JwkError::UnsupportedKey)
}

pub fn public_jwk(pem: &str, kid: &str) -> Result<Jwk, JwkError> {
    let public_key = parse_public_key(pem)?;

    Ok(Jwk {
        kty: "RSA".to_string(),
        kid: kid.to_string(),
        use_: "sig".to_string(),
        alg: "RS256".to_string(),
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    })
}

/// Pretty-printed `{"keys": [...]}` document for the given key.
pub fn jwks_json(pem: &str, kid: &str) -> Result<String, JwkError> {
    let jwks = Jwks {
        keys: vec![public_jwk(pem, kid)?],
    };
    Ok(serde_json::to_string_pretty(&jwks)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    const PRIVATE: &str = include_str!("../tests/fixtures/test_key.pem");
    const PUBLIC: &str = include_str!("../tests/fixtures/test_key.pub.pem");

    #[test]
    fn test_private_and_public_halves_agree() {
        let from_public = public_jwk(PUBLIC, "k1").unwrap();
        let from_private = public_jwk(PRIVATE, "k1").unwrap();

        assert_eq!(from_public, from_private);
        assert_eq!(from_public.kty, "RSA");
        assert_eq!(from_public.e, "AQAB");
    }

    #[test]
    fn test_jwks_document_shape() {
        let json = jwks_json(PUBLIC, DEFAULT_KEY_ID).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let key = &value["keys"][0];
        assert_eq!(key["kid"], DEFAULT_KEY_ID);
        assert_eq!(key["use"], "sig");
        assert_eq!(key["alg"], "RS256");
        assert!(key["n"].as_str().unwrap().len() > 300);
    }

    #[test]
    fn test_jwk_verifies_signed_assertion() {
        let jwk = public_jwk(PUBLIC, "k1").unwrap();
        let signer = crate::token::AssertionSigner::from_pem(
            PRIVATE.as_bytes(),
            Algorithm::RS256,
            Some("k1".into()),
        )
        .unwrap();
        let assertion = signer.sign("client", "aud").unwrap();

        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["aud"]);
        assert!(decode::<crate::token::AssertionClaims>(&assertion, &key, &validation).is_ok());
    }

    #[test]
    fn test_rejects_non_rsa_input() {
        let ec = include_str!("../tests/fixtures/test_ec_key.pem");
        assert!(matches!(public_jwk(ec, "k"), Err(JwkError::UnsupportedKey)));
        assert!(public_jwk("garbage", "k").is_err());
    }
}
