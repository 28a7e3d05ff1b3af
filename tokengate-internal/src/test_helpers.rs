//! Shared helpers for unit tests: RS256 keypair generation and access-key
//! signing, mirroring how the external issuer mints credentials.

use std::sync::OnceLock;

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::json;

pub struct TestCredential<'a> {
    pub sub: &'a str,
    pub jti: &'a str,
    pub quota: Option<u64>,
    pub email: Option<&'a str>,
    /// Negative values mint an already-expired credential.
    pub ttl_secs: i64,
}

static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();

/// Returns `(private_pem, public_pem)`. Key generation is slow, so the pair
/// is shared across the whole test binary.
pub fn test_keypair() -> (String, String) {
    KEYPAIR
        .get_or_init(|| {
            let private_key =
                RsaPrivateKey::new(&mut OsRng, 2048).expect("failed to generate RSA key");
            let public_key = RsaPublicKey::from(&private_key);
            let private_pem = private_key
                .to_pkcs1_pem(LineEnding::LF)
                .expect("failed to encode private key")
                .to_string();
            let public_pem = public_key
                .to_pkcs1_pem(LineEnding::LF)
                .expect("failed to encode public key");
            (private_pem, public_pem)
        })
        .clone()
}

pub fn sign_access_key(private_pem: &str, credential: &TestCredential<'_>) -> String {
    let exp = Utc::now().timestamp() + credential.ttl_secs;
    let claims = json!({
        "sub": credential.sub,
        "jti": credential.jti,
        "exp": exp,
        "email": credential.email,
        "quota": credential.quota,
    });
    encode(
        &Header::new(Algorithm::RS256),
        &claims,
        &EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("invalid test private key"),
    )
    .expect("failed to sign test access key")
}
