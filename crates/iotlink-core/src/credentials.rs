use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::SigningError;

/// Default lifetime of a session token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

const PEM_LINE_WIDTH: usize = 64;

/// Opaque signing capability backed by the device key collaborator.
///
/// Implementations may live in a hardware keystore; the core never sees key material.
pub trait Signer: Send + Sync {
    /// JWS algorithm the signature is produced with (RS256 or ES256).
    fn algorithm(&self) -> Algorithm;

    /// Signs `message` and returns the raw signature bytes.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Signer over a private key held in memory as PEM.
#[derive(Clone)]
pub struct PemSigner {
    key: EncodingKey,
    algorithm: Algorithm,
}

impl PemSigner {
    pub fn rsa(pem: &[u8]) -> Result<Self, SigningError> {
        Ok(Self {
            key: EncodingKey::from_rsa_pem(pem)?,
            algorithm: Algorithm::RS256,
        })
    }

    pub fn ec(pem: &[u8]) -> Result<Self, SigningError> {
        Ok(Self {
            key: EncodingKey::from_ec_pem(pem)?,
            algorithm: Algorithm::ES256,
        })
    }

    /// Accepts either an RSA or a P-256 key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, SigningError> {
        Self::rsa(pem).or_else(|_| Self::ec(pem))
    }
}

impl fmt::Debug for PemSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemSigner")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl Signer for PemSigner {
    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        let encoded = jsonwebtoken::crypto::sign(message, &self.key, self.algorithm)?;
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|err| SigningError::Encoding(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// Mints a session token for `audience` (the cloud project id) valid for `valid_for`.
pub fn issue_token(
    audience: &str,
    signer: &dyn Signer,
    valid_for: Duration,
) -> Result<String, SigningError> {
    issue_token_at(audience, signer, valid_for, Utc::now())
}

pub fn issue_token_at(
    audience: &str,
    signer: &dyn Signer,
    valid_for: Duration,
    now: DateTime<Utc>,
) -> Result<String, SigningError> {
    let issued_at = now.timestamp();
    let lifetime = i64::try_from(valid_for.as_secs()).unwrap_or(i64::MAX);
    let claims = TokenClaims {
        iat: issued_at,
        exp: issued_at.saturating_add(lifetime),
        aud: audience.to_string(),
    };
    let header = Header::new(signer.algorithm());

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
    );
    let signature = signer.sign(signing_input.as_bytes())?;
    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Key collaborator output: a signer plus the DER certificate attesting its public key.
#[derive(Clone)]
pub struct DeviceCredentials {
    pub signer: Arc<dyn Signer>,
    pub certificate: Vec<u8>,
}

impl DeviceCredentials {
    pub fn new(signer: Arc<dyn Signer>, certificate: Vec<u8>) -> Self {
        Self {
            signer,
            certificate,
        }
    }

    /// Builds credentials from a private key PEM and a certificate PEM.
    pub fn from_pem(key_pem: &[u8], certificate_pem: &str) -> Result<Self, SigningError> {
        let signer = PemSigner::from_pem(key_pem)?;
        let certificate = decode_certificate_pem(certificate_pem)?;
        Ok(Self::new(Arc::new(signer), certificate))
    }

    pub fn certificate_pem(&self) -> String {
        let body = STANDARD.encode(&self.certificate);
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for line in body.as_bytes().chunks(PEM_LINE_WIDTH) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("algorithm", &self.signer.algorithm())
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

fn decode_certificate_pem(pem: &str) -> Result<Vec<u8>, SigningError> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(SigningError::Encoding("certificate PEM has no body".into()));
    }
    STANDARD
        .decode(body)
        .map_err(|err| SigningError::Encoding(format!("certificate PEM: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    const RSA_KEY: &[u8] = include_bytes!("../tests/fixtures/rsa_private.pem");
    const RSA_PUBLIC: &[u8] = include_bytes!("../tests/fixtures/rsa_public.pem");
    const RSA_CERT: &str = include_str!("../tests/fixtures/rsa_cert.pem");
    const EC_KEY: &[u8] = include_bytes!("../tests/fixtures/ec_private.pem");
    const EC_PUBLIC: &[u8] = include_bytes!("../tests/fixtures/ec_public.pem");

    struct LockedKey;

    impl Signer for LockedKey {
        fn algorithm(&self) -> Algorithm {
            Algorithm::RS256
        }

        fn sign(&self, _message: &[u8]) -> Result<Vec<u8>, SigningError> {
            Err(SigningError::Unavailable("key is locked".into()))
        }
    }

    fn validation(alg: Algorithm, audience: &str) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_audience(&[audience]);
        validation
    }

    #[test]
    fn rsa_token_verifies_with_public_key() {
        let signer = PemSigner::rsa(RSA_KEY).expect("rsa key");
        let token = issue_token("my-project", &signer, DEFAULT_TOKEN_TTL).expect("token");

        let decoded = jsonwebtoken::decode::<TokenClaims>(
            &token,
            &DecodingKey::from_rsa_pem(RSA_PUBLIC).expect("public key"),
            &validation(Algorithm::RS256, "my-project"),
        )
        .expect("valid token");
        assert_eq!(decoded.claims.aud, "my-project");
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 3600);
        assert_eq!(decoded.header.alg, Algorithm::RS256);
    }

    #[test]
    fn ec_key_is_detected_from_pem() {
        let signer = PemSigner::from_pem(EC_KEY).expect("ec key");
        assert_eq!(signer.algorithm(), Algorithm::ES256);

        let token = issue_token("proj", &signer, Duration::from_secs(600)).expect("token");
        let decoded = jsonwebtoken::decode::<TokenClaims>(
            &token,
            &DecodingKey::from_ec_pem(EC_PUBLIC).expect("public key"),
            &validation(Algorithm::ES256, "proj"),
        )
        .expect("valid token");
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 600);
    }

    #[test]
    fn issued_at_follows_supplied_clock() {
        let signer = PemSigner::rsa(RSA_KEY).expect("rsa key");
        let now = DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp");
        let token =
            issue_token_at("proj", &signer, Duration::from_secs(60), now).expect("token");

        let mut validation = validation(Algorithm::RS256, "proj");
        validation.validate_exp = false;
        let decoded = jsonwebtoken::decode::<TokenClaims>(
            &token,
            &DecodingKey::from_rsa_pem(RSA_PUBLIC).expect("public key"),
            &validation,
        )
        .expect("token decodes");
        assert_eq!(decoded.claims.iat, 1_700_000_000);
        assert_eq!(decoded.claims.exp, 1_700_000_060);
    }

    #[test]
    fn unusable_signer_surfaces_signing_error() {
        let err = issue_token("proj", &LockedKey, DEFAULT_TOKEN_TTL).unwrap_err();
        assert!(matches!(err, SigningError::Unavailable(_)));
    }

    #[test]
    fn certificate_round_trips_through_pem() {
        let creds = DeviceCredentials::from_pem(RSA_KEY, RSA_CERT).expect("credentials");
        let pem = creds.certificate_pem();

        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(pem.lines().all(|line| line.len() <= 64));
        assert_eq!(decode_certificate_pem(&pem).expect("decode"), creds.certificate);
    }

    #[test]
    fn empty_certificate_is_rejected() {
        let err = DeviceCredentials::from_pem(RSA_KEY, "").unwrap_err();
        assert!(matches!(err, SigningError::Encoding(_)));
    }
}
