use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{DerSignature, SigningKey as EcSigningKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pss, RsaPrivateKey};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::errors::{ErrorContext, TradingError, TradingResult};

pub const ACCESS_KEY_HEADER: &str = "KALSHI-ACCESS-KEY";
pub const ACCESS_SIGNATURE_HEADER: &str = "KALSHI-ACCESS-SIGNATURE";
pub const ACCESS_TIMESTAMP_HEADER: &str = "KALSHI-ACCESS-TIMESTAMP";

/// RSA-PSS salt length in bytes, equal to the SHA-256 digest length.
const PSS_SALT_LEN: usize = 32;

#[derive(Debug)]
enum KeyMaterial {
    Rsa(Box<RsaPrivateKey>),
    Ec(Box<EcSigningKey>),
}

/// Request signer for the exchange API.
///
/// Loads a PEM-encoded private key and signs requests per the exchange's
/// scheme: the signing string is `{timestamp_ms}{METHOD}{path}` with query
/// parameters stripped from the path, signed with RSA-PSS (MGF1-SHA256,
/// salt length 32). EC P-256 keys are accepted as a fallback and signed
/// with ECDSA-SHA256, though the exchange documentation is RSA-only.
///
/// Private key material is never logged and never appears in errors.
#[derive(Debug)]
pub struct ExchangeAuth {
    pub api_key_id: String,
    key: KeyMaterial,
}

impl ExchangeAuth {
    pub fn new(api_key_id: &str, private_key_pem: &str) -> TradingResult<Self> {
        let key = load_key(private_key_pem)?;

        match &key {
            KeyMaterial::Rsa(_) => {
                info!(key_id_prefix = %key_id_prefix(api_key_id), key_type = "RSA", "Auth initialized");
            }
            KeyMaterial::Ec(_) => {
                warn!(
                    key_id_prefix = %key_id_prefix(api_key_id),
                    "EC key detected — the exchange documents RSA keys only. \
                     ECDSA signing may not be accepted; if authentication fails, \
                     regenerate an RSA key pair."
                );
            }
        }

        Ok(ExchangeAuth {
            api_key_id: api_key_id.to_string(),
            key,
        })
    }

    pub fn key_type(&self) -> &'static str {
        match self.key {
            KeyMaterial::Rsa(_) => "RSA",
            KeyMaterial::Ec(_) => "EC",
        }
    }

    /// The exact byte string that gets signed: timestamp, uppercased method,
    /// then the path cut at the first '?'.
    pub fn signing_string(method: &str, path: &str, timestamp_ms: i64) -> String {
        let signing_path = path.split('?').next().unwrap_or(path);
        format!("{}{}{}", timestamp_ms, method.to_uppercase(), signing_path)
    }

    /// Generate the four authentication headers for a request.
    ///
    /// The path must carry its full signing prefix (`/trade-api/v2/...` for
    /// REST, `/trade-api/ws/v2` for the WebSocket handshake).
    pub fn sign_request(&self, method: &str, path: &str) -> TradingResult<Vec<(String, String)>> {
        self.sign_request_at(method, path, Utc::now().timestamp_millis())
    }

    pub fn sign_request_at(
        &self,
        method: &str,
        path: &str,
        timestamp_ms: i64,
    ) -> TradingResult<Vec<(String, String)>> {
        let message = Self::signing_string(method, path, timestamp_ms);
        let signature = self.sign_bytes(message.as_bytes())?;

        Ok(vec![
            (ACCESS_KEY_HEADER.to_string(), self.api_key_id.clone()),
            (ACCESS_SIGNATURE_HEADER.to_string(), BASE64.encode(signature)),
            (ACCESS_TIMESTAMP_HEADER.to_string(), timestamp_ms.to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ])
    }

    fn sign_bytes(&self, message: &[u8]) -> TradingResult<Vec<u8>> {
        match &self.key {
            KeyMaterial::Rsa(key) => {
                let digest = Sha256::digest(message);
                let padding = Pss::new_with_salt::<Sha256>(PSS_SALT_LEN);
                key.sign_with_rng(&mut rand::thread_rng(), padding, &digest)
                    .map_err(|e| TradingError::AuthFailure {
                        message: format!("RSA-PSS signing failed: {}", e),
                        context: ErrorContext::new(),
                    })
            }
            KeyMaterial::Ec(key) => {
                let signature: DerSignature = key.sign(message);
                Ok(signature.as_bytes().to_vec())
            }
        }
    }
}

fn load_key(pem: &str) -> TradingResult<KeyMaterial> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(KeyMaterial::Rsa(Box::new(key)));
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
        return Ok(KeyMaterial::Rsa(Box::new(key)));
    }
    if let Ok(key) = EcSigningKey::from_pkcs8_pem(pem) {
        return Ok(KeyMaterial::Ec(Box::new(key)));
    }
    if let Ok(secret) = p256::SecretKey::from_sec1_pem(pem) {
        return Ok(KeyMaterial::Ec(Box::new(EcSigningKey::from(secret))));
    }

    Err(TradingError::AuthFailure {
        message: "Invalid private key format (expected RSA or EC PEM)".to_string(),
        context: ErrorContext::new(),
    })
}

fn key_id_prefix(api_key_id: &str) -> String {
    let prefix: String = api_key_id.chars().take(8).collect();
    format!("{}...", prefix)
}
