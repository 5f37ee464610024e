use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-parley-signature";
const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    Missing,
    #[error("signature header is malformed")]
    Malformed,
    #[error("signature does not match the request body")]
    Mismatch,
}

/// HMAC-SHA256 over the raw request body, sent as `sha256=<hex>`.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: SecretString,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC takes keys of any length, so construction cannot fail.
        match HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts keys of any length"),
        }
    }

    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(body);
        format!("{SIGNATURE_PREFIX}{:x}", mac.finalize().into_bytes())
    }

    pub fn verify(&self, body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        let header = header.map(str::trim).filter(|value| !value.is_empty());
        let header = header.ok_or(SignatureError::Missing)?;
        let digest = header.strip_prefix(SIGNATURE_PREFIX).ok_or(SignatureError::Malformed)?;
        let expected = decode_hex(digest).ok_or(SignatureError::Malformed)?;

        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
    }
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(value.get(index..index + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{SignatureError, SignatureVerifier};

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SecretString::from("shared-secret".to_string()))
    }

    #[test]
    fn signed_body_verifies() {
        let verifier = verifier();
        let body = br#"{"correlation_id":"evt-1"}"#;
        let signature = verifier.sign(body);
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert_eq!(verifier.verify(body, Some(&signature)), Ok(()));
    }

    #[test]
    fn tampered_missing_and_malformed_signatures_are_rejected() {
        let verifier = verifier();
        let signature = verifier.sign(b"original");

        assert_eq!(verifier.verify(b"tampered", Some(&signature)), Err(SignatureError::Mismatch));
        assert_eq!(verifier.verify(b"original", None), Err(SignatureError::Missing));
        assert_eq!(verifier.verify(b"original", Some("  ")), Err(SignatureError::Missing));
        assert_eq!(verifier.verify(b"original", Some("md5=abcd")), Err(SignatureError::Malformed));
        assert_eq!(verifier.verify(b"original", Some("sha256=zz")), Err(SignatureError::Malformed));
    }
}
