use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// The only digest accepted in the `X-Hub-Signature` header.
pub const SIGNATURE_ALGORITHM: &str = "sha1";

/// The reasons a request can be rejected by [verify].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The rule has a secret, but the request is not signed.
    #[error("request is not signed")]
    MissingSignature,
    /// The request is signed, but the rule has no secret to check it with.
    #[error("request is signed, but no secret is configured")]
    UnexpectedSignature,
    /// The signature is not in the form `<algorithm>=<hex digest>`.
    #[error("signature is malformed")]
    Malformed,
    /// The signature uses a digest other than [SIGNATURE_ALGORITHM].
    #[error("unsupported signature algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    /// The digest does not match the body.
    #[error("signature does not match")]
    Mismatch,
}

/// Check that `raw_body` was signed with `secret`.
///
/// No secret and no signature is accepted, any other half-configured combination
/// is rejected. The digest comparison is constant-time.
pub fn verify(
    secret: Option<&str>,
    raw_body: &[u8],
    signature: Option<&str>,
) -> Result<(), SignatureError> {
    let (secret, signature) = match (secret, signature) {
        (None, None) => return Ok(()),
        (Some(_), None) => return Err(SignatureError::MissingSignature),
        (None, Some(_)) => return Err(SignatureError::UnexpectedSignature),
        (Some(secret), Some(signature)) => (secret, signature),
    };

    let (algorithm, digest) = signature
        .split_once('=')
        .ok_or(SignatureError::Malformed)?;
    if algorithm != SIGNATURE_ALGORITHM {
        return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_string()));
    }
    let digest = hex::decode(digest).map_err(|_| SignatureError::Malformed)?;

    let mut mac = keyed_mac(secret)?;
    mac.update(raw_body);
    mac.verify_slice(&digest)
        .map_err(|_| SignatureError::Mismatch)
}

/// Compute the header value GitHub would send for `raw_body`.
pub fn sign(secret: &str, raw_body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(raw_body);

    Ok(format!(
        "{SIGNATURE_ALGORITHM}={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn keyed_mac(secret: &str) -> Result<HmacSha1, SignatureError> {
    HmacSha1::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Mismatch)
}
