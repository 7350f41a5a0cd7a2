//! Signature and payload cryptography for device authentication

use super::AuthError;
use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES-128 key and IV length taken from the product secret
pub const PRODUCT_KEY_MATERIAL_LEN: usize = 16;

/// Identity claims covered by a signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInput<'a> {
    pub auth_type: u8,
    pub device_name: &'a str,
    pub random_num: u32,
    pub product_key: &'a str,
    pub timestamp_ms: i64,
}

/// Canonical string the broker and the registration service both sign
pub fn sign_content(input: &SignInput<'_>) -> String {
    format!(
        "auth_type={}&device_name={}&random_num={}&product_key={}&timestamp={}",
        input.auth_type, input.device_name, input.random_num, input.product_key, input.timestamp_ms
    )
}

/// Base64 HMAC-SHA256 of `content` keyed by `secret`
pub fn hmac_sha256_base64(secret: &str, content: &str) -> Result<String, AuthError> {
    if secret.is_empty() {
        return Err(AuthError::MissingField("secret"));
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AuthError::Signing(e.to_string()))?;
    mac.update(content.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Sign identity claims with `secret`
pub fn sign(secret: &str, input: &SignInput<'_>) -> Result<String, AuthError> {
    if input.product_key.is_empty() {
        return Err(AuthError::MissingField("product_key"));
    }
    if input.device_name.is_empty() {
        return Err(AuthError::MissingField("device_name"));
    }
    hmac_sha256_base64(secret, &sign_content(input))
}

/// Decrypt the `payload` returned by dynamic registration.
///
/// The payload is base64 AES-128-CBC with PKCS#7 padding; key and IV are both
/// the first 16 bytes of the product secret. The plaintext is cut to `len`.
pub fn decrypt_registration_payload(
    product_secret: &str,
    payload_b64: &str,
    len: usize,
) -> Result<String, AuthError> {
    let key_material = product_secret.as_bytes();
    if key_material.len() < PRODUCT_KEY_MATERIAL_LEN {
        return Err(AuthError::Decrypt(format!(
            "product secret shorter than {PRODUCT_KEY_MATERIAL_LEN} bytes"
        )));
    }
    let key = &key_material[..PRODUCT_KEY_MATERIAL_LEN];

    let ciphertext = STANDARD
        .decode(payload_b64.trim())
        .map_err(|e| AuthError::MalformedResponse(format!("payload is not base64: {e}")))?;

    let decryptor = Aes128CbcDec::new_from_slices(key, key)
        .map_err(|e| AuthError::Decrypt(e.to_string()))?;
    let mut plaintext = decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|e| AuthError::Decrypt(e.to_string()))?;

    if len > plaintext.len() {
        return Err(AuthError::MalformedResponse(format!(
            "declared length {len} exceeds decrypted length {}",
            plaintext.len()
        )));
    }
    plaintext.truncate(len);

    String::from_utf8(plaintext)
        .map_err(|_| AuthError::Decrypt("decrypted secret is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_content_layout() {
        let input = SignInput {
            auth_type: 0,
            device_name: "P1-9",
            random_num: 123456,
            product_key: "6788bd810f9bad3f8ef674fa",
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(
            sign_content(&input),
            "auth_type=0&device_name=P1-9&random_num=123456&product_key=6788bd810f9bad3f8ef674fa&timestamp=1700000000000"
        );
    }

    #[test]
    fn test_device_secret_signature() {
        let input = SignInput {
            auth_type: 0,
            device_name: "P1-9",
            random_num: 123456,
            product_key: "6788bd810f9bad3f8ef674fa",
            timestamp_ms: 1_700_000_000_000,
        };
        let signature = sign("98cb52e94e437ee407dbed37", &input).unwrap();
        assert_eq!(signature, "mXlB3wtseUjh4CsXEdXwa75FK2gu4ZNF3cAzOZkw0qM=");
    }

    #[test]
    fn test_registration_signature() {
        let input = SignInput {
            auth_type: 2,
            device_name: "P1-9",
            random_num: 42,
            product_key: "6788bd810f9bad3f8ef674fa",
            timestamp_ms: 1_736_000_000_000,
        };
        let signature = sign("84d2917973026d49be374ec4", &input).unwrap();
        assert_eq!(signature, "TZ5S7s1itRg95rvX2KZ08EUPKMWcCpbwjwqbxaRqNNw=");
    }

    #[test]
    fn test_missing_inputs() {
        let input = SignInput {
            auth_type: 0,
            device_name: "",
            random_num: 1,
            product_key: "pk",
            timestamp_ms: 1,
        };
        assert!(matches!(
            sign("secret", &input),
            Err(AuthError::MissingField("device_name"))
        ));
        assert!(matches!(
            hmac_sha256_base64("", "content"),
            Err(AuthError::MissingField("secret"))
        ));
    }

    #[test]
    fn test_decrypt_registration_payload() {
        let secret = decrypt_registration_payload(
            "84d2917973026d49be374ec4",
            "Kg/hy+SdiBzWE80q3deSlx5PIaPv3OVo6z2rk/nvoiQ=",
            24,
        )
        .unwrap();
        assert_eq!(secret, "98cb52e94e437ee407dbed37");
    }

    #[test]
    fn test_decrypt_rejects_bad_input() {
        assert!(matches!(
            decrypt_registration_payload("short", "AAAA", 4),
            Err(AuthError::Decrypt(_))
        ));
        assert!(matches!(
            decrypt_registration_payload("84d2917973026d49be374ec4", "not base64!", 4),
            Err(AuthError::MalformedResponse(_))
        ));
        assert!(matches!(
            decrypt_registration_payload(
                "84d2917973026d49be374ec4",
                "Kg/hy+SdiBzWE80q3deSlx5PIaPv3OVo6z2rk/nvoiQ=",
                64
            ),
            Err(AuthError::MalformedResponse(_))
        ));
    }
}
