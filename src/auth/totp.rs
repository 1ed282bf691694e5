use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Seconds per TOTP step
pub const STEP_SECONDS: i64 = 30;

/// Digits in a TOTP code
pub const DIGITS: usize = 6;

/// Issuer shown by authenticator apps
pub const ISSUER: &str = "AppLocker";

/// Generate a fresh 160-bit secret, base32 encoded without padding
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    base32::encode(&bytes)
}

/// The code for the step containing `unix_time`
pub fn code_at(secret: &str, unix_time: i64) -> Result<String> {
    let key = base32::decode(secret).context("TOTP secret is not valid base32")?;
    hotp(&key, (unix_time / STEP_SECONDS) as u64)
}

/// Check `code` against the steps within `window` of `unix_time`
///
/// Returns `Ok(false)` for a well-formed secret and a wrong or malformed
/// code; `Err` only if the stored secret itself cannot be decoded.
pub fn verify_at(secret: &str, code: &str, window: u8, unix_time: i64) -> Result<bool> {
    let key = base32::decode(secret).context("TOTP secret is not valid base32")?;

    if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }

    let current = unix_time / STEP_SECONDS;
    let window = i64::from(window);
    let mut matched = false;

    // Every candidate is compared so timing does not reveal which step matched
    for offset in -window..=window {
        let counter = current + offset;
        if counter < 0 {
            continue;
        }
        let expected = hotp(&key, counter as u64)?;
        matched |= bool::from(expected.as_bytes().ct_eq(code.as_bytes()));
    }

    Ok(matched)
}

/// Check `code` against the current time
pub fn verify(secret: &str, code: &str, window: u8) -> Result<bool> {
    verify_at(secret, code, window, chrono::Utc::now().timestamp())
}

/// `otpauth://` URI for enrolling the secret in an authenticator app
pub fn provisioning_uri(secret: &str, identity: &str) -> Result<String> {
    let mut uri = url::Url::parse("otpauth://totp/").context("Failed to build otpauth URI")?;
    uri.set_path(&format!("{}:{}", ISSUER, identity));
    uri.query_pairs_mut()
        .append_pair("secret", secret)
        .append_pair("issuer", ISSUER)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &DIGITS.to_string())
        .append_pair("period", &STEP_SECONDS.to_string());
    Ok(uri.to_string())
}

/// RFC 4226 HOTP with dynamic truncation
fn hotp(key: &[u8], counter: u64) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("Failed to key HMAC-SHA1: {}", e))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    Ok(format!(
        "{:0width$}",
        binary % 10u32.pow(DIGITS as u32),
        width = DIGITS
    ))
}

/// RFC 4648 base32, unpadded on output, padding and case tolerated on input
mod base32 {
    use anyhow::{Result, bail};

    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    pub fn encode(bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
        let mut buffer: u32 = 0;
        let mut bits: u32 = 0;

        for &byte in bytes {
            buffer = (buffer << 8) | u32::from(byte);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
            }
        }

        if bits > 0 {
            out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
        }

        out
    }

    pub fn decode(input: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 5 / 8);
        let mut buffer: u32 = 0;
        let mut bits: u32 = 0;

        for c in input.trim_end_matches('=').chars() {
            if c == ' ' || c == '-' {
                continue;
            }
            let upper = c.to_ascii_uppercase() as u8;
            let Some(value) = ALPHABET.iter().position(|&a| a == upper) else {
                bail!("invalid base32 character {:?}", c);
            };
            buffer = (buffer << 5) | value as u32;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                out.push((buffer >> bits) as u8);
            }
        }

        if out.is_empty() {
            bail!("empty base32 input");
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Base32 of the RFC 6238 SHA-1 seed "12345678901234567890"
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_reference_vectors() {
        assert_eq!(code_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(code_at(RFC_SECRET, 1_111_111_109).unwrap(), "081804");
        assert_eq!(code_at(RFC_SECRET, 1_234_567_890).unwrap(), "005924");
        assert_eq!(code_at(RFC_SECRET, 2_000_000_000).unwrap(), "279037");
    }

    #[test]
    fn base32_encodes_rfc_seed() {
        assert_eq!(base32::encode(b"12345678901234567890"), RFC_SECRET);
        assert_eq!(base32::decode(RFC_SECRET).unwrap(), b"12345678901234567890");
        assert_eq!(
            base32::decode(&RFC_SECRET.to_lowercase()).unwrap(),
            b"12345678901234567890"
        );
    }

    #[test]
    fn base32_rejects_garbage() {
        assert!(base32::decode("not*base32").is_err());
        assert!(base32::decode("").is_err());
    }

    #[test]
    fn window_accepts_adjacent_step_only() {
        let t = 59;
        let code = code_at(RFC_SECRET, t).unwrap();

        // 25 seconds later is the next step, inside a window of 1
        assert!(verify_at(RFC_SECRET, &code, 1, t + 25).unwrap());
        // 95 seconds later is four steps away
        assert!(!verify_at(RFC_SECRET, &code, 1, t + 95).unwrap());
    }

    #[test]
    fn zero_window_requires_same_step() {
        let code = code_at(RFC_SECRET, 59).unwrap();
        assert!(verify_at(RFC_SECRET, &code, 0, 45).unwrap());
        assert!(!verify_at(RFC_SECRET, &code, 0, 61).unwrap());
    }

    #[test]
    fn malformed_codes_do_not_verify() {
        assert!(!verify_at(RFC_SECRET, "28708", 1, 59).unwrap());
        assert!(!verify_at(RFC_SECRET, "28708a", 1, 59).unwrap());
        assert!(!verify_at(RFC_SECRET, "2870820", 1, 59).unwrap());
    }

    #[test]
    fn corrupt_secret_is_an_error() {
        assert!(verify_at("!!!", "123456", 1, 59).is_err());
    }

    #[test]
    fn generated_secrets_are_160_bits() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        assert_eq!(base32::decode(&secret).unwrap().len(), 20);
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn provisioning_uri_names_issuer_and_secret() {
        let uri = provisioning_uri(RFC_SECRET, "parent@example.com").unwrap();
        assert!(uri.starts_with("otpauth://totp/AppLocker:parent@example.com?"));
        assert!(uri.contains(&format!("secret={}", RFC_SECRET)));
        assert!(uri.contains("issuer=AppLocker"));
        assert!(uri.contains("digits=6"));
    }
}
