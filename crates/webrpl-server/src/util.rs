use chrono::Utc;

use getrandom::fill;

/// Alphabet for OTP and participation codes.
pub const CODE_ALPHABET: &[u8; 62] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn random_bytes(len: usize) -> Result<Vec<u8>, getrandom::Error> {
    let mut out = vec![0u8; len];
    fill(&mut out)?;
    Ok(out)
}

pub fn hex_encode(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

/// Draw `len` characters uniformly from `alphabet` using the OS CSPRNG.
///
/// Bytes at or above the largest multiple of the alphabet size are discarded, so every
/// symbol has exactly the same probability.
pub fn random_code(alphabet: &[u8], len: usize) -> Result<String, getrandom::Error> {
    debug_assert!(!alphabet.is_empty() && alphabet.len() <= 256);
    let limit = 256 - (256 % alphabet.len());

    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        fill(&mut buf)?;
        for &b in buf.iter() {
            if (b as usize) < limit {
                out.push(alphabet[b as usize % alphabet.len()] as char);
                if out.len() == len {
                    break;
                }
            }
        }
    }
    Ok(out)
}

pub fn generate_user_id() -> Result<String, getrandom::Error> {
    // 128-bit random id, hex-encoded.
    Ok(hex_encode(&random_bytes(16)?))
}

/// Loose email syntax check: one `@`, non-empty local part, dotted domain, no whitespace.
pub fn is_email_valid(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_code_uses_only_alphabet() {
        let code = random_code(CODE_ALPHABET, 128).unwrap();
        assert_eq!(code.len(), 128);
        assert!(code.bytes().all(|c| CODE_ALPHABET.contains(&c)));
    }

    #[test]
    fn random_code_honours_requested_length() {
        assert_eq!(random_code(CODE_ALPHABET, 0).unwrap(), "");
        assert_eq!(random_code(CODE_ALPHABET, 4).unwrap().len(), 4);
        assert_eq!(random_code(b"ab", 65).unwrap().len(), 65);
    }

    #[test]
    fn email_validation() {
        assert!(is_email_valid("a@b.com"));
        assert!(is_email_valid("first.last@sub.example.org"));
        assert!(!is_email_valid("kuuun"));
        assert!(!is_email_valid(""));
        assert!(!is_email_valid("a@b"));
        assert!(!is_email_valid("a b@c.com"));
        assert!(!is_email_valid("@c.com"));
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
        assert_eq!(generate_user_id().unwrap().len(), 32);
    }
}
