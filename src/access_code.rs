//! Access-code generation and hashing.
//!
//! Codes are the single bearer secret identifying a user. They are shown
//! once at issuance and only a peppered SHA-256 digest is ever stored.

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

/// 32-symbol alphabet without the visually ambiguous 0/O/1/I.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Development-only pepper. Real deployments must set `CODE_PEPPER`.
pub const DEFAULT_PEPPER: &str = "local-dev-pepper";

/// Generates a fresh access code: four hyphen-separated groups of four
/// symbols, drawn from a CSPRNG.
pub fn generate_access_code() -> String {
    let mut rng = OsRng;
    let chunk = |rng: &mut OsRng| -> String {
        (0..4)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    };
    let chunks: Vec<String> = (0..4).map(|_| chunk(&mut rng)).collect();
    chunks.join("-")
}

/// Canonical form of a presented code: uppercased with everything outside
/// `[A-Z0-9]` stripped, so pasted codes survive stray hyphens, spaces and
/// lowercase.
pub fn normalize_code(code: &str) -> String {
    code.to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

/// Hex SHA-256 over `pepper:normalized_code`. The pepper keeps a leaked
/// hash table resistant to offline dictionary attacks.
pub fn hash_code(pepper: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(b":");
    hasher.update(normalize_code(code).as_bytes());
    hex::encode(hasher.finalize())
}

/// Non-secret trailing fragment shown so users can recognize their code
/// ("ends in ABCD").
pub fn code_hint(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    chars[chars.len().saturating_sub(4)..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_has_expected_shape() {
        let code = generate_access_code();
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), 4);
        for group in groups {
            assert_eq!(group.len(), 4);
            assert!(group.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn consecutive_codes_differ() {
        // Statistical, not a strict invariant; 16 symbols over a
        // 32-character alphabet makes a collision astronomically unlikely.
        assert_ne!(generate_access_code(), generate_access_code());
    }

    #[test]
    fn normalization_strips_noise_and_uppercases() {
        assert_eq!(normalize_code("aa-bb 11"), "AABB11");
        assert_eq!(normalize_code("ABCD-EFGH-JKLM-NPQR"), "ABCDEFGHJKLMNPQR");
        assert_eq!(normalize_code("  ab cd !?"), "ABCD");
        assert_eq!(normalize_code(""), "");
    }

    #[test]
    fn hashing_is_deterministic_and_format_insensitive() {
        assert_eq!(
            hash_code("pepper", "ab-cd-12-34"),
            hash_code("pepper", "ABCD1234")
        );
        assert_ne!(hash_code("pepper", "ABCD1234"), hash_code("other", "ABCD1234"));
        assert_ne!(hash_code("pepper", "ABCD1234"), hash_code("pepper", "ABCD1235"));
    }

    #[test]
    fn hint_is_last_four_characters() {
        assert_eq!(code_hint("ABCD-EFGH-JKLM-NPQR"), "NPQR");
        assert_eq!(code_hint("XY"), "XY");
    }
}
