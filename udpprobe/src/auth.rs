// auth.rs - Per-probe authentication tokens
//
// A token is derived deterministically from (sequence, shared secret) so the
// server can recompute it without per-client key state. The default
// XOR/rotate scheme only raises the bar for blind floods; it is not a MAC.
// Building with the `hmac` feature switches the default to truncated
// HMAC-SHA256.
use crate::wire::AUTH_TOKEN_SIZE;

pub type AuthToken = [u8; AUTH_TOKEN_SIZE];

pub const SECRET_SIZE: usize = 16;

/// Shared secret between client and server.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; SECRET_SIZE]);

impl Secret {
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh random secret, used when the server is started without one.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Parses 32 hex digits.
    pub fn from_hex(text: &str) -> Result<Self, AuthError> {
        let text = text.trim();
        if text.len() != SECRET_SIZE * 2 {
            return Err(AuthError::WrongLength {
                expected: SECRET_SIZE * 2,
                actual: text.len(),
            });
        }
        if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AuthError::InvalidHex);
        }
        let mut bytes = [0u8; SECRET_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = text.get(i * 2..i * 2 + 2).ok_or(AuthError::InvalidHex)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| AuthError::InvalidHex)?;
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    WrongLength { expected: usize, actual: usize },
    InvalidHex,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::WrongLength { expected, actual } => {
                write!(f, "Secret must be {} hex digits, got {}", expected, actual)
            }
            AuthError::InvalidHex => write!(f, "Secret is not valid hex"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Derives the token expected for a sequence number.
pub trait TokenScheme: Send + Sync {
    fn derive(&self, sequence: u32) -> AuthToken;

    fn verify(&self, sequence: u32, token: &AuthToken) -> bool {
        self.derive(sequence) == *token
    }

    fn name(&self) -> &'static str;
}

/// Reversible XOR/rotate mix of the sequence into each 32-bit secret word.
#[derive(Debug, Clone)]
pub struct XorRotateScheme {
    words: [u32; 4],
}

impl XorRotateScheme {
    pub fn new(secret: &Secret) -> Self {
        let mut words = [0u32; 4];
        for (i, chunk) in secret.as_bytes().chunks_exact(4).enumerate() {
            words[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { words }
    }
}

impl TokenScheme for XorRotateScheme {
    fn derive(&self, sequence: u32) -> AuthToken {
        let mut token = [0u8; AUTH_TOKEN_SIZE];
        for (i, word) in self.words.iter().enumerate() {
            let shift = (i as u32) * 8 + 5;
            let mixed = (sequence ^ word).rotate_left(shift) ^ word.rotate_right(shift);
            token[i * 4..i * 4 + 4].copy_from_slice(&mixed.to_be_bytes());
        }
        token
    }

    fn name(&self) -> &'static str {
        "xor-rotate"
    }
}

/// HMAC-SHA256 over the big-endian sequence, truncated to the token size.
#[cfg(feature = "hmac")]
pub struct HmacScheme {
    key: ring::hmac::Key,
}

#[cfg(feature = "hmac")]
impl HmacScheme {
    pub fn new(secret: &Secret) -> Self {
        Self {
            key: ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }
}

#[cfg(feature = "hmac")]
impl TokenScheme for HmacScheme {
    fn derive(&self, sequence: u32) -> AuthToken {
        let tag = ring::hmac::sign(&self.key, &sequence.to_be_bytes());
        let mut token = [0u8; AUTH_TOKEN_SIZE];
        token.copy_from_slice(&tag.as_ref()[..AUTH_TOKEN_SIZE]);
        token
    }

    fn verify(&self, sequence: u32, token: &AuthToken) -> bool {
        let expected = self.derive(sequence);
        ring::constant_time::verify_slices_are_equal(&expected, token).is_ok()
    }

    fn name(&self) -> &'static str {
        "hmac-sha256"
    }
}

#[cfg(feature = "hmac")]
impl std::fmt::Debug for HmacScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacScheme")
            .field("algorithm", &"HMAC-SHA256")
            .finish()
    }
}

/// Scheme used by both tools for a configured secret.
pub fn default_scheme(secret: &Secret) -> Box<dyn TokenScheme> {
    #[cfg(feature = "hmac")]
    {
        Box::new(HmacScheme::new(secret))
    }
    #[cfg(not(feature = "hmac"))]
    {
        Box::new(XorRotateScheme::new(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Secret {
        Secret::from_bytes([
            0x10, 0x32, 0x54, 0x76, 0x98, 0xBA, 0xDC, 0xFE, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB,
            0xCD, 0xEF,
        ])
    }

    #[test]
    fn test_token_is_deterministic() {
        let scheme = XorRotateScheme::new(&secret());
        assert_eq!(scheme.derive(42), scheme.derive(42));
        assert!(scheme.verify(42, &scheme.derive(42)));
    }

    #[test]
    fn test_token_depends_on_sequence_and_secret() {
        let scheme = XorRotateScheme::new(&secret());
        assert_ne!(scheme.derive(1), scheme.derive(2));

        let other = XorRotateScheme::new(&Secret::from_bytes([0u8; SECRET_SIZE]));
        assert_ne!(scheme.derive(1), other.derive(1));
        assert!(!other.verify(1, &scheme.derive(1)));
    }

    #[test]
    fn test_secret_hex_parsing() {
        let s = secret();
        assert_eq!(Secret::from_hex(&s.to_hex()), Ok(s));
        assert_eq!(
            Secret::from_hex("abcd"),
            Err(AuthError::WrongLength {
                expected: 32,
                actual: 4
            })
        );
        assert_eq!(
            Secret::from_hex("zz32547698badcfe0123456789abcdef"),
            Err(AuthError::InvalidHex)
        );
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        assert_eq!(format!("{:?}", secret()), "Secret(..)");
    }

    #[cfg(feature = "hmac")]
    #[test]
    fn test_hmac_scheme() {
        let scheme = HmacScheme::new(&secret());
        let token = scheme.derive(7);
        assert!(scheme.verify(7, &token));
        assert!(!scheme.verify(8, &token));
    }
}
