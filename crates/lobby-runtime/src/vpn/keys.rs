use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::SigningKey;
use zeroize::Zeroizing;

use lobby_core::vpn::SecretKey;

/// A WireGuard (Curve25519) keypair, base64 encoded.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub public_key: String,
    pub private_key: SecretKey,
}

/// Generate a fresh keypair from the OS RNG.
///
/// The Ed25519 signing key's hashed scalar, clamped, is a valid X25519
/// private key, and the birational map of its verifying key is the matching
/// X25519 public key.
pub fn generate_keypair() -> Keypair {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);

    let mut scalar = Zeroizing::new(signing_key.to_scalar_bytes());
    clamp(&mut scalar);
    let public = signing_key.verifying_key().to_montgomery().to_bytes();

    Keypair {
        public_key: STANDARD.encode(public),
        private_key: SecretKey::new(STANDARD.encode(&scalar[..])),
    }
}

fn clamp(scalar: &mut [u8; 32]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(s: &str) -> Vec<u8> {
        STANDARD.decode(s).unwrap()
    }

    #[test]
    fn test_keys_are_32_bytes_base64() {
        let kp = generate_keypair();
        assert_eq!(kp.public_key.len(), 44);
        assert_eq!(decode(&kp.public_key).len(), 32);
        assert_eq!(decode(kp.private_key.expose()).len(), 32);
    }

    #[test]
    fn test_private_key_is_clamped() {
        for _ in 0..16 {
            let kp = generate_keypair();
            let raw = decode(kp.private_key.expose());
            assert_eq!(raw[0] & 7, 0);
            assert_eq!(raw[31] & 128, 0);
            assert_eq!(raw[31] & 64, 64);
        }
    }

    #[test]
    fn test_public_key_is_x25519_image_of_private() {
        use curve25519_dalek::MontgomeryPoint;

        for _ in 0..8 {
            let kp = generate_keypair();
            let scalar: [u8; 32] = decode(kp.private_key.expose()).try_into().unwrap();
            let public: [u8; 32] = decode(&kp.public_key).try_into().unwrap();
            assert_eq!(
                MontgomeryPoint::mul_base_clamped(scalar),
                MontgomeryPoint(public)
            );
        }
    }

    #[test]
    fn test_keys_are_unique() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_ne!(a.public_key, b.public_key);
        assert_ne!(a.private_key, b.private_key);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let kp = generate_keypair();
        let debug = format!("{:?}", kp);
        assert!(!debug.contains(kp.private_key.expose()));
        assert!(debug.contains(&kp.public_key));
    }
}
