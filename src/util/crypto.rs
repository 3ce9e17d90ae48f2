use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

/// Length in bytes of generated shared access keys
pub const KEY_LEN: usize = 32;

pub fn sha256_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Sha256::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

pub fn hmac_sha256_base64(key: &[u8], data: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    STANDARD.encode(mac.finalize().into_bytes())
}

pub fn random_key(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    STANDARD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_digest_is_stable() {
        assert_eq!(
            sha256_hex_digest(b"leaf"),
            "9f91161f43433e49a6de6db680d79f60159f2e4ac9172621a12846428158440b"
        );
    }

    #[test]
    fn hmac_signature_matches_known_vector() {
        // RFC 4231 test case 2
        let sig = hmac_sha256_base64(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(sig, "W9zBRr9gdU5qBCQmCJV1x1oAPwidJzmDnexYuWTsOEM=");
    }

    #[test]
    fn random_keys_differ() {
        assert_ne!(random_key(KEY_LEN), random_key(KEY_LEN));
    }
}
