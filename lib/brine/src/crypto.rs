use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_xchacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_xchacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_xchacha20poly1305_IETF_NPUBBYTES as usize;

pub const EXCHANGE_KEY_SIZE: usize = libsodium_sys::crypto_scalarmult_curve25519_BYTES as usize;
pub const SIGN_PUBLIC_KEY_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_SECRET_KEY_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;
pub const SIGNATURE_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;
pub const HASH_SIZE: usize = 32;
pub const ONETIMEAUTH_SIZE: usize = libsodium_sys::crypto_onetimeauth_BYTES as usize;
pub const ONETIMEAUTH_KEY_SIZE: usize = libsodium_sys::crypto_onetimeauth_KEYBYTES as usize;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Encrypts the provided plain text into the cipher buffer. The encrypted message size will be the
/// plain text size plus the MAC size (16 bytes). The function will fail if the cipher slice is not
/// exactly plain length plus MAC length.
///
/// The additional data, nonce and key must match those used during decryption, the decryption will
/// fail otherwise.
#[inline]
pub fn encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Encryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_xchacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the provided ciphertext into the plain buffer. The decoded message size is equal to
/// the cipher text length minus the MAC (16 bytes). The function will fail if the sizes do not
/// match or the authentication tag does not verify.
#[inline]
pub fn decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Decryption: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_xchacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Derives a 32 byte subkey from a 32 byte key with HChaCha20 and a zero input block.
#[inline]
pub fn derive_key(key: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let input = [0u8; 16];
    let mut out = [0u8; KEY_SIZE];

    unsafe {
        if libsodium_sys::crypto_core_hchacha20(
            out.as_mut_ptr(),
            input.as_ptr(),
            key.as_ptr(),
            ::std::ptr::null(),
        ) != 0
        {
            panic!("Subkey derivation failed")
        }
    }

    out
}

/// Generates a fresh X25519 key pair as (secret, public).
#[inline]
pub fn exchange_keypair() -> ([u8; EXCHANGE_KEY_SIZE], [u8; EXCHANGE_KEY_SIZE]) {
    let mut secret = [0u8; EXCHANGE_KEY_SIZE];
    let mut public = [0u8; EXCHANGE_KEY_SIZE];

    random_bytes(&mut secret);

    unsafe {
        if libsodium_sys::crypto_scalarmult_curve25519_base(public.as_mut_ptr(), secret.as_ptr()) != 0 {
            panic!("Exchange key generation failed")
        }
    }

    (secret, public)
}

/// Computes the X25519 shared secret between a local secret key and a remote public key.
/// Returns false for degenerate public keys.
#[inline]
pub fn exchange(
    shared: &mut [u8; EXCHANGE_KEY_SIZE],
    secret: &[u8; EXCHANGE_KEY_SIZE],
    public: &[u8; EXCHANGE_KEY_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_scalarmult_curve25519(
            shared.as_mut_ptr(),
            secret.as_ptr(),
            public.as_ptr(),
        ) == 0
    }
}

/// Generates a fresh Ed25519 signing key pair as (secret, public).
#[inline]
pub fn sign_keypair() -> ([u8; SIGN_SECRET_KEY_SIZE], [u8; SIGN_PUBLIC_KEY_SIZE]) {
    let mut secret = [0u8; SIGN_SECRET_KEY_SIZE];
    let mut public = [0u8; SIGN_PUBLIC_KEY_SIZE];

    unsafe {
        if libsodium_sys::crypto_sign_keypair(public.as_mut_ptr(), secret.as_mut_ptr()) != 0 {
            panic!("Signing key generation failed")
        }
    }

    (secret, public)
}

/// Produces a detached Ed25519 signature over the message.
#[inline]
pub fn sign(message: &[u8], secret: &[u8; SIGN_SECRET_KEY_SIZE]) -> [u8; SIGNATURE_SIZE] {
    let mut signature = [0u8; SIGNATURE_SIZE];

    unsafe {
        if libsodium_sys::crypto_sign_detached(
            signature.as_mut_ptr(),
            ::std::ptr::null_mut(),
            message.as_ptr(),
            message.len() as u64,
            secret.as_ptr(),
        ) != 0
        {
            panic!("Signing failed")
        }
    }

    signature
}

/// Verifies a detached Ed25519 signature over the message.
#[inline]
pub fn sign_verify(
    signature: &[u8; SIGNATURE_SIZE],
    message: &[u8],
    public: &[u8; SIGN_PUBLIC_KEY_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            signature.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            public.as_ptr(),
        ) == 0
    }
}

/// Hashes the input into a 32 byte BLAKE2b digest.
#[inline]
pub fn hash(out: &mut [u8; HASH_SIZE], input: &[u8]) {
    unsafe {
        if libsodium_sys::crypto_generichash(
            out.as_mut_ptr(),
            HASH_SIZE,
            input.as_ptr(),
            input.len() as u64,
            ::std::ptr::null(),
            0,
        ) != 0
        {
            panic!("Hashing failed")
        }
    }
}

/// One shot Poly1305 authenticator over the message.
#[inline]
pub fn onetimeauth(message: &[u8], key: &[u8; ONETIMEAUTH_KEY_SIZE]) -> [u8; ONETIMEAUTH_SIZE] {
    let mut out = [0u8; ONETIMEAUTH_SIZE];

    unsafe {
        if libsodium_sys::crypto_onetimeauth(
            out.as_mut_ptr(),
            message.as_ptr(),
            message.len() as u64,
            key.as_ptr(),
        ) != 0
        {
            panic!("Authenticator computation failed")
        }
    }

    out
}

/// Verifies a one shot Poly1305 authenticator in constant time.
#[inline]
pub fn onetimeauth_verify(
    auth: &[u8; ONETIMEAUTH_SIZE],
    message: &[u8],
    key: &[u8; ONETIMEAUTH_KEY_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_onetimeauth_verify(
            auth.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            key.as_ptr(),
        ) == 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Returns a random 64 bit value.
#[inline]
pub fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    random_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
}

/// Compares two equally sized byte slices in constant time.
#[inline]
pub fn memcmp(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    unsafe {
        libsodium_sys::sodium_memcmp(
            a.as_ptr() as *const ::std::ffi::c_void,
            b.as_ptr() as *const ::std::ffi::c_void,
            a.len(),
        ) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        random_bytes(&mut key);
        key
    }

    fn random_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        random_bytes(&mut nonce);
        nonce
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = random_key();
        let nonce = random_nonce();
        let plain = b"attack at dawn";
        let ad = b"header";

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain[..], &ad[..], &nonce, &key));

        let mut decoded = vec![0u8; plain.len()];
        assert!(decrypt(&mut decoded, &cipher, &ad[..], &nonce, &key));
        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn test_decrypt_rejects_mutations() {
        let key = random_key();
        let nonce = random_nonce();
        let plain = b"attack at dawn";
        let ad = b"header";

        let mut cipher = vec![0u8; plain.len() + MAC_SIZE];
        assert!(encrypt(&mut cipher, &plain[..], &ad[..], &nonce, &key));

        let mut decoded = vec![0u8; plain.len()];

        // Flip one bit in every position of the ciphertext (body and tag alike)
        for i in 0..cipher.len() {
            let mut mutated = cipher.clone();
            mutated[i] ^= 1;
            assert!(!decrypt(&mut decoded, &mutated, &ad[..], &nonce, &key));
        }

        // Mutated nonce
        let mut bad_nonce = nonce;
        bad_nonce[0] ^= 1;
        assert!(!decrypt(&mut decoded, &cipher, &ad[..], &bad_nonce, &key));

        // Mutated additional data
        assert!(!decrypt(&mut decoded, &cipher, &b"zeader"[..], &nonce, &key));
    }

    #[test]
    fn test_exchange_agreement() {
        let (a_secret, a_public) = exchange_keypair();
        let (b_secret, b_public) = exchange_keypair();

        let mut ab = [0u8; EXCHANGE_KEY_SIZE];
        let mut ba = [0u8; EXCHANGE_KEY_SIZE];

        assert!(exchange(&mut ab, &a_secret, &b_public));
        assert!(exchange(&mut ba, &b_secret, &a_public));
        assert_eq!(ab, ba);

        assert_eq!(derive_key(&ab), derive_key(&ba));
        assert_ne!(derive_key(&ab), ab);
    }

    #[test]
    fn test_sign_verify() {
        let (secret, public) = sign_keypair();
        let message = b"short term keys";

        let signature = sign(&message[..], &secret);
        assert!(sign_verify(&signature, &message[..], &public));
        assert!(!sign_verify(&signature, &b"other message"[..], &public));

        let mut mutated = signature;
        mutated[0] ^= 1;
        assert!(!sign_verify(&mutated, &message[..], &public));
    }

    #[test]
    fn test_hash_stable() {
        let mut first = [0u8; HASH_SIZE];
        let mut second = [0u8; HASH_SIZE];

        hash(&mut first, b"challenge");
        hash(&mut second, b"challenge");
        assert_eq!(first, second);

        hash(&mut second, b"challengf");
        assert_ne!(first, second);
    }

    #[test]
    fn test_onetimeauth_roundtrip() {
        let mut key = [0u8; ONETIMEAUTH_KEY_SIZE];
        random_bytes(&mut key);

        let auth = onetimeauth(b"acknowledge", &key);
        assert!(onetimeauth_verify(&auth, b"acknowledge", &key));
        assert!(!onetimeauth_verify(&auth, b"acknowledgf", &key));
    }

    #[test]
    fn test_memcmp() {
        assert!(memcmp(b"equal", b"equal"));
        assert!(!memcmp(b"equal", b"difff"));
        assert!(!memcmp(b"equal", b"longer"));
    }
}
