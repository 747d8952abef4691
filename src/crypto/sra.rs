use std::fmt;
use std::sync::OnceLock;

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, RngCore};

use super::{CipherError, CommutativeKey, KeyId, Message, NONCE_SIZE};

/// 1024-bit MODP group prime, RFC 5114 section 2.1
///
/// Not a safe prime: `p - 1` has a 160-bit prime factor, the order of the RFC's subgroup.
const PRIME_HEX: &str = "\
    B10B8F96A080E01DDE92DE5EAE5D54EC52C99FBCFB06A3C69A6A9DCA52D23B61\
    6073E28675A23D189838EF1E2EE652C013ECB4AEA906112324975C3CD49B83BF\
    ACCBDD7D90C4BD7098488E9C219A73724EFFD6FAE5644738FAA31A4FF55BCCC0\
    A151AF5F0DC8B4BD45BF37DF365C1A65E68CFDA76D4DA708DF1FB2BC2E4A4371";

/// Bit length of encryption exponent; decryption exponent must be at least that long
const EXPONENT_BITS: u64 = 160;

/// Layer marker stored in the message. SRA doesn't need a nonce.
const NO_NONCE: [u8; NONCE_SIZE] = [0u8; NONCE_SIZE];

struct Group {
    prime: BigUint,
    totient: BigUint,
    exponent_bound: BigUint,
}

fn group() -> &'static Group {
    static GROUP: OnceLock<Group> = OnceLock::new();
    GROUP.get_or_init(|| {
        let prime = BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16)
            .expect("prime constant is a valid hex number");
        Group {
            totient: &prime - 1u32,
            prime,
            exponent_bound: BigUint::one() << EXPONENT_BITS,
        }
    })
}

/// Public modulus shared by all [`SraKey`]s
pub fn modulus() -> &'static BigUint {
    &group().prime
}

/// Pair of exponents `(k, l)` such that `k * l = 1 (mod p - 1)`
///
/// Encryption computes `m^k mod p`, decryption computes `c^l mod p`. Exponentiation commutes, so
/// layers can be removed in any order.
///
/// Message content is read as a big-endian unsigned integer and written back in minimal
/// big-endian form, so leading zero bytes of plaintext are not preserved.
pub struct SraKey {
    k: BigUint,
    l: BigUint,
    id: KeyId,
}

impl SraKey {
    fn from_exponents(k: BigUint, l: BigUint) -> Self {
        let mut key = Self {
            k,
            l,
            id: KeyId::digest(&[]),
        };
        key.id = KeyId::digest(&key.to_bytes());
        key
    }
}

/// Computes `k^-1 mod m` if it exists
fn mod_inverse(k: &BigUint, m: &BigUint) -> Option<BigUint> {
    let k = BigInt::from(k.clone());
    let m = BigInt::from(m.clone());
    let gcd = k.extended_gcd(&m);
    if !gcd.gcd.is_one() {
        return None;
    }
    gcd.x.mod_floor(&m).to_biguint()
}

impl CommutativeKey for SraKey {
    fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let group = group();
        loop {
            let mut k = rng.gen_biguint_below(&group.exponent_bound);
            k |= BigUint::one() << (EXPONENT_BITS - 1);
            k |= BigUint::one();

            let Some(l) = mod_inverse(&k, &group.totient) else {
                continue;
            };
            if l.bits() < EXPONENT_BITS {
                continue;
            }
            return Self::from_exponents(k, l);
        }
    }

    fn id(&self) -> KeyId {
        self.id
    }

    fn encrypt<'m, R: RngCore + CryptoRng + ?Sized>(
        &self,
        msg: &'m mut Message,
        _rng: &mut R,
    ) -> Result<&'m mut Message, CipherError> {
        if msg.nonces.contains_key(&self.id) {
            return Err(CipherError::AlreadyEncrypted(self.id));
        }
        let prime = &group().prime;
        let m = BigUint::from_bytes_be(&msg.bytes);
        if &m >= prime {
            return Err(CipherError::InputTooLong);
        }
        msg.bytes = m.modpow(&self.k, prime).to_bytes_be();
        msg.nonces.insert(self.id, NO_NONCE);
        Ok(msg)
    }

    fn decrypt<'m>(&self, msg: &'m mut Message) -> Result<&'m mut Message, CipherError> {
        if !msg.nonces.contains_key(&self.id) {
            return Err(CipherError::NotEncrypted(self.id));
        }
        let prime = &group().prime;
        let c = BigUint::from_bytes_be(&msg.bytes);
        if &c >= prime {
            return Err(CipherError::InvalidCiphertext);
        }
        msg.bytes = c.modpow(&self.l, prime).to_bytes_be();
        msg.nonces.remove(&self.id);
        Ok(msg)
    }

    fn check_ciphertext(msg: &Message) -> Result<(), CipherError> {
        if &BigUint::from_bytes_be(&msg.bytes) >= modulus() {
            Err(CipherError::InvalidCiphertext)
        } else {
            Ok(())
        }
    }

    /// Encoding: `len(k)` as u16 big-endian, then `k` and `l` as big-endian integers
    fn to_bytes(&self) -> Vec<u8> {
        let k = self.k.to_bytes_be();
        let l = self.l.to_bytes_be();
        let mut bytes = Vec::with_capacity(2 + k.len() + l.len());
        // k is below 2^160, its length always fits
        bytes.extend_from_slice(&(k.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&k);
        bytes.extend_from_slice(&l);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() < 2 {
            return Err(CipherError::MalformedKey("sra key is too short"));
        }
        let (k_len, rest) = bytes.split_at(2);
        let k_len = usize::from(u16::from_be_bytes([k_len[0], k_len[1]]));
        if rest.len() <= k_len {
            return Err(CipherError::MalformedKey("sra key is truncated"));
        }
        let (k, l) = rest.split_at(k_len);
        let k = BigUint::from_bytes_be(k);
        let l = BigUint::from_bytes_be(l);

        let group = group();
        if k.is_zero() || l.is_zero() || k >= group.totient || l >= group.totient {
            return Err(CipherError::MalformedKey("sra exponent is out of range"));
        }
        if !((&k * &l) % &group.totient).is_one() {
            return Err(CipherError::MalformedKey(
                "sra exponents are not inverse modulo p-1",
            ));
        }
        Ok(Self::from_exponents(k, l))
    }
}

impl fmt::Debug for SraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SraKey").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn modulus_is_1024_bit_odd() {
        let p = modulus();
        assert_eq!(p.bits(), 1024);
        assert!(p.is_odd());
    }

    #[test]
    fn modulus_is_not_a_safe_prime() {
        // Order of the prime subgroup published alongside the modulus
        let q = BigUint::parse_bytes(b"F518AA8781A8DF278ABA4E7D64B7CB9D49462353", 16).unwrap();
        let p = modulus();
        let half = (p - 1u32) >> 1;
        assert_eq!(q.bits(), 160);
        assert!(((p - 1u32) % &q).is_zero());
        assert_ne!(half, q);
    }

    #[test]
    fn generated_exponents_are_inverse() {
        let mut rng = ChaCha20Rng::seed_from_u64(10);
        for _ in 0..5 {
            let key = SraKey::generate(&mut rng);
            assert_eq!(key.k.bits(), EXPONENT_BITS);
            assert!(key.k.is_odd());
            assert!(key.l.bits() >= EXPONENT_BITS);
            assert!(((&key.k * &key.l) % &group().totient).is_one());
        }
    }

    #[test]
    fn encrypt_then_decrypt_restores_plaintext() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let key = SraKey::generate(&mut rng);
        let mut msg = Message::new(vec![0x80, 1, 2, 3, 4, 5, 6, 7]);

        key.encrypt(&mut msg, &mut rng).unwrap();
        assert_ne!(msg.bytes(), &[0x80, 1, 2, 3, 4, 5, 6, 7]);
        assert!(key.can_decrypt(&msg));

        key.decrypt(&mut msg).unwrap();
        assert_eq!(msg.bytes(), &[0x80, 1, 2, 3, 4, 5, 6, 7]);
        assert!(msg.is_plaintext());
    }

    #[test]
    fn plaintext_not_below_modulus_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(12);
        let key = SraKey::generate(&mut rng);
        let mut msg = Message::new(modulus().to_bytes_be());
        let before = msg.clone();

        assert_eq!(
            key.encrypt(&mut msg, &mut rng).unwrap_err(),
            CipherError::InputTooLong
        );
        assert_eq!(msg, before);
    }

    #[test]
    fn ciphertext_not_below_modulus_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(13);
        let key = SraKey::generate(&mut rng);
        let mut msg = Message::new(vec![0x80, 0, 0, 1]);
        key.encrypt(&mut msg, &mut rng).unwrap();
        *msg.bytes_mut() = vec![0xff; 128];

        assert_eq!(
            SraKey::check_ciphertext(&msg),
            Err(CipherError::InvalidCiphertext)
        );
        let before = msg.clone();
        assert_eq!(
            key.decrypt(&mut msg).unwrap_err(),
            CipherError::InvalidCiphertext
        );
        assert_eq!(msg, before);
    }

    #[test]
    fn disclosed_secret_restores_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(14);
        let key = SraKey::generate(&mut rng);
        let restored = SraKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(restored.id(), key.id());
        assert_eq!(restored.k, key.k);
        assert_eq!(restored.l, key.l);
    }

    #[test]
    fn mismatched_exponents_are_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(15);
        let a = SraKey::generate(&mut rng);
        let b = SraKey::generate(&mut rng);

        let k = a.k.to_bytes_be();
        let mut forged = (k.len() as u16).to_be_bytes().to_vec();
        forged.extend_from_slice(&k);
        forged.extend_from_slice(&b.l.to_bytes_be());

        assert_matches!(
            SraKey::from_bytes(&forged),
            Err(CipherError::MalformedKey(_))
        );
        assert_matches!(SraKey::from_bytes(&[0, 20]), Err(CipherError::MalformedKey(_)));
    }
}
