use fair_order::crypto::{CipherError, CommutativeKey, KeystreamKey, Message, SraKey};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Plaintext without leading zero bytes, so integer-based schemes restore it byte for byte
fn plaintext() -> impl Strategy<Value = Vec<u8>> {
    (1u8..=255, prop::collection::vec(any::<u8>(), 0..32)).prop_map(|(head, tail)| {
        let mut bytes = vec![head];
        bytes.extend(tail);
        bytes
    })
}

/// Encrypts with `keys` in one random order, decrypts in another one
fn roundtrip_in_any_order<K: CommutativeKey>(bytes: Vec<u8>, keys_n: usize, seed: u64) {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let keys = (0..keys_n).map(|_| K::generate(&mut rng)).collect::<Vec<_>>();

    let mut encrypt_order = (0..keys_n).collect::<Vec<_>>();
    encrypt_order.shuffle(&mut rng);
    let mut decrypt_order = encrypt_order.clone();
    decrypt_order.shuffle(&mut rng);

    let mut msg = Message::new(bytes.clone());
    for &i in &encrypt_order {
        keys[i].encrypt(&mut msg, &mut rng).unwrap();
    }
    assert_eq!(msg.layer_count(), keys_n);
    assert!(keys.iter().all(|key| key.can_decrypt(&msg)));

    for &i in &decrypt_order {
        keys[i].decrypt(&mut msg).unwrap();
    }
    assert!(msg.is_plaintext());
    assert_eq!(msg.bytes(), &bytes[..]);
}

proptest! {
    #[test]
    fn keystream_layers_commute(bytes in plaintext(), keys_n in 2usize..=5, seed in any::<u64>()) {
        roundtrip_in_any_order::<KeystreamKey>(bytes, keys_n, seed);
    }
}

proptest! {
    // Every case performs up to ten 1024-bit modular exponentiations
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn sra_layers_commute(bytes in plaintext(), keys_n in 2usize..=5, seed in any::<u64>()) {
        roundtrip_in_any_order::<SraKey>(bytes, keys_n, seed);
    }
}

#[test]
fn sra_ciphertext_doesnt_depend_on_order() {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let a = SraKey::generate(&mut rng);
    let b = SraKey::generate(&mut rng);

    let mut ab = Message::new(b"card".to_vec());
    a.encrypt(&mut ab, &mut rng).unwrap();
    b.encrypt(&mut ab, &mut rng).unwrap();
    let mut ba = Message::new(b"card".to_vec());
    b.encrypt(&mut ba, &mut rng).unwrap();
    a.encrypt(&mut ba, &mut rng).unwrap();

    assert_eq!(ab, ba);
}

#[test]
fn keys_restored_from_bytes_decrypt() {
    fn check<K: CommutativeKey>(seed: u64) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let key = K::generate(&mut rng);
        let restored = K::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(restored.id(), key.id());

        let mut msg = Message::new(vec![0x80, 1, 2, 3]);
        key.encrypt(&mut msg, &mut rng).unwrap();
        restored.decrypt(&mut msg).unwrap();
        assert_eq!(msg.bytes(), &[0x80, 1, 2, 3]);
    }
    check::<KeystreamKey>(1);
    check::<SraKey>(2);
}

#[test]
fn decrypting_with_foreign_key_is_refused() {
    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let a = KeystreamKey::generate(&mut rng);
    let b = KeystreamKey::generate(&mut rng);

    let mut msg = Message::new(b"secret".to_vec());
    a.encrypt(&mut msg, &mut rng).unwrap();
    let before = msg.clone();
    assert_eq!(b.decrypt(&mut msg).unwrap_err(), CipherError::NotEncrypted(b.id()));
    assert_eq!(msg, before);
}
