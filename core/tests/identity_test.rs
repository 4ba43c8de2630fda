use chunklink_core::identity::{Identity, MessageSigner};

#[test]
fn test_identity_generation() {
    let id1 = Identity::generate();
    let id2 = Identity::generate();

    assert_ne!(id1.key_id(), id2.key_id());
}

#[test]
fn test_signature_verification() {
    let identity = Identity::generate();
    let data = b"test data";

    let signature = identity.sign(data);

    assert_eq!(signature.len(), 64);
    assert!(identity.verify(data, &signature));
    assert!(!identity.verify(b"other data", &signature));
    assert!(!identity.verify(data, &signature[..10]));
}

#[test]
fn test_other_key_rejects_signature() {
    let signer = Identity::generate();
    let other = Identity::generate();

    let signature = signer.sign(b"payload");
    assert!(!other.verify(b"payload", &signature));
}

#[test]
fn test_shared_seed_round_trip() {
    let identity = Identity::generate();
    let restored = Identity::from_hex(&identity.seed_hex()).unwrap();

    assert_eq!(identity.key_id(), restored.key_id());
    let signature = identity.sign(b"payload");
    assert!(restored.verify(b"payload", &signature));
}

#[test]
fn test_invalid_seed_rejected() {
    assert!(Identity::from_hex("not-hex").is_err());
    assert!(Identity::from_hex("abcd").is_err());
}
