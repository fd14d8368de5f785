use rand::thread_rng;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str;

/// A 20-byte account or token-contract address, derived from the keccak hash
/// of the uncompressed public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The topic a node with this address subscribes to on the message bus.
    pub fn topic(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl str::FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)?;

        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;

        hex.parse().map_err(serde::de::Error::custom)
    }
}

/// A 65-byte recoverable ECDSA signature in `r || s || v` layout.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 65]);

impl Signature {
    /// Placeholder for messages that have not been signed yet. Never valid.
    pub fn missing() -> Self {
        Self([0u8; 65])
    }

    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn is_missing(&self) -> bool {
        self.0 == [0u8; 65]
    }

    /// Recovers the signer address for the given 32-byte message digest.
    pub fn recover(&self, digest: [u8; 32]) -> Result<Address, Error> {
        if self.is_missing() {
            return Err(Error::SignatureMissing);
        }

        let recovery_id = RecoveryId::from_i32(self.0[64] as i32)?;
        let signature = RecoverableSignature::from_compact(&self.0[..64], recovery_id)?;
        let public_key = SECP256K1.recover_ecdsa(&Message::from_digest(digest), &signature)?;

        Ok(address_of(&public_key))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Message is not signed")]
    SignatureMissing,
    #[error("Signature is invalid")]
    InvalidSignature(#[from] secp256k1::Error),
    #[error("Seed does not map onto the curve")]
    BadSeed,
}

/// A secp256k1 identity used to sign outgoing messages.
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    address: Address,
}

impl Keypair {
    pub fn random() -> Self {
        let secret = SecretKey::new(&mut thread_rng());

        Self::from_secret(secret)
    }

    /// Deterministic keypair from an arbitrary seed string, for tests and
    /// throwaway deployments without a keyfile.
    pub fn from_seed(seed: &str) -> Result<Self, Error> {
        let secret =
            SecretKey::from_slice(&keccak256(seed.as_bytes())).map_err(|_| Error::BadSeed)?;

        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey::from_secret_key(SECP256K1, &secret);

        Self {
            secret,
            address: address_of(&public),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs a 32-byte digest, producing a recoverable signature.
    pub fn sign(&self, digest: [u8; 32]) -> Signature {
        let signature =
            SECP256K1.sign_ecdsa_recoverable(&Message::from_digest(digest), &self.secret);
        let (recovery_id, compact) = signature.serialize_compact();

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&compact);
        bytes[64] = recovery_id.to_i32() as u8;

        Signature(bytes)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn address_of(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);

    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);

    Address(bytes)
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);

    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_recover_yields_signer_address() {
        let keypair = Keypair::from_seed("alice").unwrap();
        let digest = keccak256(b"some message");

        let signature = keypair.sign(digest);

        assert_eq!(signature.recover(digest).unwrap(), keypair.address());
    }

    #[test]
    fn recovery_with_wrong_digest_yields_different_address() {
        let keypair = Keypair::from_seed("alice").unwrap();

        let signature = keypair.sign(keccak256(b"one"));
        let recovered = signature.recover(keccak256(b"two")).unwrap();

        assert_ne!(recovered, keypair.address());
    }

    #[test]
    fn missing_signature_does_not_recover() {
        let result = Signature::missing().recover(keccak256(b"anything"));

        assert!(matches!(result, Err(Error::SignatureMissing)));
    }

    #[test]
    fn address_roundtrips_through_display() {
        let address = Keypair::from_seed("bob").unwrap().address();

        let parsed: Address = address.to_string().parse().unwrap();

        assert_eq!(parsed, address);
    }
}
