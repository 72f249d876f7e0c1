use anyhow::Result;
use sp_core::crypto::Ss58Codec;
use sp_core::{sr25519, Pair};

/// Node keypair used to sign result reports before they are pushed to the
/// registry. Injected into the committer, never looked up globally.
#[derive(Clone)]
pub struct NodeIdentity {
    pair: sr25519::Pair,
}

impl NodeIdentity {
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self> {
        let (pair, _seed) = sr25519::Pair::from_phrase(mnemonic, None)
            .map_err(|e| anyhow::anyhow!("failed to derive keypair from mnemonic: {:?}", e))?;
        Ok(Self { pair })
    }

    /// Throwaway identity for tests and local development.
    pub fn generate() -> Self {
        let (pair, _seed) = sr25519::Pair::generate();
        Self { pair }
    }

    /// SS58 address of the node's public key; this is the node id the
    /// registry knows us by.
    pub fn node_id(&self) -> String {
        self.pair.public().to_ss58check()
    }

    pub fn sign_hex(&self, message: &[u8]) -> String {
        let signature = self.pair.sign(message);
        let bytes: &[u8] = signature.as_ref();
        hex::encode(bytes)
    }
}

/// Verify a hex sr25519 signature against an SS58 node id.
pub fn verify_hex(node_id: &str, message: &[u8], signature_hex: &str) -> Result<bool> {
    let public = sr25519::Public::from_ss58check(node_id)
        .map_err(|e| anyhow::anyhow!("invalid node id: {:?}", e))?;

    let bytes = hex::decode(signature_hex)
        .map_err(|e| anyhow::anyhow!("invalid signature hex: {}", e))?;
    if bytes.len() != 64 {
        return Ok(false);
    }

    let mut raw = [0u8; 64];
    raw.copy_from_slice(&bytes);
    let signature = sr25519::Signature::from(raw);

    Ok(sr25519::Pair::verify(&signature, message, &public))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let identity = NodeIdentity::generate();
        let message = b"reservation result payload";

        let signature = identity.sign_hex(message);
        assert!(verify_hex(&identity.node_id(), message, &signature).unwrap());
        assert!(!verify_hex(&identity.node_id(), b"tampered", &signature).unwrap());
    }
}
