//! Finalizer vote messages.
//!
//! A vote is a BLS signature over a block's strong digest (strong vote) or
//! over the `WEAK`-tagged digest (weak vote), identified by the voting
//! finalizer's public key.

use crate::block::BlockId;
use crate::wire::{
    get_bool, get_bytes, get_var_bytes, put_bool, put_var_bytes, WireDecode, WireEncode,
    WireError, WireResult,
};
use fincore_crypto::bls::BlsPrivateKey;
use fincore_crypto::{create_weak_digest, BlsPublicKey, BlsSignature};
use serde::{Deserialize, Serialize};

/// A single finalizer's vote on one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteMessage {
    /// The block voted on
    pub block_id: BlockId,
    /// Strong (ready to finalize) or weak (safety concession)
    pub strong: bool,
    /// The voting finalizer's key
    pub finalizer_key: BlsPublicKey,
    /// Signature over the strong or weak digest
    pub sig: BlsSignature,
}

impl VoteMessage {
    /// Produce a vote, signing the appropriate digest.
    pub fn new(block_id: BlockId, strong: bool, key: &BlsPrivateKey) -> Self {
        let sig = if strong {
            key.sign(block_id.as_digest().as_bytes())
        } else {
            key.sign(&create_weak_digest(block_id.as_digest()))
        };
        Self {
            block_id,
            strong,
            finalizer_key: key.public_key(),
            sig,
        }
    }

    /// Verify the signature against the claimed key and digest.
    pub fn verify(&self) -> bool {
        if self.strong {
            self.sig
                .verify(self.block_id.as_digest().as_bytes(), &self.finalizer_key)
        } else {
            self.sig.verify(
                &create_weak_digest(self.block_id.as_digest()),
                &self.finalizer_key,
            )
        }
    }
}

impl WireEncode for VoteMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        self.block_id.encode(out);
        put_bool(out, self.strong);
        put_var_bytes(out, &self.finalizer_key.to_bytes());
        put_var_bytes(out, &self.sig.to_bytes());
    }
}

impl WireDecode for VoteMessage {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let block_id = BlockId::decode(input)?;
        let strong = get_bool(input)?;

        let key_bytes = get_var_bytes(input)?;
        if key_bytes.len() != 48 {
            return Err(WireError::InvalidValue("BLS public key must be 48 bytes"));
        }
        let mut key_arr = [0u8; 48];
        key_arr.copy_from_slice(key_bytes);
        let finalizer_key = BlsPublicKey::from_bytes(&key_arr)
            .map_err(|_| WireError::InvalidValue("invalid BLS public key"))?;

        let sig_bytes = get_var_bytes(input)?;
        if sig_bytes.len() != 96 {
            return Err(WireError::InvalidValue("BLS signature must be 96 bytes"));
        }
        let mut sig_arr = [0u8; 96];
        sig_arr.copy_from_slice(sig_bytes);
        let sig = BlsSignature::from_bytes(&sig_arr)
            .map_err(|_| WireError::InvalidValue("invalid BLS signature"))?;

        Ok(Self {
            block_id,
            strong,
            finalizer_key,
            sig,
        })
    }
}
