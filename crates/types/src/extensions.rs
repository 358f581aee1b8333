//! Typed block header extensions.
//!
//! Extensions travel in the header as `(ext_id, payload)` pairs sorted by
//! id. Duplicate ids are rejected unless the extension opts into
//! multiplicity; every extension defined here is unique-per-block.
//!
//! - id 1: [`ProtocolFeatureActivation`]
//! - id 2: [`InstantFinalityExtension`] - required in every block after the
//!   switch to instant finality
//! - id 3: [`FinalityMarkerExtension`]

use crate::policy::{FinalizerPolicy, ProposerPolicy};
use crate::qc::QcClaim;
use crate::wire::{
    get_bool, get_bytes, get_option, get_u32, get_varuint32, put_bool, put_bytes, put_option,
    put_u32, put_varuint32, WireDecode, WireEncode, WireResult,
};
use fincore_crypto::Digest;
use serde::{Deserialize, Serialize};

/// Errors from extracting typed extensions out of a header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtensionError {
    /// Extension ids not in ascending order
    #[error("header extensions out of order at id {0}")]
    OutOfOrder(u16),

    /// An extension appeared more than once without opting into multiplicity
    #[error("duplicate header extension id {0}")]
    Duplicate(u16),

    /// Unrecognized extension id
    #[error("unknown header extension id {0}")]
    Unknown(u16),

    /// Payload failed to decode
    #[error("malformed payload for extension id {id}: {reason}")]
    MalformedPayload { id: u16, reason: String },

    /// The instant-finality extension was absent
    #[error("missing instant finality header extension")]
    MissingInstantFinality,
}

/// A typed header extension with a fixed id and multiplicity rule.
pub trait HeaderExtension: WireEncode + WireDecode {
    /// Wire id of this extension.
    const EXTENSION_ID: u16;
    /// Whether at most one instance may appear per header.
    const ENFORCE_UNIQUE: bool;
}

/// Protocol feature activations carried by this block (id 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProtocolFeatureActivation {
    pub protocol_features: Vec<Digest>,
}

impl HeaderExtension for ProtocolFeatureActivation {
    const EXTENSION_ID: u16 = 1;
    const ENFORCE_UNIQUE: bool = true;
}

impl WireEncode for ProtocolFeatureActivation {
    fn encode(&self, out: &mut Vec<u8>) {
        put_varuint32(out, self.protocol_features.len() as u32);
        for d in &self.protocol_features {
            put_bytes(out, d.as_bytes());
        }
    }
}

impl WireDecode for ProtocolFeatureActivation {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        let count = get_varuint32(input)? as usize;
        let mut protocol_features = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(get_bytes(input, 32)?);
            protocol_features.push(Digest::new(arr));
        }
        Ok(Self { protocol_features })
    }
}

/// The instant-finality extension (id 2).
///
/// Carries the block's QC claim and any policy proposals. Present in every
/// block; when validating a received header the claim in here is
/// authoritative and must equal the one driving core advancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstantFinalityExtension {
    /// The compact QC reference for this block
    pub qc_claim: Option<QcClaim>,
    /// Newly proposed finalizer policy, if any
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    /// Newly proposed proposer policy, if any
    pub new_proposer_policy: Option<ProposerPolicy>,
}

impl HeaderExtension for InstantFinalityExtension {
    const EXTENSION_ID: u16 = 2;
    const ENFORCE_UNIQUE: bool = true;
}

impl WireEncode for InstantFinalityExtension {
    fn encode(&self, out: &mut Vec<u8>) {
        put_option(out, &self.qc_claim);
        put_option(out, &self.new_finalizer_policy);
        put_option(out, &self.new_proposer_policy);
    }
}

impl WireDecode for InstantFinalityExtension {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            qc_claim: get_option(input)?,
            new_finalizer_policy: get_option(input)?,
            new_proposer_policy: get_option(input)?,
        })
    }
}

/// Compact finality marker (id 3): the block's QC claim in flat form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FinalityMarkerExtension {
    pub last_qc_block_num: u32,
    pub is_last_qc_strong: bool,
}

impl HeaderExtension for FinalityMarkerExtension {
    const EXTENSION_ID: u16 = 3;
    const ENFORCE_UNIQUE: bool = true;
}

impl WireEncode for FinalityMarkerExtension {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.last_qc_block_num);
        put_bool(out, self.is_last_qc_strong);
    }
}

impl WireDecode for FinalityMarkerExtension {
    fn decode(input: &mut &[u8]) -> WireResult<Self> {
        Ok(Self {
            last_qc_block_num: get_u32(input)?,
            is_last_qc_strong: get_bool(input)?,
        })
    }
}

/// The typed extensions found in one header.
#[derive(Debug, Clone, Default)]
pub struct HeaderExtensions {
    pub protocol_features: Option<ProtocolFeatureActivation>,
    pub instant_finality: Option<InstantFinalityExtension>,
    pub finality_marker: Option<FinalityMarkerExtension>,
}

impl HeaderExtensions {
    /// The instant-finality extension, required post-IF.
    pub fn require_instant_finality(&self) -> Result<&InstantFinalityExtension, ExtensionError> {
        self.instant_finality
            .as_ref()
            .ok_or(ExtensionError::MissingInstantFinality)
    }
}

/// Validate and extract the typed extensions from raw header pairs.
///
/// Enforces ascending id order, per-extension uniqueness, and known ids.
pub fn extract_header_extensions(
    raw: &[(u16, Vec<u8>)],
) -> Result<HeaderExtensions, ExtensionError> {
    let mut out = HeaderExtensions::default();
    let mut last_id: Option<u16> = None;
    for (ext_id, payload) in raw {
        if let Some(prev) = last_id {
            if *ext_id < prev {
                return Err(ExtensionError::OutOfOrder(*ext_id));
            }
            if *ext_id == prev {
                // every known extension enforces uniqueness
                return Err(ExtensionError::Duplicate(*ext_id));
            }
        }
        last_id = Some(*ext_id);

        let malformed = |reason: crate::wire::WireError| ExtensionError::MalformedPayload {
            id: *ext_id,
            reason: reason.to_string(),
        };
        match *ext_id {
            ProtocolFeatureActivation::EXTENSION_ID => {
                out.protocol_features =
                    Some(ProtocolFeatureActivation::from_wire_bytes(payload).map_err(malformed)?);
            }
            InstantFinalityExtension::EXTENSION_ID => {
                out.instant_finality =
                    Some(InstantFinalityExtension::from_wire_bytes(payload).map_err(malformed)?);
            }
            FinalityMarkerExtension::EXTENSION_ID => {
                out.finality_marker =
                    Some(FinalityMarkerExtension::from_wire_bytes(payload).map_err(malformed)?);
            }
            other => return Err(ExtensionError::Unknown(other)),
        }
    }
    Ok(out)
}

/// Insert an extension payload keeping the id-sorted invariant.
pub fn emplace_extension(extensions: &mut Vec<(u16, Vec<u8>)>, ext_id: u16, payload: Vec<u8>) {
    let pos = extensions.partition_point(|(id, _)| *id < ext_id);
    extensions.insert(pos, (ext_id, payload));
}
