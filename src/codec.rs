//! Binary encoding of transaction records for byte-oriented stores

use crate::{StoreError, TransGlobal};
use rkyv::util::AlignedVec;

/// Encode a record
pub fn encode(trans: &TransGlobal) -> Result<Vec<u8>, StoreError> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(trans)
        .map_err(|e| StoreError::Codec(e.to_string().into()))?;
    Ok(bytes.to_vec())
}

/// Decode a record. The input needs no particular alignment.
pub fn decode(bytes: &[u8]) -> Result<TransGlobal, StoreError> {
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<TransGlobal, rkyv::rancor::Error>(&aligned)
        .map_err(|e| StoreError::Codec(e.to_string().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Branch, BranchOp, BranchStatus, Protocol, TransStatus};

    #[test]
    fn test_decode_from_unaligned_slice() {
        let mut trans = TransGlobal::new(
            "gid-codec",
            Protocol::Tcc,
            TransStatus::Aborting,
            vec![Branch::new("01", BranchOp::Cancel, "svc/cancel", b"{}".to_vec())],
            b"payload".to_vec(),
            7,
        );
        trans.branches[0].status = BranchStatus::Failed;
        trans.branches[0].error = Some("boom".into());
        trans.rollback_reason = Some("try failed".into());

        let bytes = encode(&trans).unwrap();
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(decode(&shifted[1..]).unwrap(), trans);
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        assert!(matches!(decode(&[1, 2, 3]), Err(StoreError::Codec(_))));
    }
}
