//! Hash security checks for CIDs
//!
//! Every operation validates its ids before touching any store. A CID that
//! fails here is never persisted, fetched or forwarded to the exchange.

use cid::Cid;
use tracing::warn;

use crate::error::{BlockServiceError, Result};

/// Multihash code of the identity "hash" (payload inlined into the id)
pub const IDENTITY_CODE: u64 = 0x00;

/// Shortest digest accepted for a real hash function
pub const MIN_DIGEST_LEN: usize = 20;

/// Hash functions that are broken or not cryptographic
const DENIED_CODES: &[(u64, &str)] = &[
    (0x11, "sha1"),
    (0x22, "murmur3-x64-64"),
    (0x23, "murmur3-32"),
    (0xd4, "md4"),
    (0xd5, "md5"),
];

/// Reject CIDs whose hash function is unsafe
pub fn validate_cid(cid: &Cid) -> Result<()> {
    let hash = cid.hash();
    let code = hash.code();
    let len = hash.digest().len();

    if let Some((_, name)) = DENIED_CODES.iter().find(|(denied, _)| *denied == code) {
        return Err(BlockServiceError::Security {
            cid: *cid,
            reason: format!("hash function {} is not allowed", name),
        });
    }

    // Identity digests inline the payload; `Cid` caps them at 64 bytes
    if code == IDENTITY_CODE {
        return Ok(());
    }

    if len < MIN_DIGEST_LEN {
        return Err(BlockServiceError::Security {
            cid: *cid,
            reason: format!("digest of {} bytes is shorter than {}", len, MIN_DIGEST_LEN),
        });
    }

    Ok(())
}

/// Keep the safe ids, logging each one dropped
pub fn retain_valid(cids: Vec<Cid>) -> Vec<Cid> {
    if cids.iter().all(|c| validate_cid(c).is_ok()) {
        return cids;
    }

    cids.into_iter()
        .filter(|c| match validate_cid(c) {
            Ok(()) => true,
            Err(e) => {
                warn!(cid = %c, error = %e, "Dropping unsafe CID from batch read");
                false
            }
        })
        .collect()
}
