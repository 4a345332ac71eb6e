// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_amt::Amt;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_hamt::{BytesKey, Error as HamtError, Hamt, Sha256};
use fvm_shared::bigint::BigInt;
pub use fvm_shared::BLOCKS_PER_EPOCH as EXPECTED_LEADERS_PER_EPOCH;
use serde::de::DeserializeOwned;
use serde::Serialize;
pub use {fvm_ipld_amt, fvm_ipld_hamt};

pub use self::actor_error::*;
pub use self::builtin::*;
pub use self::dispatch::*;
pub use self::util::*;

pub mod actor_error;
pub mod builtin;
mod dispatch;
pub mod runtime;
pub mod util;

#[cfg(feature = "test_utils")]
pub mod test_utils;

type Hasher = Sha256;

/// Map type to be used within actors. The underlying type is a HAMT.
pub type Map<'bs, BS, V> = Hamt<&'bs BS, V, BytesKey, Hasher>;

/// Array type used within actors. The underlying type is an AMT.
pub type Array<'bs, V, BS> = Amt<V, &'bs BS>;

/// Deal weight
pub type DealWeight = BigInt;

/// Create a hamt with a custom bitwidth.
#[inline]
pub fn make_empty_map<BS, V>(store: &'_ BS, bitwidth: u32) -> Map<'_, BS, V>
where
    BS: Blockstore,
    V: DeserializeOwned + Serialize,
{
    Map::<_, V>::new_with_bit_width(store, bitwidth)
}

/// Create a map with a root cid.
#[inline]
pub fn make_map_with_root<'bs, BS, V>(
    root: &Cid,
    store: &'bs BS,
) -> Result<Map<'bs, BS, V>, HamtError>
where
    BS: Blockstore,
    V: DeserializeOwned + Serialize,
{
    Map::<_, V>::load_with_bit_width(root, store, HAMT_BIT_WIDTH)
}

/// Encodes an integer key as an unsigned varint, the key format of all integer-keyed maps.
pub fn u64_key(k: u64) -> BytesKey {
    let mut bz = unsigned_varint::encode::u64_buffer();
    let slice = unsigned_varint::encode::u64(k, &mut bz);
    slice.into()
}

pub fn parse_uint_key(s: &[u8]) -> anyhow::Result<u64> {
    let (v, rest) = unsigned_varint::decode::u64(s)?;
    if !rest.is_empty() {
        anyhow::bail!("trailing bytes after varint key {:?}", s);
    }
    Ok(v)
}

/// Extracts the return value of a send, mapping a non-zero exit code to an actor error
/// carrying the same code.
pub fn extract_send_result(
    res: Result<fvm_shared::Response, SendError>,
) -> Result<Option<fvm_ipld_encoding::ipld_block::IpldBlock>, ActorError> {
    let ret = res?;
    if ret.exit_code.is_success() {
        Ok(ret.return_data)
    } else {
        Err(ActorError::checked(ret.exit_code, format!("send aborted with code {}", ret.exit_code)))
    }
}

/// Deserializes the return block of a send, failing if the callee returned nothing.
pub fn deserialize_block<T>(
    ret: Option<fvm_ipld_encoding::ipld_block::IpldBlock>,
) -> Result<T, ActorError>
where
    T: DeserializeOwned,
{
    ret.ok_or_else(|| ActorError::assertion_failed("return expected".to_string()))?
        .deserialize()
        .map_err(|e| e.into())
}
