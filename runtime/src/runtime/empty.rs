// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use multihash::{Code, MultihashDigest};

const RAW: u64 = 0x55;
const DAG_CBOR: u64 = 0x71;

lazy_static::lazy_static! {
    /// CID of the CBOR encoding of an empty array, the state root of an actor before construction.
    pub static ref EMPTY_ARR_CID: Cid = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&[0x80]));
}

/// A raw identity CID used by tests and the mock runtime to stand in for actor code.
pub fn make_identity_cid(bz: &[u8]) -> Cid {
    Cid::new_v1(RAW, Code::Identity.digest(bz))
}

#[test]
fn empty_arr_cid_is_stable() {
    assert_eq!(
        EMPTY_ARR_CID.to_string(),
        "bafy2bzacebc3bt6cedhoyw34drrmjvazhu4oj25er2ebk4u445pzycvq4ta4a"
    );
}
