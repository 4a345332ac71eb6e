// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use core::fmt;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use anyhow::anyhow;
use cid::multihash::Multihash;
use cid::Cid;
use fvm_ipld_blockstore::MemoryBlockstore;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::CborStore;
use fvm_shared::address::{Address, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::commcid::{
    FIL_COMMITMENT_SEALED, FIL_COMMITMENT_UNSEALED, POSEIDON_BLS12_381_A1_FC1,
    SHA2_256_TRUNC254_PADDED,
};
use fvm_shared::consensus::ConsensusFault;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::{ErrorNumber, ExitCode};
use fvm_shared::randomness::RANDOMNESS_LENGTH;
use fvm_shared::sector::{SealVerifyInfo, WindowPoStVerifyInfo};
use fvm_shared::{ActorID, MethodNum, Response};
use multihash::Code;
use rand::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::runtime::builtins::Type;
use crate::runtime::{
    make_identity_cid, ActorCode, DomainSeparationTag, MessageInfo, Policy, Primitives, Runtime,
    RuntimePolicy, Verifier, EMPTY_ARR_CID,
};
use crate::{actor_error, ActorError, SendError};

lazy_static::lazy_static! {
    pub static ref SYSTEM_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/system");
    pub static ref INIT_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/init");
    pub static ref CRON_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/cron");
    pub static ref ACCOUNT_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/account");
    pub static ref POWER_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/storagepower");
    pub static ref MINER_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/storageminer");
    pub static ref MARKET_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/storagemarket");
    pub static ref PAYCH_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/paymentchannel");
    pub static ref MULTISIG_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/multisig");
    pub static ref REWARD_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/reward");
    pub static ref VERIFREG_ACTOR_CODE_ID: Cid = make_identity_cid(b"fil/test/verifiedregistry");
    pub static ref ACTOR_TYPES: BTreeMap<Cid, Type> = [
        (*SYSTEM_ACTOR_CODE_ID, Type::System),
        (*INIT_ACTOR_CODE_ID, Type::Init),
        (*CRON_ACTOR_CODE_ID, Type::Cron),
        (*ACCOUNT_ACTOR_CODE_ID, Type::Account),
        (*POWER_ACTOR_CODE_ID, Type::Power),
        (*MINER_ACTOR_CODE_ID, Type::Miner),
        (*MARKET_ACTOR_CODE_ID, Type::Market),
        (*PAYCH_ACTOR_CODE_ID, Type::PaymentChannel),
        (*MULTISIG_ACTOR_CODE_ID, Type::Multisig),
        (*REWARD_ACTOR_CODE_ID, Type::Reward),
        (*VERIFREG_ACTOR_CODE_ID, Type::VerifiedRegistry),
    ]
    .into_iter()
    .collect();
}

/// Installs a logger for tests, so that `RUST_LOG=debug` shows actor logs.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

pub struct MockRuntime {
    pub epoch: RefCell<ChainEpoch>,
    pub id_addresses: RefCell<HashMap<Address, Address>>,
    pub actor_code_cids: RefCell<HashMap<Address, Cid>>,
    pub receiver: Address,
    pub caller: RefCell<Address>,
    pub caller_type: RefCell<Cid>,
    pub value_received: RefCell<TokenAmount>,
    pub hash_func: Box<dyn Fn(&[u8]) -> [u8; 32]>,

    // Actor State
    pub state: RefCell<Option<Cid>>,
    pub balance: RefCell<TokenAmount>,

    // VM Impl
    pub in_call: RefCell<bool>,
    pub store: Rc<MemoryBlockstore>,
    pub in_transaction: RefCell<bool>,

    // Expectations
    pub expectations: RefCell<Expectations>,

    // policy
    pub policy: Policy,

    pub circulating_supply: RefCell<TokenAmount>,
}

#[derive(Default)]
pub struct Expectations {
    pub expect_validate_caller_any: bool,
    pub expect_validate_caller_addr: Option<Vec<Address>>,
    pub expect_validate_caller_type: Option<Vec<Type>>,
    pub expect_sends: VecDeque<ExpectedMessage>,
    pub expect_delete_actor: Option<Address>,
    pub expect_verify_seal: Option<ExpectVerifySeal>,
    pub expect_verify_post: Option<ExpectVerifyPoSt>,
    pub expect_verify_consensus_fault: Option<ExpectVerifyConsensusFault>,
    pub expect_get_randomness_tickets: VecDeque<ExpectRandomness>,
    pub expect_get_randomness_beacon: VecDeque<ExpectRandomness>,
}

impl Expectations {
    fn reset(&mut self) {
        *self = Default::default();
    }

    fn verify(&mut self) {
        assert!(!self.expect_validate_caller_any, "expected ValidateCallerAny, not received");
        assert!(
            self.expect_validate_caller_addr.is_none(),
            "expected ValidateCallerAddr {:?}, not received",
            self.expect_validate_caller_addr
        );
        assert!(
            self.expect_validate_caller_type.is_none(),
            "expected ValidateCallerType {:?}, not received",
            self.expect_validate_caller_type
        );
        assert!(
            self.expect_sends.is_empty(),
            "expected all message to be send, unsent messages {:?}",
            self.expect_sends
        );
        assert!(
            self.expect_delete_actor.is_none(),
            "expected actor to be deleted: {:?}",
            self.expect_delete_actor
        );
        assert!(
            self.expect_verify_seal.is_none(),
            "expect_verify_seal {:?}, not received",
            self.expect_verify_seal
        );
        assert!(
            self.expect_verify_post.is_none(),
            "expect_verify_post {:?}, not received",
            self.expect_verify_post
        );
        assert!(
            self.expect_verify_consensus_fault.is_none(),
            "expect_verify_consensus_fault {:?}, not received",
            self.expect_verify_consensus_fault
        );
        assert!(
            self.expect_get_randomness_tickets.is_empty(),
            "expect_get_randomness_tickets {:?}, not received",
            self.expect_get_randomness_tickets
        );
        assert!(
            self.expect_get_randomness_beacon.is_empty(),
            "expect_get_randomness_beacon {:?}, not received",
            self.expect_get_randomness_beacon
        );
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            epoch: Default::default(),
            id_addresses: Default::default(),
            actor_code_cids: Default::default(),
            receiver: Address::new_id(0),
            caller: RefCell::new(Address::new_id(0)),
            caller_type: Default::default(),
            value_received: Default::default(),
            hash_func: Box::new(blake2b_256),
            state: Default::default(),
            balance: Default::default(),
            in_call: Default::default(),
            store: Default::default(),
            in_transaction: Default::default(),
            expectations: Default::default(),
            policy: Default::default(),
            circulating_supply: Default::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExpectedMessage {
    pub to: Address,
    pub method: MethodNum,
    pub params: Option<IpldBlock>,
    pub value: TokenAmount,

    // returns from applying expectedMessage
    pub send_return: Option<IpldBlock>,
    pub exit_code: ExitCode,
    pub send_error: Option<ErrorNumber>,
}

#[derive(Clone, Debug)]
pub struct ExpectVerifySeal {
    seal: SealVerifyInfo,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectVerifyPoSt {
    post: WindowPoStVerifyInfo,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectVerifyConsensusFault {
    block_header_1: Vec<u8>,
    block_header_2: Vec<u8>,
    block_header_extra: Vec<u8>,
    fault: Option<ConsensusFault>,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectRandomness {
    tag: DomainSeparationTag,
    epoch: ChainEpoch,
    entropy: Vec<u8>,
    out: [u8; RANDOMNESS_LENGTH],
}

pub fn expect_empty(res: Option<IpldBlock>) {
    assert!(res.is_none(), "expected empty return, got {:?}", res);
}

pub fn expect_abort_contains_message<T: fmt::Debug>(
    expect_exit_code: ExitCode,
    expect_msg: &str,
    res: Result<T, ActorError>,
) {
    let err = res.expect_err(&format!(
        "expected abort with exit code {}, but call succeeded",
        expect_exit_code
    ));
    assert_eq!(
        err.exit_code(),
        expect_exit_code,
        "expected failure with exit code {}, but failed with exit code {}; error message: {}",
        expect_exit_code,
        err.exit_code(),
        err.msg(),
    );
    let err_msg = err.msg();
    assert!(
        err.msg().contains(expect_msg),
        "expected err message '{}' to contain '{}'",
        err_msg,
        expect_msg,
    );
}

pub fn expect_abort<T: fmt::Debug>(exit_code: ExitCode, res: Result<T, ActorError>) {
    expect_abort_contains_message(exit_code, "", res);
}

impl MockRuntime {
    ///// Runtime access for tests /////

    pub fn get_state<T: DeserializeOwned>(&self) -> T {
        self.store_get(self.state.borrow().as_ref().unwrap())
    }

    pub fn replace_state<T: Serialize>(&self, obj: &T) {
        self.state.replace(Some(self.store_put(obj)));
    }

    pub fn set_balance(&self, amount: TokenAmount) {
        self.balance.replace(amount);
    }

    pub fn get_balance(&self) -> TokenAmount {
        self.balance.borrow().clone()
    }

    pub fn add_balance(&self, amount: TokenAmount) {
        *self.balance.borrow_mut() += amount;
    }

    pub fn set_value(&self, value: TokenAmount) {
        self.value_received.replace(value);
    }

    pub fn set_caller(&self, code_id: Cid, address: Address) {
        self.caller.replace(address);
        self.caller_type.replace(code_id);
        self.actor_code_cids.borrow_mut().insert(address, code_id);
    }

    pub fn set_address_actor_type(&self, address: Address, actor_type: Cid) {
        self.actor_code_cids.borrow_mut().insert(address, actor_type);
    }

    pub fn add_id_address(&self, source: Address, target: Address) {
        assert_eq!(target.protocol(), Protocol::ID, "target must use ID address protocol");
        self.id_addresses.borrow_mut().insert(source, target);
    }

    pub fn get_id_address(&self, address: &Address) -> Option<Address> {
        if address.protocol() == Protocol::ID {
            return Some(*address);
        }
        self.id_addresses.borrow().get(address).cloned()
    }

    pub fn call<A: ActorCode>(
        &self,
        method_num: MethodNum,
        params: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError> {
        self.in_call.replace(true);
        let prev_state = *self.state.borrow();
        let res = A::invoke_method(self, method_num, params);

        if res.is_err() {
            self.state.replace(prev_state);
        }
        self.in_call.replace(false);
        res
    }

    /// Verifies that all mock expectations have been met.
    pub fn verify(&self) {
        self.expectations.borrow_mut().verify()
    }

    /// Clears all mock expectations.
    pub fn reset(&self) {
        self.expectations.borrow_mut().reset();
    }

    ///// Mock expectations /////

    pub fn expect_validate_caller_addr(&self, addr: Vec<Address>) {
        assert!(!addr.is_empty(), "addrs must be non-empty");
        self.expectations.borrow_mut().expect_validate_caller_addr = Some(addr);
    }

    pub fn expect_validate_caller_type(&self, types: Vec<Type>) {
        assert!(!types.is_empty(), "types must be non-empty");
        self.expectations.borrow_mut().expect_validate_caller_type = Some(types);
    }

    pub fn expect_validate_caller_any(&self) {
        self.expectations.borrow_mut().expect_validate_caller_any = true;
    }

    pub fn expect_verify_consensus_fault(
        &self,
        h1: Vec<u8>,
        h2: Vec<u8>,
        extra: Vec<u8>,
        fault: Option<ConsensusFault>,
        exit_code: ExitCode,
    ) {
        self.expectations.borrow_mut().expect_verify_consensus_fault =
            Some(ExpectVerifyConsensusFault {
                block_header_1: h1,
                block_header_2: h2,
                block_header_extra: extra,
                fault,
                exit_code,
            });
    }

    pub fn expect_delete_actor(&self, beneficiary: Address) {
        self.expectations.borrow_mut().expect_delete_actor = Some(beneficiary);
    }

    pub fn expect_send_simple(
        &self,
        to: Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
        send_return: Option<IpldBlock>,
        exit_code: ExitCode,
    ) {
        self.expect_send(to, method, params, value, send_return, exit_code, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn expect_send(
        &self,
        to: Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
        send_return: Option<IpldBlock>,
        exit_code: ExitCode,
        send_error: Option<ErrorNumber>,
    ) {
        self.expectations.borrow_mut().expect_sends.push_back(ExpectedMessage {
            to,
            method,
            params,
            value,
            send_return,
            exit_code,
            send_error,
        })
    }

    pub fn expect_verify_seal(&self, seal: SealVerifyInfo, exit_code: ExitCode) {
        let a = ExpectVerifySeal { seal, exit_code };
        self.expectations.borrow_mut().expect_verify_seal = Some(a);
    }

    pub fn expect_verify_post(&self, post: WindowPoStVerifyInfo, exit_code: ExitCode) {
        let a = ExpectVerifyPoSt { post, exit_code };
        self.expectations.borrow_mut().expect_verify_post = Some(a);
    }

    pub fn set_received(&self, amount: TokenAmount) {
        self.value_received.replace(amount);
    }

    pub fn set_circulating_supply(&self, circ_supply: TokenAmount) {
        self.circulating_supply.replace(circ_supply);
    }

    pub fn set_epoch(&self, epoch: ChainEpoch) -> ChainEpoch {
        self.epoch.replace(epoch);
        epoch
    }

    pub fn expect_get_randomness_from_tickets(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: Vec<u8>,
        out: [u8; RANDOMNESS_LENGTH],
    ) {
        let a = ExpectRandomness { tag, epoch, entropy, out };
        self.expectations.borrow_mut().expect_get_randomness_tickets.push_back(a);
    }

    pub fn expect_get_randomness_from_beacon(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: Vec<u8>,
        out: [u8; RANDOMNESS_LENGTH],
    ) {
        let a = ExpectRandomness { tag, epoch, entropy, out };
        self.expectations.borrow_mut().expect_get_randomness_beacon.push_back(a);
    }

    ///// Private helpers /////

    fn require_in_call(&self) {
        assert!(*self.in_call.borrow(), "invalid runtime invocation outside of method call")
    }

    fn store_put<T: Serialize>(&self, o: &T) -> Cid {
        self.store.put_cbor(&o, Code::Blake2b256).unwrap()
    }

    fn store_get<T: DeserializeOwned>(&self, cid: &Cid) -> T {
        self.store.get_cbor(cid).unwrap().unwrap()
    }

    fn check_randomness(
        &self,
        expected: ExpectRandomness,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> [u8; RANDOMNESS_LENGTH] {
        assert!(epoch <= *self.epoch.borrow(), "attempt to get randomness from future");
        assert_eq!(
            expected.tag, tag,
            "unexpected domain separation tag, expected: {:?}, actual: {:?}",
            expected.tag, tag
        );
        assert_eq!(
            expected.epoch, epoch,
            "unexpected epoch, expected: {:?}, actual: {:?}",
            expected.epoch, epoch
        );
        assert_eq!(
            expected.entropy, *entropy,
            "unexpected entropy, expected {:?}, actual: {:?}",
            expected.entropy, entropy
        );
        expected.out
    }
}

impl MessageInfo for MockRuntime {
    fn caller(&self) -> Address {
        *self.caller.borrow()
    }
    fn receiver(&self) -> Address {
        self.receiver
    }
    fn value_received(&self) -> TokenAmount {
        self.value_received.borrow().clone()
    }
}

impl Runtime for MockRuntime {
    type Blockstore = Rc<MemoryBlockstore>;

    fn message(&self) -> &dyn MessageInfo {
        self.require_in_call();
        self
    }

    fn curr_epoch(&self) -> ChainEpoch {
        self.require_in_call();
        *self.epoch.borrow()
    }

    fn validate_immediate_caller_accept_any(&self) -> Result<(), ActorError> {
        self.require_in_call();
        assert!(
            self.expectations.borrow_mut().expect_validate_caller_any,
            "unexpected validate-caller-any"
        );
        self.expectations.borrow_mut().expect_validate_caller_any = false;
        Ok(())
    }

    fn validate_immediate_caller_is<'a, I>(&self, addresses: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Address>,
    {
        self.require_in_call();

        let addrs: Vec<Address> = addresses.into_iter().cloned().collect();

        let mut expectations = self.expectations.borrow_mut();
        let expected_addrs = expectations
            .expect_validate_caller_addr
            .take()
            .expect("unexpected validate caller addrs");
        assert_eq!(
            &addrs, &expected_addrs,
            "unexpected validate caller addrs {:?}, expected {:?}",
            addrs, expected_addrs
        );

        let caller = self.caller();
        if addrs.contains(&caller) {
            return Ok(());
        }
        Err(actor_error!(forbidden;
                "caller address {:?} forbidden, allowed: {:?}",
                caller, &addrs
        ))
    }

    fn validate_immediate_caller_type<'a, I>(&self, types: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Type>,
    {
        self.require_in_call();
        let types: Vec<Type> = types.into_iter().cloned().collect();
        let expected_caller_type = self
            .expectations
            .borrow_mut()
            .expect_validate_caller_type
            .take()
            .expect("unexpected validate caller code");
        assert_eq!(
            &types, &expected_caller_type,
            "unexpected validate caller code {:?}, expected {:?}",
            types, expected_caller_type,
        );

        let caller_type = *self.caller_type.borrow();
        if let Some(t) = ACTOR_TYPES.get(&caller_type) {
            if types.contains(t) {
                return Ok(());
            }
        }
        Err(actor_error!(forbidden; "caller type {:?} forbidden, allowed: {:?}",
                caller_type, types))
    }

    fn current_balance(&self) -> TokenAmount {
        self.require_in_call();
        self.balance.borrow().clone()
    }

    fn resolve_address(&self, address: &Address) -> Option<ActorID> {
        self.get_id_address(address).and_then(|a| a.id().ok())
    }

    fn get_actor_code_cid(&self, id: &ActorID) -> Option<Cid> {
        self.require_in_call();
        self.actor_code_cids.borrow().get(&Address::new_id(*id)).cloned()
    }

    fn resolve_builtin_actor_type(&self, code_id: &Cid) -> Option<Type> {
        self.require_in_call();
        ACTOR_TYPES.get(code_id).cloned()
    }

    fn get_randomness_from_tickets(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        let expected = self
            .expectations
            .borrow_mut()
            .expect_get_randomness_tickets
            .pop_front()
            .expect("unexpected call to get_randomness_from_tickets");
        Ok(self.check_randomness(expected, tag, epoch, entropy))
    }

    fn get_randomness_from_beacon(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        let expected = self
            .expectations
            .borrow_mut()
            .expect_get_randomness_beacon
            .pop_front()
            .expect("unexpected call to get_randomness_from_beacon");
        Ok(self.check_randomness(expected, tag, epoch, entropy))
    }

    fn get_state_root(&self) -> Result<Cid, ActorError> {
        Ok(self.state.borrow().unwrap_or(*EMPTY_ARR_CID))
    }

    fn set_state_root(&self, root: &Cid) -> Result<(), ActorError> {
        self.state.replace(Some(*root));
        Ok(())
    }

    fn transaction<S, RT, F>(&self, f: F) -> Result<RT, ActorError>
    where
        S: Serialize + DeserializeOwned,
        F: FnOnce(&mut S, &Self) -> Result<RT, ActorError>,
    {
        if *self.in_transaction.borrow() {
            return Err(actor_error!(assertion_failed; "nested transaction"));
        }
        let mut read_only = self.state()?;
        self.in_transaction.replace(true);
        let ret = f(&mut read_only, self);
        if ret.is_ok() {
            self.state.replace(Some(self.store_put(&read_only)));
        }
        self.in_transaction.replace(false);
        ret
    }

    fn store(&self) -> &Rc<MemoryBlockstore> {
        &self.store
    }

    fn send(
        &self,
        to: &Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
    ) -> Result<Response, SendError> {
        self.require_in_call();
        assert!(!*self.in_transaction.borrow(), "side-effect within transaction");

        let expected_msg = self.expectations.borrow_mut().expect_sends.pop_front();
        let expected_msg = match expected_msg {
            Some(m) => m,
            None => panic!(
                "unexpected message to: {:?} method: {:?}, value: {:?}, params: {:?}",
                to, method, value, params
            ),
        };

        assert!(
            expected_msg.to == *to
                && expected_msg.method == method
                && expected_msg.params == params
                && expected_msg.value == value,
            "message being sent does not match expectation.\n\
             Message  - to: {:?}, method: {:?}, value: {:?}, params: {:?}\n\
             Expected - to: {:?}, method: {:?}, value: {:?}, params: {:?}",
            to,
            method,
            value,
            params,
            expected_msg.to,
            expected_msg.method,
            expected_msg.value,
            expected_msg.params,
        );

        if let Some(e) = expected_msg.send_error {
            return Err(SendError(e));
        }

        {
            let mut balance = self.balance.borrow_mut();
            if value > *balance {
                return Err(SendError(ErrorNumber::InsufficientFunds));
            }
            *balance -= value;
        }

        Ok(Response { exit_code: expected_msg.exit_code, return_data: expected_msg.send_return })
    }

    fn delete_actor(&self, beneficiary: &Address) -> Result<(), ActorError> {
        self.require_in_call();
        assert!(!*self.in_transaction.borrow(), "side-effect within transaction");
        let exp_act = self.expectations.borrow_mut().expect_delete_actor.take();
        match exp_act {
            None => panic!("unexpected call to delete actor: {}", beneficiary),
            Some(exp) if exp != *beneficiary => {
                panic!("attempt to delete wrong actor. Expected: {}, got: {}", exp, beneficiary)
            }
            Some(_) => Ok(()),
        }
    }

    fn total_fil_circ_supply(&self) -> TokenAmount {
        self.circulating_supply.borrow().clone()
    }
}

impl Primitives for MockRuntime {
    fn hash_blake2b(&self, data: &[u8]) -> [u8; 32] {
        (*self.hash_func)(data)
    }
}

impl Verifier for MockRuntime {
    fn verify_seal(&self, seal: &SealVerifyInfo) -> anyhow::Result<()> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_seal
            .take()
            .expect("Unexpected syscall to verify seal");

        assert_eq!(exp.seal, *seal, "Unexpected seal verification");
        if exp.exit_code != ExitCode::OK {
            return Err(anyhow!(ActorError::unchecked(
                exp.exit_code,
                "Expected Failure".to_string(),
            )));
        }
        Ok(())
    }

    fn verify_post(&self, post: &WindowPoStVerifyInfo) -> anyhow::Result<()> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_post
            .take()
            .expect("Unexpected syscall to verify PoSt");

        assert_eq!(exp.post, *post, "Unexpected PoSt verification");
        if exp.exit_code != ExitCode::OK {
            return Err(anyhow!(ActorError::unchecked(
                exp.exit_code,
                "Expected Failure".to_string(),
            )));
        }
        Ok(())
    }

    fn verify_consensus_fault(
        &self,
        h1: &[u8],
        h2: &[u8],
        extra: &[u8],
    ) -> anyhow::Result<Option<ConsensusFault>> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_consensus_fault
            .take()
            .expect("Unexpected syscall to verify_consensus_fault");

        assert_eq!(exp.block_header_1, h1, "Header 1 mismatch");
        assert_eq!(exp.block_header_2, h2, "Header 2 mismatch");
        assert_eq!(exp.block_header_extra, extra, "Header extra mismatch");
        if exp.exit_code != ExitCode::OK {
            return Err(anyhow!(ActorError::unchecked(
                exp.exit_code,
                "Expected Failure".to_string(),
            )));
        }
        Ok(exp.fault)
    }
}

impl RuntimePolicy for MockRuntime {
    fn policy(&self) -> &Policy {
        &self.policy
    }
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    blake2b_simd::Params::new()
        .hash_length(32)
        .to_state()
        .update(data)
        .finalize()
        .as_bytes()
        .try_into()
        .unwrap()
}

fn make_cid(input: &[u8], prefix: u64, hash: u64) -> Cid {
    let digest = blake2b_256(input);
    Cid::new_v1(prefix, Multihash::wrap(hash, &digest).unwrap())
}

/// A CID shaped like a sealed sector commitment (CommR).
pub fn make_sealed_cid(input: &[u8]) -> Cid {
    make_cid(input, FIL_COMMITMENT_SEALED, POSEIDON_BLS12_381_A1_FC1)
}

/// A CID shaped like an unsealed data commitment (CommD).
pub fn make_piece_cid(input: &[u8]) -> Cid {
    make_cid(input, FIL_COMMITMENT_UNSEALED, SHA2_256_TRUNC254_PADDED)
}

pub fn new_bls_addr(s: u8) -> Address {
    let seed = [s; 32];
    let mut rng: StdRng = SeedableRng::from_seed(seed);
    let mut key = [0u8; 48];
    rng.fill_bytes(&mut key);
    Address::new_bls(&key).unwrap()
}
