// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashSet;

use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::RegisteredSealProof;

// A trait for runtime policy configuration
pub trait RuntimePolicy {
    fn policy(&self) -> &Policy;
}

/// A numerator/denominator pair used for the provisional economic ratios.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self { numerator, denominator }
    }
}

/// Specification for a linear vesting schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VestSpec {
    /// Delay before any amount starts vesting.
    pub initial_delay: ChainEpoch,
    /// Period over which the total should vest, after the initial delay.
    pub vest_period: ChainEpoch,
    /// Duration between successive incremental vests (independent of vesting period).
    pub step_duration: ChainEpoch,
    /// Maximum precision of vesting table (limits cardinality of table).
    pub quantization: ChainEpoch,
}

// The policy itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    /// The period over which all a miner's active sectors will be challenged.
    pub wpost_proving_period: ChainEpoch,
    /// The duration of a deadline's challenge window, the period before a deadline when the challenge is available.
    pub wpost_challenge_window: ChainEpoch,
    /// The number of non-overlapping PoSt deadlines in each proving period.
    pub wpost_period_deadlines: u64,
    /// The maximum distance back that a valid Window PoSt must commit to the current chain.
    pub wpost_max_chain_commit_age: ChainEpoch,
    /// Lookback from the deadline's challenge window opening from which to sample chain randomness for the challenge seed.
    pub wpost_challenge_lookback: ChainEpoch,
    /// Minimum period before a deadline's challenge window opens that a fault must be declared for that deadline.
    pub fault_declaration_cutoff: ChainEpoch,
    /// The maximum age of a fault before the sector is terminated.
    pub fault_max_age: ChainEpoch,

    /// The maximum number of sectors that a miner can have simultaneously active.
    pub sectors_max: usize,
    /// The maximum number of partitions that may be required to be loaded in a single invocation.
    pub addressed_partitions_max: u64,
    /// The maximum number of sector infos that may be required to be loaded in a single invocation.
    pub addressed_sectors_max: u64,
    /// The maximum number of fault, recovery or extension declarations in a single message.
    pub declarations_max: u64,
    /// The maximum number of new sectors that may be staged by a miner during a single proving period.
    pub new_sectors_per_period_max: usize,
    /// Maximum number of control addresses a miner may register.
    pub max_control_addresses: usize,
    /// Maximum size of a peer ID, in bytes.
    pub max_peer_id_length: usize,
    /// Maximum total size of a miner's multiaddrs, in bytes.
    pub max_multiaddr_data: usize,

    /// Epochs after which chain state is final.
    pub chain_finality: ChainEpoch,
    /// Number of epochs between publishing the precommit and when the challenge for interactive PoRep is drawn.
    pub pre_commit_challenge_delay: ChainEpoch,
    /// Maximum number of epochs between precommit and prove-commit.
    pub max_prove_commit_duration: ChainEpoch,
    /// Staging period for a miner worker key change.
    pub worker_key_change_delay: ChainEpoch,
    /// Minimum number of epochs past the current epoch a sector may be set to expire.
    pub min_sector_expiration: ChainEpoch,
    /// Maximum number of epochs past the current epoch a sector may be set to expire.
    pub max_sector_expiration_extension: ChainEpoch,
    /// Ratio of sector size to maximum deals per sector.
    pub deal_limit_denominator: u64,
    /// Seal proof types that new miners and sectors may use.
    pub valid_pre_commit_proof_type: HashSet<RegisteredSealProof>,

    /// Projection period of expected reward charged as precommit deposit.
    pub pre_commit_deposit_projection_period: ChainEpoch,
    /// Projection period of expected reward forming the base of the initial pledge.
    pub initial_pledge_projection_period: ChainEpoch,
    /// Share of circulating supply targeted for pledge lock-up.
    pub initial_pledge_lock_target: Ratio,
    /// Cap on initial pledge per byte of quality-adjusted power, in attoFIL.
    pub initial_pledge_max_per_byte: u64,
    /// Days of expected reward charged per proving period for a declared or continued fault, as a ratio.
    pub declared_fault_factor: Ratio,
    /// Days of expected reward charged for a fault detected without declaration, as a ratio.
    pub undeclared_fault_factor: Ratio,
    /// Maximum number of days of reward a terminated sector is penalized for its age.
    pub termination_lifetime_cap: ChainEpoch,
    /// Initial share of the miner's balance paid to a consensus fault reporter.
    pub consensus_fault_reporter_initial_share: Ratio,
    /// Per-epoch growth of the reporter share since the fault.
    pub consensus_fault_reporter_share_growth_rate: Ratio,
    /// Upper bound of the reporter share.
    pub consensus_fault_reporter_max_share: Ratio,
    /// Vesting schedule for block rewards and locked funds.
    pub reward_vesting_spec: VestSpec,
}

impl Policy {
    /// Checks that the proving schedule parameters are mutually consistent.
    pub fn check(&self) -> Result<(), String> {
        if self.wpost_challenge_window <= 0 {
            return Err(format!("invalid challenge window {}", self.wpost_challenge_window));
        }
        if self.wpost_proving_period % self.wpost_challenge_window != 0 {
            return Err(format!(
                "incompatible proving period {} and challenge window {}",
                self.wpost_proving_period, self.wpost_challenge_window
            ));
        }
        if self.wpost_period_deadlines as ChainEpoch * self.wpost_challenge_window
            != self.wpost_proving_period
        {
            return Err(format!(
                "incompatible proving period {} and {} deadlines of {} epochs",
                self.wpost_proving_period, self.wpost_period_deadlines, self.wpost_challenge_window
            ));
        }
        if self.fault_declaration_cutoff < self.wpost_challenge_lookback {
            return Err(format!(
                "fault declaration cutoff {} is less than challenge lookback {}",
                self.fault_declaration_cutoff, self.wpost_challenge_lookback
            ));
        }
        Ok(())
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            wpost_proving_period: policy_constants::WPOST_PROVING_PERIOD,
            wpost_challenge_window: policy_constants::WPOST_CHALLENGE_WINDOW,
            wpost_period_deadlines: policy_constants::WPOST_PERIOD_DEADLINES,
            wpost_max_chain_commit_age: policy_constants::WPOST_CHALLENGE_WINDOW,
            wpost_challenge_lookback: policy_constants::WPOST_CHALLENGE_LOOKBACK,
            fault_declaration_cutoff: policy_constants::FAULT_DECLARATION_CUTOFF,
            fault_max_age: policy_constants::FAULT_MAX_AGE,
            sectors_max: policy_constants::SECTORS_MAX,
            addressed_partitions_max: policy_constants::ADDRESSED_PARTITIONS_MAX,
            addressed_sectors_max: policy_constants::ADDRESSED_SECTORS_MAX,
            declarations_max: policy_constants::DECLARATIONS_MAX,
            new_sectors_per_period_max: policy_constants::NEW_SECTORS_PER_PERIOD_MAX,
            max_control_addresses: policy_constants::MAX_CONTROL_ADDRESSES,
            max_peer_id_length: policy_constants::MAX_PEER_ID_LENGTH,
            max_multiaddr_data: policy_constants::MAX_MULTIADDR_DATA,
            chain_finality: policy_constants::CHAIN_FINALITY,
            pre_commit_challenge_delay: policy_constants::PRE_COMMIT_CHALLENGE_DELAY,
            max_prove_commit_duration: policy_constants::MAX_PROVE_COMMIT_DURATION,
            worker_key_change_delay: policy_constants::CHAIN_FINALITY,
            min_sector_expiration: policy_constants::MIN_SECTOR_EXPIRATION,
            max_sector_expiration_extension: policy_constants::MAX_SECTOR_EXPIRATION_EXTENSION,
            deal_limit_denominator: policy_constants::DEAL_LIMIT_DENOMINATOR,
            valid_pre_commit_proof_type: supported_seal_proofs(),
            pre_commit_deposit_projection_period:
                policy_constants::PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD,
            initial_pledge_projection_period: policy_constants::INITIAL_PLEDGE_PROJECTION_PERIOD,
            initial_pledge_lock_target: Ratio::new(3, 10),
            initial_pledge_max_per_byte: policy_constants::INITIAL_PLEDGE_MAX_PER_BYTE,
            declared_fault_factor: Ratio::new(214, 100),
            undeclared_fault_factor: Ratio::new(50, 10),
            termination_lifetime_cap: policy_constants::TERMINATION_LIFETIME_CAP,
            consensus_fault_reporter_initial_share: Ratio::new(1, 1000),
            consensus_fault_reporter_share_growth_rate: Ratio::new(101251, 100000),
            consensus_fault_reporter_max_share: Ratio::new(1, 2),
            reward_vesting_spec: VestSpec {
                initial_delay: 0,
                vest_period: 180 * crate::EPOCHS_IN_DAY,
                step_duration: crate::EPOCHS_IN_DAY,
                quantization: 12 * crate::EPOCHS_IN_HOUR,
            },
        }
    }
}

fn supported_seal_proofs() -> HashSet<RegisteredSealProof> {
    let mut proofs = HashSet::new();
    #[cfg(feature = "sector-2k")]
    proofs.insert(RegisteredSealProof::StackedDRG2KiBV1P1);
    #[cfg(feature = "sector-8m")]
    proofs.insert(RegisteredSealProof::StackedDRG8MiBV1P1);
    #[cfg(feature = "sector-512m")]
    proofs.insert(RegisteredSealProof::StackedDRG512MiBV1P1);
    #[cfg(feature = "sector-32g")]
    proofs.insert(RegisteredSealProof::StackedDRG32GiBV1P1);
    #[cfg(feature = "sector-64g")]
    proofs.insert(RegisteredSealProof::StackedDRG64GiBV1P1);
    proofs
}

pub mod policy_constants {
    use fvm_shared::clock::ChainEpoch;

    use crate::builtin::*;

    /// 24 hours
    pub const WPOST_PROVING_PERIOD: ChainEpoch = EPOCHS_IN_DAY;
    /// 30 minutes (48 per day)
    pub const WPOST_CHALLENGE_WINDOW: ChainEpoch = 30 * 60 / EPOCH_DURATION_SECONDS;
    pub const WPOST_PERIOD_DEADLINES: u64 = 48;
    pub const WPOST_CHALLENGE_LOOKBACK: ChainEpoch = 20;
    pub const FAULT_DECLARATION_CUTOFF: ChainEpoch = WPOST_CHALLENGE_LOOKBACK + 50;
    pub const FAULT_MAX_AGE: ChainEpoch = WPOST_PROVING_PERIOD * 14;

    pub const SECTORS_MAX: usize = 32 << 20;
    pub const ADDRESSED_PARTITIONS_MAX: u64 = 200;
    pub const ADDRESSED_SECTORS_MAX: u64 = 10_000;
    pub const DECLARATIONS_MAX: u64 = ADDRESSED_PARTITIONS_MAX;
    pub const NEW_SECTORS_PER_PERIOD_MAX: usize = 128 << 10;
    pub const MAX_CONTROL_ADDRESSES: usize = 10;
    pub const MAX_PEER_ID_LENGTH: usize = 128;
    pub const MAX_MULTIADDR_DATA: usize = 1024;

    pub const CHAIN_FINALITY: ChainEpoch = 900;

    #[cfg(not(feature = "short-precommit"))]
    pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 150;
    #[cfg(feature = "short-precommit")]
    pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 10;

    pub const MAX_PROVE_COMMIT_DURATION: ChainEpoch = EPOCHS_IN_DAY + PRE_COMMIT_CHALLENGE_DELAY;
    pub const MIN_SECTOR_EXPIRATION: ChainEpoch = 180 * EPOCHS_IN_DAY;
    pub const MAX_SECTOR_EXPIRATION_EXTENSION: ChainEpoch = 540 * EPOCHS_IN_DAY;
    /// Limits 32GiB sectors to 256 deals and 64GiB sectors to 512
    pub const DEAL_LIMIT_DENOMINATOR: u64 = 134217728;

    pub const PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD: ChainEpoch = 20 * EPOCHS_IN_DAY;
    pub const INITIAL_PLEDGE_PROJECTION_PERIOD: ChainEpoch = 20 * EPOCHS_IN_DAY;
    /// 1 FIL per 32GiB, which does not divide evenly.
    pub const INITIAL_PLEDGE_MAX_PER_BYTE: u64 = 1_000_000_000_000_000_000 / (32 << 30);
    pub const TERMINATION_LIFETIME_CAP: ChainEpoch = 180;
}
