// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;

use anyhow::anyhow;
use cid::Cid;
use fil_actors_runtime::{ActorDowncast, Array};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::{ChainEpoch, QuantSpec};

/// Wrapper for working with an AMT[ChainEpoch]*Bitfield functioning as a queue, bucketed by epoch.
/// Keys in the queue are quantized (upwards), modulo some offset, to reduce the cardinality of keys.
pub struct BitFieldQueue<'db, BS> {
    pub amt: Array<'db, BitField, BS>,
    quant: QuantSpec,
}

impl<'db, BS: Blockstore> BitFieldQueue<'db, BS> {
    pub fn new(store: &'db BS, root: &Cid, quant: QuantSpec) -> anyhow::Result<Self> {
        let amt = Array::load(root, store)
            .map_err(|e| e.downcast_wrap("failed to load bitfield queue"))?;
        Ok(Self { amt, quant })
    }

    /// Adds values to the queue entry for an epoch.
    pub fn add_to_queue(&mut self, raw_epoch: ChainEpoch, values: &BitField) -> anyhow::Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let epoch = self.quant.quantize_up(raw_epoch);
        let key = u64::try_from(epoch).map_err(|_| anyhow!("negative queue epoch {}", epoch))?;

        let merged = match self
            .amt
            .get(key)
            .map_err(|e| e.downcast_wrap(format!("failed to lookup queue epoch {}", epoch)))?
        {
            Some(existing) => existing | values,
            None => values.clone(),
        };

        self.amt
            .set(key, merged)
            .map_err(|e| e.downcast_wrap(format!("failed to set queue epoch {}", epoch)))?;
        Ok(())
    }

    pub fn add_to_queue_values(
        &mut self,
        epoch: ChainEpoch,
        values: impl IntoIterator<Item = u64>,
    ) -> anyhow::Result<()> {
        let bf = BitField::try_from_bits(values)
            .map_err(|e| anyhow!("failed to build queue values: {}", e))?;
        self.add_to_queue(epoch, &bf)
    }

    /// Adds many (epoch, value) pairs to the queue, grouping them by quantized epoch so that
    /// each queue entry is written once.
    pub fn add_many_to_queue_values(
        &mut self,
        values: impl IntoIterator<Item = (ChainEpoch, u64)>,
    ) -> anyhow::Result<()> {
        let mut grouped: BTreeMap<ChainEpoch, Vec<u64>> = BTreeMap::new();
        for (raw_epoch, value) in values {
            grouped.entry(self.quant.quantize_up(raw_epoch)).or_default().push(value);
        }

        for (epoch, mut group) in grouped {
            group.sort_unstable();
            group.dedup();
            self.add_to_queue_values(epoch, group)?;
        }
        Ok(())
    }

    /// Removes and returns all values with keys less than or equal to until.
    /// Modified return value indicates whether this structure has been changed by the call.
    pub fn pop_until(&mut self, until: ChainEpoch) -> anyhow::Result<(BitField, bool)> {
        let mut popped_values = Vec::<BitField>::new();
        let mut popped_keys = Vec::<u64>::new();

        self.amt
            .for_each_while(|epoch, bitfield| {
                if epoch as ChainEpoch > until {
                    return Ok(false);
                }
                popped_keys.push(epoch);
                popped_values.push(bitfield.clone());
                Ok(true)
            })
            .map_err(|e| e.downcast_wrap("failed to walk bitfield queue"))?;

        if popped_keys.is_empty() {
            return Ok((BitField::new(), false));
        }

        self.amt
            .batch_delete(popped_keys, true)
            .map_err(|e| e.downcast_wrap("failed to delete popped queue entries"))?;
        Ok((BitField::union(&popped_values), true))
    }

    pub fn flush(&mut self) -> anyhow::Result<Cid> {
        self.amt.flush().map_err(|e| e.downcast_wrap("failed to flush bitfield queue"))
    }
}
