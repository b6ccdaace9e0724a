// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Reed-Solomon coding of values across the primaries of a cluster.
//!
//! A value is coded as four independent GF(2^16) words. Backup `b` holds, for every stripe, the
//! codeword `sum_s M[b][s] * data[s]` where `M` is the parity part of a systematic generator
//! matrix, so a single source can be folded in or out without touching the others.

use reed_solomon_erasure::galois_16::{self, ReedSolomon};
use reed_solomon_erasure::Field as _;
use std::collections::BTreeSet;

use crate::error::Error;
use fusion_transport::Value;

type Gf = galois_16::Field;
type Elem = [u8; 2];

const LANES: usize = 4;

fn split(value: Value) -> [Elem; LANES] {
    std::array::from_fn(|i| ((value >> (16 * i)) as u16).to_be_bytes())
}

fn join(lanes: &[Elem]) -> Value {
    lanes.iter().enumerate().fold(0, |acc, (i, lane)| {
        acc | (u16::from_be_bytes(*lane) as Value) << (16 * i)
    })
}

/// Coding oracle of one cluster shape.
///
/// Immutable after construction; share it behind an `Arc` to use it from several tasks.
pub struct Coder {
    primaries: usize,
    faults: usize,
    codec: ReedSolomon,
    coefficients: Vec<Vec<Elem>>,
}

impl Coder {
    /// Builds the code for `primaries` sources and `faults` backups.
    ///
    /// Fails with `Error::InvalidCluster` if the shape cannot be coded over GF(2^16).
    pub fn new(primaries: usize, faults: usize) -> Result<Self, Error> {
        let codec = ReedSolomon::new(primaries, faults).map_err(|e| {
            Error::InvalidCluster(format!(
                "cannot build a {}+{} Reed-Solomon code: {:?}",
                primaries, faults, e
            ))
        })?;

        // encoding the unit vectors reads the parity rows of the generator matrix column by column
        let mut coefficients = vec![vec![Gf::zero(); primaries]; faults];
        let mut data = vec![vec![Gf::zero()]; primaries];
        let mut parity = vec![vec![Gf::zero()]; faults];
        for source in 0..primaries {
            data[source][0] = Gf::one();
            codec
                .encode_sep(&data, &mut parity)
                .map_err(|e| Error::InvalidCluster(format!("encoding failed: {:?}", e)))?;
            for (row, shard) in coefficients.iter_mut().zip(&parity) {
                row[source] = shard[0];
            }
            data[source][0] = Gf::zero();
        }

        Ok(Self {
            primaries,
            faults,
            codec,
            coefficients,
        })
    }

    pub fn primaries(&self) -> usize {
        self.primaries
    }

    pub fn faults(&self) -> usize {
        self.faults
    }

    /// Replaces the contribution of `source_index` to a codeword of backup `backup_position`.
    ///
    /// # Arguments
    ///
    /// * `code` - The current codeword.
    /// * `backup_position` - The code position of the backup holding the codeword.
    /// * `old` - The value the source contributed so far, 0 if none.
    /// * `new` - The value the source contributes from now on, 0 to fold it out.
    /// * `source_index` - The registration index of the source.
    ///
    /// # Returns
    ///
    /// The updated codeword.
    ///
    /// # Panics
    ///
    /// Panics if `backup_position` or `source_index` is outside the shape of the code.
    pub fn encode_update(
        &self,
        code: Value,
        backup_position: usize,
        old: Value,
        new: Value,
        source_index: usize,
    ) -> Value {
        let coefficient = self.coefficients[backup_position][source_index];
        let mut lanes = split(code);
        for (lane, delta) in lanes.iter_mut().zip(split(old ^ new)) {
            *lane = Gf::add(*lane, Gf::mul(coefficient, delta));
        }
        join(&lanes)
    }

    /// Computes the full codeword of backup `backup_position` for a source vector.
    pub fn encode(&self, backup_position: usize, data: &[Value]) -> Value {
        data.iter().enumerate().fold(0, |code, (source, value)| {
            self.encode_update(code, backup_position, 0, *value, source)
        })
    }

    /// Reconstructs the erased sources of one stripe.
    ///
    /// # Arguments
    ///
    /// * `codewords` - The codeword of every backup, in code position order.
    /// * `partial_data` - The source vector; erased entries are placeholders.
    /// * `erasures` - The erased source indices, padded with `None` up to `faults + 1` entries.
    ///
    /// # Returns
    ///
    /// The complete source vector, or `Error::UnrecoverableErasure` if the system cannot be solved.
    pub fn recover(
        &self,
        codewords: &[Value],
        partial_data: &[Value],
        erasures: &[Option<usize>],
    ) -> Result<Vec<Value>, Error> {
        if codewords.len() != self.faults {
            return Err(Error::UnrecoverableErasure(format!(
                "expected {} codewords, got {}",
                self.faults,
                codewords.len()
            )));
        }
        if partial_data.len() != self.primaries {
            return Err(Error::UnrecoverableErasure(format!(
                "expected {} sources, got {}",
                self.primaries,
                partial_data.len()
            )));
        }
        if erasures.len() > self.faults + 1 {
            return Err(Error::UnrecoverableErasure(format!(
                "erasure list of {} entries exceeds {}",
                erasures.len(),
                self.faults + 1
            )));
        }

        let erased: BTreeSet<usize> = erasures.iter().flatten().copied().collect();
        if erased.len() > self.faults {
            return Err(Error::UnrecoverableErasure(format!(
                "{} sources erased but only {} codewords available",
                erased.len(),
                self.faults
            )));
        }
        if let Some(index) = erased.iter().find(|&&i| i >= self.primaries) {
            return Err(Error::UnrecoverableErasure(format!(
                "erased source {} is out of range",
                index
            )));
        }
        if erased.is_empty() {
            return Ok(partial_data.to_vec());
        }

        let mut shards: Vec<Option<Vec<Elem>>> = partial_data
            .iter()
            .enumerate()
            .map(|(source, value)| (!erased.contains(&source)).then(|| split(*value).to_vec()))
            .chain(codewords.iter().map(|code| Some(split(*code).to_vec())))
            .collect();
        self.codec
            .reconstruct_data(&mut shards)
            .map_err(|e| Error::UnrecoverableErasure(format!("{:?}", e)))?;

        shards
            .into_iter()
            .take(self.primaries)
            .enumerate()
            .map(|(source, shard)| {
                shard.map(|lanes| join(&lanes)).ok_or_else(|| {
                    Error::UnrecoverableErasure(format!("source {} was not reconstructed", source))
                })
            })
            .collect()
    }
}
