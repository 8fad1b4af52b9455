// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::debug;
use salvage_ds::{DataStorage, DigestError, Result};
use salvage_fat::{is_free, Slot, Volume, FIRST_DATA_CLUSTER};
use sha1::{Digest, Sha1};

pub const DIGEST_LENGTH: usize = 20;

pub type Sha1Digest = [u8; DIGEST_LENGTH];

/// Parses a 40-character hexadecimal SHA-1 string.
pub fn parse_digest(hex_digest: &str) -> Result<Sha1Digest> {
    if hex_digest.len() != 2 * DIGEST_LENGTH {
        return Err(DigestError::InvalidHex.into());
    }
    let bytes = hex::decode(hex_digest).map_err(|_| DigestError::InvalidHex)?;
    let mut digest = [0; DIGEST_LENGTH];
    digest.copy_from_slice(&bytes);
    Ok(digest)
}

pub fn digest_matches(bytes: &[u8], expected: &Sha1Digest) -> bool {
    let digest: Sha1Digest = Sha1::digest(bytes).into();
    digest == *expected
}

/// Rearranges the values into their lexicographic successor; false when
/// they are in descending order, which is the last permutation.
pub fn next_permutation(values: &mut [u32]) -> bool {
    let Some(pivot) = values.windows(2).rposition(|pair| pair[0] < pair[1]) else {
        return false;
    };
    let successor = values
        .iter()
        .rposition(|&value| value > values[pivot])
        .unwrap();
    values.swap(pivot, successor);
    values[pivot + 1..].reverse();
    true
}

/// Bounds of the free-cluster permutation search.
#[derive(Debug, Clone, Copy)]
pub struct SearchBounds {
    /// Longest chain the search will attempt.
    pub max_chain: usize,
    /// Exclusive upper bound of the free-cluster scan.
    pub free_scan_limit: u32,
}

impl Default for SearchBounds {
    fn default() -> Self {
        Self {
            max_chain: 5,
            free_scan_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverOutcome {
    NotFound,
    Recovered { with_digest: bool, ambiguous: bool },
}

/// Deleted-file recovery over a volume. A candidate is a deleted root
/// record that is neither a long-name component, a volume label nor a
/// directory; committing one re-links its cluster chain in every FAT copy
/// and rewrites the first name byte. Nothing is ever rolled back.
pub struct Recovery<'vol, DS: DataStorage> {
    volume: &'vol Volume<DS>,
    bounds: SearchBounds,
}

impl<'vol, DS: DataStorage> Recovery<'vol, DS> {
    pub fn new(volume: &'vol Volume<DS>) -> Self {
        Self::with_bounds(volume, SearchBounds::default())
    }

    pub fn with_bounds(volume: &'vol Volume<DS>, bounds: SearchBounds) -> Self {
        Self { volume, bounds }
    }

    fn is_candidate(slot: &Slot) -> bool {
        let entry = &slot.entry;
        entry.is_deleted()
            && !entry.is_long_name()
            && !entry.is_volume_label()
            && !entry.is_directory()
    }

    fn candidates(&self, name: &str, first: u8) -> Result<Vec<Slot>> {
        let mut candidates = Vec::new();
        for slot in self.volume.root_entries() {
            let slot = slot?;
            if Self::is_candidate(&slot) && slot.entry.name_bytes_with(first) == name.as_bytes() {
                candidates.push(slot);
            }
        }
        Ok(candidates)
    }

    /// Re-links the chain a contiguous file would have occupied and undoes
    /// the deletion mark.
    fn commit_contiguous(&self, slot: &Slot, first: u8) -> Result<()> {
        let chain = self
            .volume
            .contiguous_chain(slot.entry.first_cluster(), slot.entry.file_size());
        self.volume.commit_chain(&chain)?;
        self.volume.restore_slot_name(slot, first)
    }

    /// Recovers the first deleted record matching `name`, assuming its
    /// clusters are contiguous. With a digest, a candidate is accepted only
    /// if the content materialized by following the FAT from its recorded
    /// first cluster verifies; links cleared by deletion end that read
    /// after one cluster, so multi-cluster files can only verify when their
    /// links happen to survive.
    pub fn recover_named(&self, name: &str, digest: Option<&Sha1Digest>) -> Result<RecoverOutcome> {
        let Some(&first) = name.as_bytes().first() else {
            return Ok(RecoverOutcome::NotFound);
        };
        let mut matches = Vec::new();
        for slot in self.candidates(name, first)? {
            if let Some(digest) = digest {
                let bytes = self.volume.read_following_fat(
                    slot.entry.first_cluster(),
                    slot.entry.file_size() as usize,
                )?;
                if !digest_matches(&bytes, digest) {
                    continue;
                }
            }
            matches.push(slot);
        }
        let Some(slot) = matches.first() else {
            return Ok(RecoverOutcome::NotFound);
        };
        self.commit_contiguous(slot, first)?;
        Ok(RecoverOutcome::Recovered {
            with_digest: digest.is_some(),
            ambiguous: matches.len() > 1,
        })
    }

    /// Recovers the first deleted record matching `name` whose content can
    /// be reassembled, in any order, from the leading free clusters of the
    /// volume. The ordering that verified is the chain that gets committed.
    pub fn recover_fragmented(&self, name: &str, digest: &Sha1Digest) -> Result<RecoverOutcome> {
        let Some(&first) = name.as_bytes().first() else {
            return Ok(RecoverOutcome::NotFound);
        };
        let mut matches = Vec::new();
        for slot in self.candidates(name, first)? {
            if let Some(chain) = self.search_permutations(slot.entry.file_size(), digest)? {
                matches.push((slot, chain));
            }
        }
        let Some((slot, chain)) = matches.first() else {
            return Ok(RecoverOutcome::NotFound);
        };
        self.volume.commit_chain(chain)?;
        self.volume.restore_slot_name(slot, first)?;
        Ok(RecoverOutcome::Recovered {
            with_digest: true,
            ambiguous: matches.len() > 1,
        })
    }

    /// Tries every ordering of the first free clusters against the digest
    /// and returns the one that verified.
    fn search_permutations(&self, file_size: u32, digest: &Sha1Digest) -> Result<Option<Vec<u32>>> {
        let count = file_size.div_ceil(self.volume.bytes_per_cluster()) as usize;
        if count == 0 {
            return Ok(digest_matches(&[], digest).then(Vec::new));
        }
        if count > self.bounds.max_chain {
            debug!(
                "A {count}-cluster chain exceeds the search bound ({})",
                self.bounds.max_chain
            );
            return Ok(None);
        }

        let mut clusters = Vec::with_capacity(count);
        let mut cluster = FIRST_DATA_CLUSTER;
        while clusters.len() < count {
            while cluster < self.bounds.free_scan_limit && !is_free(self.volume.fat(0, cluster)?) {
                cluster += 1;
            }
            if cluster >= self.bounds.free_scan_limit {
                return Ok(None);
            }
            clusters.push(cluster);
            cluster += 1;
        }

        loop {
            let bytes = self.volume.read_sequence(&clusters, file_size as usize)?;
            if digest_matches(&bytes, digest) {
                return Ok(Some(clusters));
            }
            if !next_permutation(&mut clusters) {
                return Ok(None);
            }
        }
    }

    /// Recovers every deleted record matching `name`, in discovery order,
    /// and returns how many there were.
    pub fn recover_all_named(&self, name: &str) -> Result<usize> {
        let Some(&first) = name.as_bytes().first() else {
            return Ok(0);
        };
        let matches = self.candidates(name, first)?;
        for slot in &matches {
            self.commit_contiguous(slot, first)?;
        }
        Ok(matches.len())
    }

    /// Recovers every deleted record, with '_' standing in for the lost
    /// first name character. Records without content (zero size or a first
    /// cluster below 2) get their name back but no FAT chain. Returns the
    /// recovered names in discovery order.
    pub fn recover_all_deleted(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for slot in self.volume.root_entries() {
            let slot = slot?;
            if !Self::is_candidate(&slot) {
                continue;
            }
            let entry = &slot.entry;
            if entry.file_size() > 0 && entry.first_cluster() >= FIRST_DATA_CLUSTER {
                let chain = self
                    .volume
                    .contiguous_chain(entry.first_cluster(), entry.file_size());
                self.volume.commit_chain(&chain)?;
            }
            self.volume.restore_slot_name(&slot, b'_')?;
            recovered.push(entry.name_with(b'_'));
        }
        Ok(recovered)
    }
}
