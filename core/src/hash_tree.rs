//! Binary hash tree over an ordered sequence of data blocks.
//!
//! - Leaf digest = SHA256(block)
//! - Parent digest = SHA256(left || right), pairing left to right
//! - A level with an odd number of digests duplicates its last digest before pairing,
//!   at every level, not only at the leaves
//!
//! Only the root digest and, for verification, a [`MerkleProof`] ever leave the process
//! that built the tree.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;

pub const DIGEST_LEN: usize = 32;

/// A SHA256 digest, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Digest(hasher.finalize().into())
}

/// Which side of the running digest a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Digest,
    pub side: Side,
}

/// Sibling path from one leaf up to the root, ordered leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub path: Vec<ProofStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashTreeError {
    #[error("cannot build a hash tree over zero blocks")]
    Empty,

    #[error("block index {index} out of range for a tree of {leaves} leaves")]
    IndexOutOfRange { index: usize, leaves: usize },
}

/// Immutable hash tree. Rebuild it when the blocks change.
#[derive(Debug, Clone)]
pub struct HashTree {
    // levels[0] holds the leaf digests, the last level holds only the root.
    // Levels are stored unpadded; duplication happens while pairing.
    levels: Vec<Vec<Digest>>,
}

impl HashTree {
    /// Build a tree over `blocks`. An empty sequence is rejected.
    pub fn build<B: AsRef<[u8]>>(blocks: &[B]) -> Result<Self, HashTreeError> {
        let leaves = blocks.iter().map(|b| Digest::of(b.as_ref())).collect();
        Self::from_leaf_digests(leaves)
    }

    /// Build a tree from already computed leaf digests.
    pub fn from_leaf_digests(leaves: Vec<Digest>) -> Result<Self, HashTreeError> {
        if leaves.is_empty() {
            return Err(HashTreeError::Empty);
        }

        let mut levels = vec![leaves];
        loop {
            let current = &levels[levels.len() - 1];
            if current.len() == 1 {
                break;
            }
            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    let right = pair.get(1).unwrap_or(left);
                    hash_pair(left, right)
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    pub fn root(&self) -> Digest {
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    /// Sibling path proving the block at `index` belongs to this tree.
    pub fn proof(&self, index: usize) -> Result<MerkleProof, HashTreeError> {
        let leaves = self.leaf_count();
        if index >= leaves {
            return Err(HashTreeError::IndexOutOfRange { index, leaves });
        }

        let mut path = Vec::with_capacity(self.levels.len() - 1);
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if idx % 2 == 0 {
                // The last digest of an odd level is paired with itself.
                let sibling = level.get(idx + 1).copied().unwrap_or(level[idx]);
                ProofStep {
                    sibling,
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    sibling: level[idx - 1],
                    side: Side::Left,
                }
            };
            path.push(step);
            idx /= 2;
        }

        Ok(MerkleProof {
            leaf_index: index,
            path,
        })
    }
}

/// Root digest of `blocks`.
pub fn root_of<B: AsRef<[u8]>>(blocks: &[B]) -> Result<Digest, HashTreeError> {
    HashTree::build(blocks).map(|tree| tree.root())
}

/// Number of pairing levels between the leaves and the root of a tree over
/// `leaf_count` blocks.
pub fn depth(leaf_count: usize) -> usize {
    let mut width = leaf_count;
    let mut depth = 0;
    while width > 1 {
        width = width.div_ceil(2);
        depth += 1;
    }
    depth
}

/// Check `block` against `expected_root` as leaf `proof.leaf_index` of a tree over
/// `leaf_count` blocks.
///
/// The side of every sibling follows from the leaf index, so a proof is only accepted
/// for the position it was issued for. Its length must match the tree depth.
pub fn verify(
    block: &[u8],
    proof: &MerkleProof,
    leaf_count: usize,
    expected_root: &Digest,
) -> bool {
    if proof.leaf_index >= leaf_count || proof.path.len() != depth(leaf_count) {
        return false;
    }

    let mut idx = proof.leaf_index;
    let mut acc = Digest::of(block);
    for step in &proof.path {
        let side = if idx % 2 == 0 { Side::Right } else { Side::Left };
        if step.side != side {
            return false;
        }
        acc = match side {
            Side::Left => hash_pair(&step.sibling, &acc),
            Side::Right => hash_pair(&acc, &step.sibling),
        };
        idx /= 2;
    }
    acc == *expected_root
}
