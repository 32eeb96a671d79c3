//! Binary Merkle tree over fixed-size file blocks.
//!
//! ## Construction
//!
//! The data items of the tree are the SHA-256 [leaf digests](crate::hashing::leaf_digest)
//! of the file's blocks, in block order. The tree itself is unsorted,
//! non-salted and uses SHA3-512 throughout:
//!
//! ```text
//! width      = next_power_of_two(leaf count)
//! node[w+i]  = SHA3-512(digest_i)            for i < leaf count
//! node[w+i]  = 0^64                          padding leaves
//! node[k]    = SHA3-512(node[2k] ‖ node[2k+1])  for k = w-1 .. 1
//! root       = node[1]
//! ```
//!
//! Node 0 is unused. The final block may be shorter than the block size and
//! is never padded before hashing.
//!
//! ## Proofs
//!
//! A proof for leaf `i` lists the sibling of every node on the path from
//! `node[w+i]` up to (but excluding) the root. Verification rehashes upwards,
//! placing the running hash on the left when its position is even.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::hashing::{leaf_digest, sha3_512, Node, NODE_LEN};
use crate::{CryptoError, Result};

/// Name of the node hash recorded in exported trees.
pub const TREE_HASH_NAME: &str = "sha3-512";

/// A complete Merkle tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleTree {
    /// Flat node array, `nodes.len() == 2 * width`.
    nodes: Vec<Node>,
}

/// Inclusion proof for a single leaf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Sibling hashes from the leaf level upwards.
    #[serde(with = "base64_nodes")]
    pub hashes: Vec<Node>,
    /// Position of the leaf among the tree's leaves.
    pub index: u64,
}

/// Serialized form written to `<fid>.tree`.
#[derive(Serialize, Deserialize)]
struct ExportedTree {
    salt: bool,
    sorted: bool,
    hash: String,
    nodes: Vec<Option<String>>,
}

impl MerkleTree {
    /// Build a tree from leaf digests.
    pub fn from_digests(digests: &[[u8; 32]]) -> Result<Self> {
        if digests.is_empty() {
            return Err(CryptoError::EmptyTree);
        }

        let width = digests.len().next_power_of_two();
        let mut nodes = vec![[0u8; NODE_LEN]; 2 * width];
        for (i, digest) in digests.iter().enumerate() {
            nodes[width + i] = sha3_512(&[digest]);
        }
        for k in (1..width).rev() {
            nodes[k] = sha3_512(&[&nodes[2 * k], &nodes[2 * k + 1]]);
        }

        Ok(Self { nodes })
    }

    /// Build a tree by reading `reader` to the end in `block_size` blocks.
    ///
    /// `file_size` is only a capacity hint; the tree always reflects the bytes
    /// actually read.
    pub fn build<R: Read>(mut reader: R, file_size: u64, block_size: usize) -> Result<Self> {
        let mut builder = TreeBuilder::with_capacity(block_size, file_size)?;
        let mut buf = vec![0u8; block_size.max(8192)];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            builder.update(&buf[..n]);
        }
        builder.finish()
    }

    /// Root hash.
    pub fn root(&self) -> &Node {
        &self.nodes[1]
    }

    /// Root hash, lowercase hex.
    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Number of leaf slots including padding.
    pub fn width(&self) -> u64 {
        (self.nodes.len() / 2) as u64
    }

    /// Generate a proof for the leaf whose data item is `digest`.
    pub fn generate_proof(&self, digest: &[u8; 32]) -> Result<MerkleProof> {
        let target = sha3_512(&[digest]);
        let width = self.nodes.len() / 2;
        let index = self.nodes[width..]
            .iter()
            .position(|leaf| *leaf == target)
            .ok_or(CryptoError::LeafNotFound)?;
        self.proof_for_index(index as u64)
    }

    /// Generate a proof for the leaf at `index`.
    pub fn proof_for_index(&self, index: u64) -> Result<MerkleProof> {
        let width = self.width();
        if index >= width {
            return Err(CryptoError::IndexOutOfRange { index, width });
        }

        let mut hashes = Vec::with_capacity(width.trailing_zeros() as usize);
        let mut pos = (index + width) as usize;
        while pos > 1 {
            hashes.push(self.nodes[pos ^ 1]);
            pos /= 2;
        }

        Ok(MerkleProof { hashes, index })
    }

    /// Serialize the tree for storage next to its file.
    pub fn export(&self) -> Result<Vec<u8>> {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (i > 0).then(|| BASE64.encode(node)))
            .collect();
        let exported = ExportedTree {
            salt: false,
            sorted: false,
            hash: TREE_HASH_NAME.to_string(),
            nodes,
        };
        serde_json::to_vec(&exported).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// Restore a tree written by [`MerkleTree::export`].
    pub fn import(data: &[u8]) -> Result<Self> {
        let exported: ExportedTree =
            serde_json::from_slice(data).map_err(|e| CryptoError::InvalidExport(e.to_string()))?;

        if exported.salt || exported.sorted || exported.hash != TREE_HASH_NAME {
            return Err(CryptoError::InvalidExport(format!(
                "unsupported tree parameters: hash={} salt={} sorted={}",
                exported.hash, exported.salt, exported.sorted
            )));
        }
        let len = exported.nodes.len();
        if len < 2 || !len.is_power_of_two() {
            return Err(CryptoError::InvalidExport(format!(
                "node count {len} is not a power of two"
            )));
        }

        let mut nodes = Vec::with_capacity(len);
        nodes.push([0u8; NODE_LEN]);
        for encoded in exported.nodes.iter().skip(1) {
            let encoded = encoded
                .as_deref()
                .ok_or_else(|| CryptoError::InvalidExport("missing node".to_string()))?;
            nodes.push(decode_node(encoded).map_err(CryptoError::InvalidExport)?);
        }

        Ok(Self { nodes })
    }
}

/// Verify that `digest` is included under `root` according to `proof`.
pub fn verify(digest: &[u8; 32], proof: &MerkleProof, root: &Node) -> bool {
    if proof.hashes.len() >= 64 {
        return false;
    }
    let width = 1u64 << proof.hashes.len();
    if proof.index >= width {
        return false;
    }
    let mut hash = sha3_512(&[digest]);
    let mut pos = proof.index + width;
    for sibling in &proof.hashes {
        hash = if pos % 2 == 0 {
            sha3_512(&[&hash, sibling])
        } else {
            sha3_512(&[sibling, &hash])
        };
        pos >>= 1;
    }
    hash == *root
}

/// Incremental tree builder fed with arbitrary-sized slices of a stream.
///
/// Bytes are cut into `block_size` blocks as they arrive; each full block is
/// turned into its leaf digest immediately, so only one partial block is
/// ever buffered.
pub struct TreeBuilder {
    block_size: usize,
    pending: Vec<u8>,
    digests: Vec<[u8; 32]>,
}

impl TreeBuilder {
    pub fn new(block_size: usize) -> Result<Self> {
        Self::with_capacity(block_size, 0)
    }

    /// Create a builder expecting roughly `file_size` bytes.
    pub fn with_capacity(block_size: usize, file_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(CryptoError::InvalidBlockSize);
        }
        let expected_leaves = file_size.div_ceil(block_size as u64).min(1 << 24) as usize;
        Ok(Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            digests: Vec::with_capacity(expected_leaves),
        })
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.block_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == self.block_size {
                self.seal_block();
            }
        }
    }

    /// Number of complete leaves produced so far.
    pub fn leaves(&self) -> usize {
        self.digests.len()
    }

    /// Seal the trailing short block, if any, and build the tree.
    pub fn finish(mut self) -> Result<MerkleTree> {
        if !self.pending.is_empty() {
            self.seal_block();
        }
        MerkleTree::from_digests(&self.digests)
    }

    fn seal_block(&mut self) {
        let index = self.digests.len() as u64;
        self.digests.push(leaf_digest(index, &self.pending));
        self.pending.clear();
    }
}

fn decode_node(encoded: &str) -> std::result::Result<Node, String> {
    let bytes = BASE64.decode(encoded).map_err(|e| e.to_string())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("node must be {NODE_LEN} bytes, got {len}"))
}

mod base64_nodes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        nodes: &[Node],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let encoded: Vec<String> = nodes.iter().map(|n| BASE64.encode(n)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<Node>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| decode_node(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
