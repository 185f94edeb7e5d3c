// MERKLE ROOT SERVICE
// SHA3-256 binary merkle root over a block's transaction hashes.
//
// SAFETY INVARIANTS:
// 1. Leaf order is significant
// 2. An empty leaf set has the all-zero root
// 3. An odd node at any level is hashed alone into the next level

use async_trait::async_trait;
use sha3::{Digest, Sha3_256};

use crate::services::MerkleService;

/// SHA3-256 binary merkle tree over transaction hashes.
///
/// An odd node at any level is hashed alone into the next level. An empty
/// leaf set yields the all-zero root.
#[derive(Debug, Default, Clone)]
pub struct Sha3MerkleService;

impl Sha3MerkleService {
    pub fn new() -> Self {
        Sha3MerkleService
    }

    pub fn compute_root(hashes: &[String]) -> String {
        if hashes.is_empty() {
            return "0".repeat(64);
        }
        let mut level: Vec<Vec<u8>> = hashes
            .iter()
            .map(|leaf| Sha3_256::digest(leaf.as_bytes()).to_vec())
            .collect();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut hasher = Sha3_256::new();
                    hasher.update(&pair[0]);
                    if let Some(right) = pair.get(1) {
                        hasher.update(right);
                    }
                    hasher.finalize().to_vec()
                })
                .collect();
        }
        hex::encode(&level[0])
    }
}

#[async_trait]
impl MerkleService for Sha3MerkleService {
    async fn create_root(&self, hashes: &[String]) -> anyhow::Result<String> {
        Ok(Self::compute_root(hashes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_root() {
        assert_eq!(Sha3MerkleService::compute_root(&[]), "0".repeat(64));
    }

    #[test]
    fn test_root_depends_on_order() {
        let a = vec!["tx1".to_string(), "tx2".to_string()];
        let b = vec!["tx2".to_string(), "tx1".to_string()];
        assert_ne!(
            Sha3MerkleService::compute_root(&a),
            Sha3MerkleService::compute_root(&b)
        );
    }

    #[tokio::test]
    async fn test_odd_leaf_count() {
        let service = Sha3MerkleService::new();
        let hashes: Vec<String> = (0..5).map(|i| format!("tx{}", i)).collect();
        let root = service.create_root(&hashes).await.unwrap();
        assert_eq!(root.len(), 64);
        assert_eq!(root, Sha3MerkleService::compute_root(&hashes));
    }

    #[test]
    fn test_odd_node_hashed_alone() {
        let leaf = |tx: &str| Sha3_256::digest(tx.as_bytes()).to_vec();
        let mut left = Sha3_256::new();
        left.update(leaf("tx0"));
        left.update(leaf("tx1"));
        let right = Sha3_256::digest(leaf("tx2"));
        let mut top = Sha3_256::new();
        top.update(left.finalize());
        top.update(right);

        let hashes: Vec<String> = (0..3).map(|i| format!("tx{}", i)).collect();
        assert_eq!(
            Sha3MerkleService::compute_root(&hashes),
            hex::encode(top.finalize())
        );
    }
}
