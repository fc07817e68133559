//! Merkle root calculation over transaction hashes
//!
//! Implements the Bitcoin binary hash tree: each internal node is the
//! double SHA-256 of its two children, and an odd node at the end of a
//! level is paired with itself.

use super::hash::{double_sha256, Hash256};

/// Combine two child hashes into their parent hash
pub fn merkle_combine(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    double_sha256(&data)
}

/// Calculate the merkle root from a list of transaction hashes.
///
/// An empty list has no meaningful root and yields `Hash256::ZERO`.
pub fn calculate_merkle_root(hashes: &[Hash256]) -> Hash256 {
    merkle_root_with_mutation(hashes).0
}

/// Merkle root plus whether the list is mutated.
///
/// A list is mutated when some level pairs two identical hashes. Such a
/// list shares its root with a shorter one (trailing transactions repeated),
/// so the root alone does not pin down the transactions.
pub fn merkle_root_with_mutation(hashes: &[Hash256]) -> (Hash256, bool) {
    if hashes.is_empty() {
        return (Hash256::ZERO, false);
    }

    let mut current_level: Vec<Hash256> = hashes.to_vec();
    let mut mutated = false;

    while current_level.len() > 1 {
        let next_level = current_level
            .chunks(2)
            .map(|chunk| match chunk {
                [left, right] => {
                    mutated |= left == right;
                    merkle_combine(left, right)
                }
                [single] => merkle_combine(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();

        current_level = next_level;
    }

    (current_level[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(data: &[u8]) -> Hash256 {
        double_sha256(data)
    }

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![leaf(b"tx1")];
        assert_eq!(calculate_merkle_root(&hashes), hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = leaf(b"tx1");
        let hash2 = leaf(b"tx2");

        let root = calculate_merkle_root(&[hash1, hash2]);
        assert_eq!(root, merkle_combine(&hash1, &hash2));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let h = [leaf(b"tx1"), leaf(b"tx2"), leaf(b"tx3")];
        let expected = merkle_combine(&merkle_combine(&h[0], &h[1]), &merkle_combine(&h[2], &h[2]));
        assert_eq!(calculate_merkle_root(&h), expected);
    }

    #[test]
    fn test_repeated_tail_is_mutated() {
        let h = [leaf(b"tx1"), leaf(b"tx2"), leaf(b"tx3")];
        let (root, mutated) = merkle_root_with_mutation(&h);
        assert!(!mutated);

        // Repeating the odd last hash reproduces the same root
        let repeated = [h[0], h[1], h[2], h[2]];
        assert_eq!(merkle_root_with_mutation(&repeated), (root, true));

        // Same for a repeated pair one level up
        let h4 = [leaf(b"a"), leaf(b"b"), leaf(b"c"), leaf(b"d"), leaf(b"e"), leaf(b"f")];
        let (root6, mutated6) = merkle_root_with_mutation(&h4);
        assert!(!mutated6);
        let doubled = [h4[0], h4[1], h4[2], h4[3], h4[4], h4[5], h4[4], h4[5]];
        assert_eq!(merkle_root_with_mutation(&doubled), (root6, true));
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(calculate_merkle_root(&[]), Hash256::ZERO);
    }
}
