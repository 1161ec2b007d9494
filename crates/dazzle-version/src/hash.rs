//! DSL content hashing and version id generation.

use chrono::Utc;
use sha2::{Digest, Sha256};

/// 16 hex characters (the first 8 bytes of SHA-256) of the concatenated
/// file contents, each file separated by a NUL byte so a rename that
/// shuffles content across file boundaries still changes the hash.
pub fn compute_version_hash<I, B>(files: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for (i, file) in files.into_iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(file.as_ref());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// `v20260727_143015_a1b2c3d4` — a version id that sorts lexicographically
/// by deploy time and still carries the content hash for quick eyeballing.
pub fn generate_version_id(hash: &str, prefix: &str) -> String {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    let short_hash = &hash[..hash.len().min(8)];
    format!("{prefix}{ts}_{short_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_16_hex_chars() {
        let a = compute_version_hash(["step1.yaml", "step2.yaml"]);
        let b = compute_version_hash(["step1.yaml", "step2.yaml"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_changes_when_file_boundary_shifts() {
        let a = compute_version_hash(["ab", "c"]);
        let b = compute_version_hash(["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn version_id_carries_prefix_and_hash() {
        let hash = compute_version_hash(["x"]);
        let id = generate_version_id(&hash, "v");
        assert!(id.starts_with('v'));
        assert!(id.ends_with(&hash[..8]));
    }
}
