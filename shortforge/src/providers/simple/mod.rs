//! Deterministic last-resort backends.
//!
//! One per capability. They never call out anywhere and never reject a
//! request, so a fully degraded provider chain still produces a watchable
//! (if formulaic) short.

pub mod asset;
pub mod script;
pub mod trend;
pub mod video;
pub mod voiceover;

pub use asset::SimpleAssetProvider;
pub use script::SimpleScriptProvider;
pub use trend::SimpleTrendProvider;
pub use video::SimpleVideoProvider;
pub use voiceover::SimpleVoiceoverProvider;

pub(crate) const SIMPLE_PROVIDER_NAME: &str = "simple";

/// FNV-1a over the input bytes. Used instead of `DefaultHasher` so outputs
/// stay stable across processes and rebuilds.
pub(crate) fn stable_hash(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Lowercase alphanumeric slug for filenames and hashtags.
pub(crate) fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_is_stable() {
        assert_eq!(stable_hash("rust"), stable_hash("rust"));
        assert_ne!(stable_hash("rust"), stable_hash("rusty"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Rust Borrow Checker!"), "rust-borrow-checker");
        assert_eq!(slug("  spaced   out  "), "spaced-out");
        assert_eq!(slug("???"), "");
    }
}
