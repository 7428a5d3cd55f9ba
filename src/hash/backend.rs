//! Hashing backend detection and the startup self-test
//!
//! The BLAKE3 implementation dispatches internally to the widest SIMD tier
//! the host supports (SSE2/SSE4.1/AVX2/AVX-512 on x86, NEON on aarch64,
//! portable elsewhere). This module records which tier that is, verifies the
//! dispatched implementation against a pinned vector once per process, and
//! freezes the result. A self-test mismatch downgrades the reported tier to
//! portable and is logged; digests remain backend-independent either way.

use once_cell::sync::Lazy;
use std::fmt;

/// Instruction-set tier used for hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashBackend {
    /// Pure-Rust reference path
    Portable,
    /// x86 SSE2
    Sse2,
    /// x86 SSE4.1
    Sse41,
    /// x86 AVX2
    Avx2,
    /// x86 AVX-512
    Avx512,
    /// aarch64 NEON
    Neon,
}

impl HashBackend {
    /// Stable name for log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashBackend::Portable => "portable",
            HashBackend::Sse2 => "sse2",
            HashBackend::Sse41 => "sse4.1",
            HashBackend::Avx2 => "avx2",
            HashBackend::Avx512 => "avx512",
            HashBackend::Neon => "neon",
        }
    }
}

impl fmt::Display for HashBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// BLAKE3 of the empty input, from the reference test vectors.
const SELF_TEST_INPUT: &[u8] = b"";
const SELF_TEST_DIGEST: &str =
    "af1349b9f5f9a1a6a0404dee35f89af0b1c6a49fb2a04e3d16ede45ba8b6b269";

static SELECTED: Lazy<HashBackend> = Lazy::new(|| {
    let detected = detect_widest();
    if self_test_passes() {
        log::debug!("Hashing backend: {}", detected);
        detected
    } else {
        log::warn!(
            "Hashing self-test failed on {}; falling back to portable",
            detected
        );
        HashBackend::Portable
    }
});

/// The backend selected for this process. Detection and the self-test run
/// once; the choice is frozen afterwards.
pub fn selected() -> HashBackend {
    *SELECTED
}

fn self_test_passes() -> bool {
    blake3::hash(SELF_TEST_INPUT).to_hex().as_str() == SELF_TEST_DIGEST
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_widest() -> HashBackend {
    if is_x86_feature_detected!("avx512f") {
        HashBackend::Avx512
    } else if is_x86_feature_detected!("avx2") {
        HashBackend::Avx2
    } else if is_x86_feature_detected!("sse4.1") {
        HashBackend::Sse41
    } else if is_x86_feature_detected!("sse2") {
        HashBackend::Sse2
    } else {
        HashBackend::Portable
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_widest() -> HashBackend {
    HashBackend::Neon
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_widest() -> HashBackend {
    HashBackend::Portable
}
