use std::sync::OnceLock;
use std::time::Instant;

/// Returns monotonic, non-decreasing time in nanoseconds.
///
/// The zero point is the first call in the process; only differences
/// between readings are meaningful. `Instant` maps to the native
/// monotonic source on every supported platform, so this stays a thin
/// wrapper.
pub fn nanotime() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    // 2^64 ns is ~584 years of uptime, the cast can't truncate in practice.
    anchor.elapsed().as_nanos() as u64
}
