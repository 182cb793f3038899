//! Tests for constants module.
//!
//! Validates that security-critical constants have expected values and
//! that the pack id validator rejects path-forming input.

use packrun::constants::*;
use std::time::Duration;

// =============================================================================
// Size Limit Tests
// =============================================================================

#[test]
fn test_archive_limits_reasonable() {
    assert!(
        MAX_ARCHIVE_SIZE <= MAX_EXTRACTED_SIZE,
        "extraction bound should not be tighter than download bound"
    );
    assert!(MAX_ARCHIVE_ENTRIES >= 1_000, "entry limit too restrictive");
    assert!(
        MAX_EXTRACTED_SIZE <= 4 * 1024 * 1024 * 1024,
        "extraction limit too permissive (> 4 GiB)"
    );
}

#[test]
fn test_module_fits_in_archive() {
    assert!((MAX_WASM_MODULE_SIZE as u64) <= MAX_ARCHIVE_SIZE * 4);
    assert!(MAX_MANIFEST_SIZE < MAX_WORKFLOW_SIZE);
}

#[test]
fn test_history_output_within_capture() {
    assert!(MAX_HISTORY_OUTPUT <= MAX_CAPTURED_OUTPUT);
}

// =============================================================================
// Execution Limit Tests
// =============================================================================

#[test]
fn test_memory_ceiling_is_wasm32_address_space() {
    assert_eq!(MAX_MEMORY_MB * 1024 * 1024, 1u64 << 32);
}

#[test]
fn test_epoch_tick_divides_cpu_window() {
    let tick = EPOCH_TICK.as_millis() as u64;
    assert!(tick > 0);
    assert_eq!(CPU_WINDOW_MS % tick, 0, "window must be whole ticks");
    assert!(tick <= 50, "tick too coarse for per-second budgets");
}

#[test]
fn test_fuel_is_nonzero() {
    assert!(DEFAULT_WASM_FUEL > 1_000_000);
}

// =============================================================================
// Timeout and Retry Tests
// =============================================================================

#[test]
fn test_retry_delays_ordered() {
    assert!(RETRY_INITIAL_DELAY <= RETRY_MAX_DELAY);
    assert!(RETRY_MULTIPLIER >= 2);
    assert!(RETRY_MAX_ATTEMPTS >= 1);
}

#[test]
fn test_connect_timeout_below_download_timeout() {
    assert!(CONNECT_TIMEOUT < DOWNLOAD_TIMEOUT);
    assert!(DEFAULT_HTTP_STEP_TIMEOUT <= Duration::from_secs(300));
}

#[test]
fn test_remote_wait_is_bounded() {
    let total = REMOTE_POLL_INTERVAL * REMOTE_POLL_MAX_ATTEMPTS;
    assert!(total <= Duration::from_secs(3600), "remote wait too long");
}

// =============================================================================
// Pack Id Validation
// =============================================================================

#[test]
fn test_valid_pack_ids() {
    assert!(validate_pack_id("demo").is_ok());
    assert!(validate_pack_id("com.example.guard-2_x").is_ok());
    assert!(validate_pack_id(&"a".repeat(MAX_PACK_ID_LEN)).is_ok());
}

#[test]
fn test_invalid_pack_ids() {
    assert!(validate_pack_id("").is_err());
    assert!(validate_pack_id("   ").is_err());
    assert!(validate_pack_id(".").is_err());
    assert!(validate_pack_id("..").is_err());
    assert!(validate_pack_id(".hidden").is_err());
    assert!(validate_pack_id("a/b").is_err());
    assert!(validate_pack_id("a\\b").is_err());
    assert!(validate_pack_id("a b").is_err());
    assert!(validate_pack_id(&"a".repeat(MAX_PACK_ID_LEN + 1)).is_err());
}

#[test]
fn test_layout_names() {
    assert_eq!(MANIFEST_FILE, "pack.json");
    assert!(PACK_STAGING_DIR.starts_with('.'), "staging must not collide with pack ids");
}
