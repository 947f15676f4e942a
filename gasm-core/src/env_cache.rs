//! Cached environment variable lookups for runtime overrides
//! These are read once and cached, so hot paths never call getenv

use std::sync::OnceLock;

use gasm_common::TmMode;

// Each override has a unique static cache and a public accessor function

static TM_MODE_CACHE: OnceLock<Option<TmMode>> = OnceLock::new();
/// `GASM_TM_MODE=hybrid|software|serial` forces the transaction manager mode
pub fn tm_mode_override() -> Option<TmMode> {
    *TM_MODE_CACHE.get_or_init(|| {
        let value = std::env::var("GASM_TM_MODE").ok()?;
        match value.parse() {
            Ok(mode) => Some(mode),
            Err(err) => {
                tracing::warn!("ignoring GASM_TM_MODE: {err}");
                None
            }
        }
    })
}

static DEDUP_CHUNK_CACHE: OnceLock<Option<usize>> = OnceLock::new();
/// `GASM_DEDUP_CHUNK=<n>` overrides the number of segments per dedup region
pub fn dedup_chunk_override() -> Option<usize> {
    *DEDUP_CHUNK_CACHE.get_or_init(|| {
        std::env::var("GASM_DEDUP_CHUNK")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|&chunk| chunk > 0)
    })
}
