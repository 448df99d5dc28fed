//! Process-wide logging init.
//!
//! The underlying decode library keeps its own global log level (`av_log_set_level`
//! in the source library this crate follows); this crate's own diagnostics go
//! through `tracing` instead, set up once per process regardless of how many
//! sources get constructed.

use std::sync::Once;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::LocalTime;

static START: Once = Once::new();

/// Initialize the global `tracing` subscriber. Safe to call from multiple
/// sources; only the first call takes effect.
pub fn init() {
    START.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_timer(LocalTime::rfc_3339())
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_span_events(FmtSpan::CLOSE)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global default tracing subscriber");
    });
}

/// Sets the underlying decode library's own log verbosity. Kept separate from
/// `init` because it touches process-global C state with no ordering
/// dependency on the `tracing` subscriber.
pub fn set_ffmpeg_log_level(level: ffmpeg::util::log::Level) {
    ffmpeg::util::log::set_level(level);
}
