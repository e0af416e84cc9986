pub mod classifier;
pub mod correlator;
pub mod display;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod settings;
pub mod spree;
pub mod sync;
pub mod timeline;

pub use classifier::{classify, Classifier};
pub use correlator::{Correlation, Correlator, ReportOrigin};
pub use error::{KillfeedError, Result};
pub use event::{ClassifiedEvent, EventId, EventKind, Identity, RawLogLine, SpreeEvent};
pub use pipeline::{spawn_pipeline_worker, EventPipeline, PeerEvent, PipelineInput};
pub use settings::PipelineSettings;
pub use spree::{Aggregation, SpreeAggregator};
pub use sync::{CursorStore, JsonFileCursorStore, MemoryCursorStore, SyncTracker};
pub use timeline::{Timeline, TimelineRecord, TimelineUpdate};

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
/// Calling it again once a subscriber is set is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}
