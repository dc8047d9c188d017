//! Services Layer
//!
//! Planning and orchestration on top of the candle store.
//!
//! ```text
//! CandleSyncService ──> OverlapAnalyzer ──┐
//!        │          └─> ChunkOptimizer ───┴──> CandleStore
//!        ├──> CandleFetcher (upstream)
//!        └──> BatchWriter ──> CandleStore
//! ```

pub mod chunk_optimizer;
pub mod overlap_analyzer;
pub mod sync_service;

pub use chunk_optimizer::{ChunkOptimizer, FetchChunk, FetchKind, FetchPlan, PlanStep};
pub use overlap_analyzer::{OverlapAnalyzer, OverlapResult, OverlapStatus};
pub use sync_service::{CancelHandle, CandleRequest, CandleSyncService, FailedRange, SyncOutcome};
