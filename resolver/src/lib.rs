//! Resolution and caching engine for schedules spread over many spreadsheet
//! files: per-group BASE timetables plus dated OVERRIDE files.
//!
//! [`ScheduleEngine`] owns every component. A request flows through the
//! [`RequestCoordinator`] (result cache, then join-or-own), the tiered
//! [`ResolutionPipeline`], and the [`FileProcessingPool`], which runs the
//! [`LayoutParser`] over documents held by the [`ParsedDocumentCache`].

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod doc_cache;
pub mod engine;
pub mod error;
pub mod format;
pub mod index;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod popularity;
pub mod range;
pub mod refresher;
pub mod result_cache;
pub mod slot;
pub mod store;
pub mod tier;

#[cfg(test)]
mod test_support;

pub use catalog::FileCatalog;
pub use config::EngineConfig;
pub use config::RangePolicy;
pub use coordinator::RequestCoordinator;
pub use coordinator::RequestOrigin;
pub use doc_cache::ParsedDocumentCache;
pub use engine::BackgroundHandle;
pub use engine::EngineStats;
pub use engine::ScheduleEngine;
pub use error::ResolverError;
pub use error::Result;
pub use format::PlainFormatter;
pub use format::ScheduleFormatter;
pub use index::EntityIndex;
pub use layout::LayoutParser;
pub use layout::TabularLayout;
pub use model::ActivityRecord;
pub use model::DaySchedule;
pub use model::FileId;
pub use model::FileListing;
pub use model::RequestKey;
pub use model::ResolutionResult;
pub use model::ScheduleFile;
pub use pipeline::ResolutionPipeline;
pub use pool::FileProcessingPool;
pub use popularity::PopularityTracker;
pub use refresher::BackgroundRefresher;
pub use result_cache::ResultCache;
pub use store::DirectoryStore;
pub use store::DocumentStore;
pub use store::ParsedDocument;
pub use tier::Tier;
pub use tier::TierPlan;
