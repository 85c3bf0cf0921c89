//! Profile extraction core

pub mod timeseries;
pub mod planner;
pub mod extraction;
pub mod worker;
pub mod store;
pub mod expression;
pub mod evaluator;
pub mod export;
pub mod session;

// Re-export main types
pub use timeseries::{Acquisition, Sensor, SensorId, TimeSeries};
pub use planner::{BandPolicy, BandSelection, ExtractionPlanner, ExtractionRequest, ExtractionTask};
pub use extraction::{PixelLocation, PixelWindow, SlotResult, TaskResult};
pub use worker::{CancelToken, ExtractionContext, ExtractionWorker, WorkerEvent};
pub use store::{IngestSummary, Observation, ProfileStatus, ProfileStore, TemporalProfile};
pub use expression::Expression;
pub use evaluator::{decimal_year, DateAxis, ExpressionEvaluator, ProfileSeries};
pub use export::ProfileRecord;
pub use session::ProfileSession;
