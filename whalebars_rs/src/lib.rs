pub mod bars;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod labels;
pub mod pipeline;
pub mod rolling;
pub mod storage;
pub mod sweep;
pub mod trade;

pub use bars::{Bar, aggregate};
pub use config::{BarWidth, Config, Horizon, LabelMode};
pub use error::{PipelineError, StageResult};
pub use labels::{LabeledBars, label};
pub use storage::{TableReceipt, TableStore};
pub use sweep::{SweepResult, SweepTable, evaluate_signal, near_misses, sweep};
pub use trade::{Side, Trade};
