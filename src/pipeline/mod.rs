//! Processing pipeline — the stage interface and the chain runner.
//!
//! The real format parsers and semantic processors live outside this
//! crate; they plug in behind the `Stage` trait. The built-in stages are
//! plain-text placeholders good enough to run the pipeline end to end.

pub mod stage;

pub use stage::{
    FileOutcome, FileProcessor, FileUnit, Stage, StageChainProcessor, StageDocument,
    StagePipeline, StageResult,
};
