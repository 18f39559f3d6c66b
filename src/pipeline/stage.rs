//! Stage interface and chain runner.
//!
//! Stages are variant types behind one fixed interface, selected by
//! configuration when the chain is built. Failures are values, never
//! control flow: a stage reports its result and the runner decides
//! whether the chain continues.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::jobs::model::ProcessOptions;

/// One file unit handed to the pipeline.
#[derive(Debug, Clone)]
pub struct FileUnit {
    pub job_id: Uuid,
    pub file_id: Uuid,
    /// Absolute path of the source file.
    pub source_path: PathBuf,
    /// Directory the output artifact is written into.
    pub output_dir: PathBuf,
    pub options: ProcessOptions,
}

/// Working state threaded through the stage chain for one file.
#[derive(Debug)]
pub struct StageDocument {
    pub unit: FileUnit,
    /// Extracted (and later normalized) text.
    pub text: String,
    /// Chunked text, produced by the chunk stage.
    pub chunks: Vec<String>,
    /// Where the output stage wrote the artifact, relative to `output_dir`.
    pub output_path: Option<String>,
}

impl StageDocument {
    pub fn new(unit: FileUnit) -> Self {
        Self {
            unit,
            text: String::new(),
            chunks: Vec::new(),
            output_path: None,
        }
    }
}

/// What one stage decided about the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    /// Hand the document to the next stage.
    Continue,
    /// Stop the chain; the file is deliberately not processed.
    Skip { reason: String },
    /// Stop the chain; the file failed.
    Fail { error_type: String, message: String },
    /// Abort the whole job; remaining files stay pending.
    Fatal { message: String },
}

/// Terminal outcome of the full chain for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Done {
        output_path: String,
        chunk_count: i64,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error_type: String,
        message: String,
    },
    /// Pipeline-level failure; the dispatcher fails the job immediately.
    Fatal {
        message: String,
    },
}

/// A single pipeline stage. `process` mutates the document in place and
/// reports what happened as a value.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process(&self, doc: &mut StageDocument) -> StageResult;
}

/// An ordered chain of stages.
pub struct StagePipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl StagePipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Build the standard chain for the given options. Stage selection is
    /// static configuration: the semantic stage is present or absent, never
    /// chosen per document.
    pub fn for_options(options: &ProcessOptions) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(ExtractStage),
            Box::new(NormalizeStage),
            Box::new(ChunkStage),
        ];
        if options.enable_semantic {
            stages.push(Box::new(SemanticStage));
        }
        stages.push(Box::new(OutputStage));
        Self { stages }
    }

    /// Run the chain over one file.
    pub async fn run(&self, unit: FileUnit) -> FileOutcome {
        let mut doc = StageDocument::new(unit);
        for stage in &self.stages {
            debug!(
                stage = stage.name(),
                file = %doc.unit.source_path.display(),
                "Running stage"
            );
            match stage.process(&mut doc).await {
                StageResult::Continue => {}
                StageResult::Skip { reason } => return FileOutcome::Skipped { reason },
                StageResult::Fail {
                    error_type,
                    message,
                } => {
                    return FileOutcome::Failed {
                        error_type,
                        message,
                    };
                }
                StageResult::Fatal { message } => return FileOutcome::Fatal { message },
            }
        }

        match doc.output_path {
            Some(output_path) => FileOutcome::Done {
                output_path,
                chunk_count: doc.chunks.len() as i64,
            },
            // A chain without an output stage is a wiring bug, not a file error
            None => FileOutcome::Fatal {
                message: "Stage chain produced no output artifact".to_string(),
            },
        }
    }
}

/// Seam between the dispatcher and the pipeline. Production uses
/// `StageChainProcessor`; tests inject scripted outcomes.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    async fn process(&self, unit: FileUnit) -> FileOutcome;
}

/// Default processor: builds the configured stage chain per unit and runs it.
pub struct StageChainProcessor;

#[async_trait]
impl FileProcessor for StageChainProcessor {
    async fn process(&self, unit: FileUnit) -> FileOutcome {
        let pipeline = StagePipeline::for_options(&unit.options);
        pipeline.run(unit).await
    }
}

// ── Built-in stages ─────────────────────────────────────────────────

/// Reads the source file. Real format parsers (PDF, Office, CSV) replace
/// this stage; the built-in handles plain text.
struct ExtractStage;

#[async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> &'static str {
        "extract"
    }

    async fn process(&self, doc: &mut StageDocument) -> StageResult {
        match tokio::fs::read(&doc.unit.source_path).await {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return StageResult::Skip {
                        reason: "empty file".to_string(),
                    };
                }
                doc.text = String::from_utf8_lossy(&bytes).into_owned();
                StageResult::Continue
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StageResult::Fail {
                error_type: "missing_source".to_string(),
                message: format!("Source file not found: {}", doc.unit.source_path.display()),
            },
            Err(e) => StageResult::Fail {
                error_type: "read_error".to_string(),
                message: e.to_string(),
            },
        }
    }
}

/// Collapses whitespace runs so chunk boundaries are stable.
struct NormalizeStage;

#[async_trait]
impl Stage for NormalizeStage {
    fn name(&self) -> &'static str {
        "normalize"
    }

    async fn process(&self, doc: &mut StageDocument) -> StageResult {
        doc.text = doc.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if doc.text.is_empty() {
            return StageResult::Skip {
                reason: "no extractable text".to_string(),
            };
        }
        StageResult::Continue
    }
}

/// Splits normalized text into chunks of at most `chunk_size` characters,
/// breaking on word boundaries.
struct ChunkStage;

#[async_trait]
impl Stage for ChunkStage {
    fn name(&self) -> &'static str {
        "chunk"
    }

    async fn process(&self, doc: &mut StageDocument) -> StageResult {
        let size = doc.unit.options.chunk_size.max(1);
        let mut current = String::new();
        for word in doc.text.split(' ') {
            if !current.is_empty() && current.len() + word.len() + 1 > size {
                doc.chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            doc.chunks.push(current);
        }
        StageResult::Continue
    }
}

/// Placeholder for the external semantic processors (vectorization, topic
/// extraction, quality scoring). Present in the chain only when enabled.
struct SemanticStage;

#[async_trait]
impl Stage for SemanticStage {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn process(&self, _doc: &mut StageDocument) -> StageResult {
        StageResult::Continue
    }
}

/// Writes chunks as JSON lines into the job's output directory.
struct OutputStage;

#[async_trait]
impl Stage for OutputStage {
    fn name(&self) -> &'static str {
        "output"
    }

    async fn process(&self, doc: &mut StageDocument) -> StageResult {
        let stem = doc
            .unit
            .source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let file_name = format!("{stem}.{}", doc.unit.options.output_format);

        let mut body = String::new();
        for (i, chunk) in doc.chunks.iter().enumerate() {
            let line = serde_json::json!({ "index": i, "text": chunk });
            body.push_str(&line.to_string());
            body.push('\n');
        }

        if let Err(e) = tokio::fs::create_dir_all(&doc.unit.output_dir).await {
            return StageResult::Fatal {
                message: format!("Cannot create output directory: {e}"),
            };
        }
        let target = doc.unit.output_dir.join(&file_name);
        match tokio::fs::write(&target, body).await {
            Ok(()) => {
                doc.output_path = Some(file_name);
                StageResult::Continue
            }
            Err(e) => StageResult::Fail {
                error_type: "write_error".to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dir: &std::path::Path, name: &str) -> FileUnit {
        FileUnit {
            job_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            source_path: dir.join(name),
            output_dir: dir.join("outputs"),
            options: ProcessOptions::default(),
        }
    }

    #[tokio::test]
    async fn chain_processes_a_text_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("doc.txt"), "hello   world\n\nagain").unwrap();

        let outcome = StageChainProcessor
            .process(unit(tmp.path(), "doc.txt"))
            .await;
        match outcome {
            FileOutcome::Done {
                output_path,
                chunk_count,
            } => {
                assert_eq!(output_path, "doc.jsonl");
                assert_eq!(chunk_count, 1);
                let written =
                    std::fs::read_to_string(tmp.path().join("outputs").join("doc.jsonl")).unwrap();
                assert!(written.contains("hello world again"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_source_fails_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let outcome = StageChainProcessor
            .process(unit(tmp.path(), "nope.txt"))
            .await;
        match outcome {
            FileOutcome::Failed { error_type, .. } => assert_eq!(error_type, "missing_source"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_file_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("empty.txt"), "").unwrap();
        let outcome = StageChainProcessor
            .process(unit(tmp.path(), "empty.txt"))
            .await;
        assert!(matches!(outcome, FileOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn chunking_respects_size() {
        let tmp = tempfile::tempdir().unwrap();
        let words = vec!["word"; 100].join(" ");
        std::fs::write(tmp.path().join("long.txt"), &words).unwrap();

        let mut u = unit(tmp.path(), "long.txt");
        u.options.chunk_size = 40;
        match StageChainProcessor.process(u).await {
            FileOutcome::Done { chunk_count, .. } => assert!(chunk_count > 1),
            other => panic!("expected Done, got {other:?}"),
        }
    }
}
