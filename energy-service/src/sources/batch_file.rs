use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use futures::Stream;
use serde_json::Value;

use crate::pipeline::{Envelope, PipelineError, RawBatch, Source};

/// Staged batch files, one JSON array of readings per file.
///
/// A directory argument expands to its `*.json` files in name order. A file
/// that cannot be read or is not a JSON array yields an error for that batch
/// only; the remaining files are still delivered.
pub struct BatchFileSource {
    paths: Vec<PathBuf>,
}

impl BatchFileSource {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

async fn expand(path: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| PipelineError::Source(format!("failed to stat {}: {e}", path.display())))?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| PipelineError::Source(format!("failed to list {}: {e}", path.display())))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::Source(format!("failed to list {}: {e}", path.display())))?
    {
        let p = entry.path();
        if p.extension().is_some_and(|ext| ext == "json") {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

async fn read_batch(path: &Path) -> Result<Vec<Value>, PipelineError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::Source(format!("failed to read {}: {e}", path.display())))?;

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(readings)) => Ok(readings),
        Ok(_) => {
            metrics::counter!("batch_file_parse_errors_total").increment(1);
            Err(PipelineError::Source(format!(
                "{} does not contain a JSON array",
                path.display()
            )))
        }
        Err(e) => {
            metrics::counter!("batch_file_parse_errors_total").increment(1);
            Err(PipelineError::Source(format!(
                "failed to parse {}: {e}",
                path.display()
            )))
        }
    }
}

#[async_trait::async_trait]
impl Source<RawBatch> for BatchFileSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<RawBatch>, PipelineError>> + Send>> {
        let paths = self.paths.clone();
        let s = async_stream::stream! {
            for root in paths {
                let files = match expand(&root).await {
                    Ok(files) => files,
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                };

                for path in files {
                    match read_batch(&path).await {
                        Ok(readings) => {
                            yield Ok(Envelope {
                                payload: RawBatch::new(path.display().to_string(), readings),
                                received_at: SystemTime::now(),
                            });
                        }
                        Err(e) => {
                            yield Err(e);
                        }
                    }
                }
            }
        };

        Box::pin(s)
    }
}
