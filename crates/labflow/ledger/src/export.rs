//! Run exports: the run snapshot followed by its audit chain, as JSON lines

use crate::verify::{verify_chain, ChainFault, ChainReport};
use crate::{AuditEvent, LedgerError, LedgerResult, StreamId};
use labflow_types::RunInstance;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// One line of an export file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ExportRecord {
    Run(Box<RunInstance>),
    Event(AuditEvent),
}

/// A run together with its complete audit stream.
#[derive(Clone, Debug, PartialEq)]
pub struct RunExport {
    pub run: RunInstance,
    pub events: Vec<AuditEvent>,
}

impl RunExport {
    pub fn new(run: RunInstance, events: Vec<AuditEvent>) -> Self {
        Self { run, events }
    }

    /// Verify the chain and that it is the chain of this run.
    pub fn verify(&self) -> ChainReport {
        let expected = StreamId::run(&self.run.id);
        if let Some(foreign) = self.events.iter().find(|e| e.stream != expected) {
            return ChainReport {
                total_events: self.events.len(),
                verified_events: 0,
                first_invalid_seq: Some(foreign.seq),
                fault: Some(ChainFault::ForeignStream {
                    found: foreign.stream.clone(),
                }),
                head: None,
            };
        }
        verify_chain(&self.events)
    }

    pub fn to_jsonl(&self) -> LedgerResult<String> {
        let mut out = serde_json::to_string(&ExportRecord::Run(Box::new(self.run.clone())))?;
        out.push('\n');
        for event in &self.events {
            out.push_str(&serde_json::to_string(&ExportRecord::Event(event.clone()))?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn from_jsonl(text: &str) -> LedgerResult<Self> {
        let mut run = None;
        let mut events = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let line_no = index + 1;
            let record: ExportRecord =
                serde_json::from_str(line).map_err(|e| LedgerError::InvalidExport {
                    line: line_no,
                    reason: e.to_string(),
                })?;
            match record {
                ExportRecord::Run(snapshot) if run.is_none() => run = Some(*snapshot),
                ExportRecord::Run(_) => {
                    return Err(LedgerError::InvalidExport {
                        line: line_no,
                        reason: "more than one run record".into(),
                    })
                }
                ExportRecord::Event(event) => events.push(event),
            }
        }
        let run = run.ok_or(LedgerError::InvalidExport {
            line: 0,
            reason: "missing run record".into(),
        })?;
        Ok(Self { run, events })
    }
}

pub async fn write_export(path: impl AsRef<Path>, export: &RunExport) -> LedgerResult<()> {
    let body = export.to_jsonl()?;
    let mut file = tokio::fs::File::create(path.as_ref()).await?;
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

pub async fn read_export(path: impl AsRef<Path>) -> LedgerResult<RunExport> {
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    RunExport::from_jsonl(&text)
}
