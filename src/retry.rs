//! Bounded retries around transplantation, with success and failure
//! markers that make repeated runs resumable.

use crate::layout::OutputLayout;
use crate::record::host_name_from_record_path;
use crate::transplant::{TransplantOutcome, TransplantReport};
use anyhow::Result;
use std::path::Path;

/// What happened to a host.
#[derive(Debug, Clone)]
pub enum RetryVerdict {
    Succeeded {
        report: Box<TransplantReport>,
        attempts: u32,
    },
    /// A success report already exists.
    AlreadySucceeded,
    /// A failure log exists and past failures are not being rerun.
    PreviouslyFailed,
    /// Every attempt failed in a retryable way.
    Exhausted { attempts: u32, reason: String },
    Fatal { attempts: u32, reason: String },
}

impl RetryVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryVerdict::Succeeded { .. } | RetryVerdict::AlreadySucceeded)
    }
}

pub struct RetryController<'a> {
    layout: &'a OutputLayout,
    tries: u32,
    rerun_past_failures: bool,
}

impl<'a> RetryController<'a> {
    pub fn new(layout: &'a OutputLayout, tries: u32, rerun_past_failures: bool) -> Self {
        Self {
            layout,
            tries,
            rerun_past_failures,
        }
    }

    /// Drive `attempt` for the host behind `record_path` until it succeeds,
    /// fails fatally or the retry budget runs out.
    pub fn run<F>(&self, record_path: &Path, mut attempt: F) -> Result<RetryVerdict>
    where
        F: FnMut() -> TransplantOutcome,
    {
        let host_name = host_name_from_record_path(record_path);

        if self.layout.success_path(&host_name).exists() {
            tracing::info!("Already successfully generated!");
            return Ok(RetryVerdict::AlreadySucceeded);
        }

        if self.layout.failure_path(record_path).exists() && !self.rerun_past_failures {
            tracing::info!("Already attempted to generate.");
            return Ok(RetryVerdict::PreviouslyFailed);
        }

        let mut tries = self.tries;
        let mut attempts = 0;
        while tries > 0 {
            attempts += 1;
            match attempt() {
                TransplantOutcome::Success(report) => {
                    self.layout.clear_failure(record_path)?;
                    return Ok(RetryVerdict::Succeeded { report, attempts });
                }
                TransplantOutcome::RetryableFailure(reason) => {
                    tries -= 1;
                    if tries > 0 {
                        tracing::warn!("Encountered a random error, retrying... ({})", reason);
                    } else {
                        tracing::error!("Ran out of tries :O Logging error...");
                        self.layout.log_failure(record_path, &reason)?;
                        return Ok(RetryVerdict::Exhausted { attempts, reason });
                    }
                }
                TransplantOutcome::FatalFailure(reason) => {
                    let msg = format!("Process fell over with: [{reason}]");
                    self.layout.log_failure(record_path, &msg)?;
                    return Ok(RetryVerdict::Fatal { attempts, reason });
                }
            }
        }

        // Only reachable with a zero budget, which configuration rejects
        Ok(RetryVerdict::Exhausted {
            attempts,
            reason: "no tries left".to_string(),
        })
    }
}
