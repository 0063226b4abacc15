//! Background decryption
//!
//! A [`DecryptJob`] runs [`decrypt_file`] on a worker thread and streams
//! [`DecryptEvent`]s back over a channel, so a caller can keep the terminal
//! or UI responsive and cancel at any time.

use crate::artifact::ArtifactManager;
use crate::decrypt::{DecryptOptions, DecryptedArtifact, decrypt_file};
use crate::error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
use crate::progress::{CancelToken, ProgressEvent};
use crossbeam::channel::{self, Receiver};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// How a job ended.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(DecryptedArtifact),
    /// Stopped on request. The partial artifact is already gone.
    Cancelled,
    Failed(SecureMediaError),
}

impl From<Result<DecryptedArtifact>> for JobOutcome {
    fn from(result: Result<DecryptedArtifact>) -> Self {
        match result {
            Ok(artifact) => JobOutcome::Completed(artifact),
            Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e),
        }
    }
}

#[derive(Debug)]
pub enum DecryptEvent {
    Progress(ProgressEvent),
    /// Always the last event of a job.
    Finished(JobOutcome),
}

pub struct DecryptJob {
    events: Receiver<DecryptEvent>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl DecryptJob {
    /// Start decrypting `input` on a new worker thread.
    pub fn spawn(
        input: impl Into<PathBuf>,
        password: Zeroizing<Vec<u8>>,
        manager: ArtifactManager,
        options: DecryptOptions,
    ) -> Result<Self> {
        Self::spawn_with_cancel(input, password, manager, options, CancelToken::new())
    }

    /// Like [`spawn`](Self::spawn), observing an existing token.
    pub fn spawn_with_cancel(
        input: impl Into<PathBuf>,
        password: Zeroizing<Vec<u8>>,
        manager: ArtifactManager,
        options: DecryptOptions,
        cancel: CancelToken,
    ) -> Result<Self> {
        options.validate()?;
        let input = input.into();
        let (tx, rx) = channel::unbounded();
        let worker_cancel = cancel.clone();

        let worker = thread::Builder::new()
            .name("decrypt-worker".to_string())
            .spawn(move || {
                let progress_tx = tx.clone();
                let mut sink = move |event: ProgressEvent| {
                    // Nobody listening is fine; the outcome still gets built.
                    let _ = progress_tx.send(DecryptEvent::Progress(event));
                };
                let result = decrypt_file(
                    &input,
                    &password,
                    &manager,
                    &options,
                    &mut sink,
                    &worker_cancel,
                );
                let outcome = JobOutcome::from(result);
                debug!(?outcome, "decrypt worker finished");
                // On send failure the outcome is dropped here, which releases
                // any artifact it carries.
                let _ = tx.send(DecryptEvent::Finished(outcome));
            })
            .map_err(|e| {
                SecureMediaError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to start decrypt worker",
                    e,
                )
            })?;

        Ok(Self {
            events: rx,
            cancel,
            worker: Some(worker),
        })
    }

    /// Ask the worker to stop after the chunk in progress.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Raw event stream, for callers that multiplex it with other work.
    pub fn events(&self) -> &Receiver<DecryptEvent> {
        &self.events
    }

    /// Block until the job ends.
    pub fn wait(self) -> JobOutcome {
        self.wait_with(|_| {})
    }

    /// Block until the job ends, passing every progress event to
    /// `on_progress` on the calling thread.
    pub fn wait_with(mut self, mut on_progress: impl FnMut(ProgressEvent)) -> JobOutcome {
        let mut outcome = None;
        for event in self.events.iter() {
            match event {
                DecryptEvent::Progress(p) => on_progress(p),
                DecryptEvent::Finished(o) => {
                    outcome = Some(o);
                    break;
                }
            }
        }
        self.join_worker();
        outcome.unwrap_or_else(|| {
            JobOutcome::Failed(SecureMediaError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "decrypt worker exited without reporting an outcome",
            ))
        })
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("decrypt worker panicked");
            }
        }
    }
}

impl Drop for DecryptJob {
    /// Dropping an unfinished job cancels it and waits for the worker, so
    /// no partial artifact outlives the job.
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel.cancel();
            self.join_worker();
        }
    }
}
