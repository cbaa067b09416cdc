//! Scripted workflow step

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::workflow::{StepAction, StepContext, Submission};

/// Step action whose phases succeed unless a failure was queued
#[derive(Default)]
pub struct ScriptedAction {
    irreversible: bool,
    submission: Mutex<Submission>,
    submit_failures: Mutex<VecDeque<BridgeError>>,
    confirm_failures: Mutex<VecDeque<BridgeError>>,
    progress: Mutex<Option<String>>,
    submit_delay: Mutex<Option<Duration>>,
    confirm_delay: Mutex<Option<Duration>>,
    log: Option<(String, Arc<Mutex<Vec<String>>>)>,
    submits: AtomicUsize,
    confirms: AtomicUsize,
    confirmed: Mutex<Vec<Vec<u128>>>,
}

impl ScriptedAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn irreversible() -> Self {
        Self {
            irreversible: true,
            ..Self::default()
        }
    }

    /// Append `submit:<name>` to `log` on every submit
    pub fn log_to(mut self, name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = Some((name.to_string(), log));
        self
    }

    pub fn submit_returns(&self, submission: Submission) {
        *self.submission.lock().unwrap() = submission;
    }

    /// Fail the next submit once
    pub fn fail_submit(&self, error: BridgeError) {
        self.submit_failures.lock().unwrap().push_back(error);
    }

    /// Fail the next confirm once
    pub fn fail_confirm(&self, error: BridgeError) {
        self.confirm_failures.lock().unwrap().push_back(error);
    }

    /// Stall the next submit once, after it counted the call
    pub fn stall_submit(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    /// Stall the next confirm once
    pub fn stall_confirm(&self, delay: Duration) {
        *self.confirm_delay.lock().unwrap() = Some(delay);
    }

    /// Progress message reported from every submit
    pub fn report_progress(&self, message: &str) {
        *self.progress.lock().unwrap() = Some(message.to_string());
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn confirm_count(&self) -> usize {
        self.confirms.load(Ordering::SeqCst)
    }

    /// Submission ids seen by each confirm call
    pub fn confirmed_ids(&self) -> Vec<Vec<u128>> {
        self.confirmed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepAction for ScriptedAction {
    fn irreversible(&self) -> bool {
        self.irreversible
    }

    async fn submit(&self, ctx: &StepContext) -> BridgeResult<Submission> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some((name, log)) = &self.log {
            log.lock().unwrap().push(format!("submit:{}", name));
        }
        let progress = self.progress.lock().unwrap().clone();
        if let Some(message) = progress {
            ctx.progress.report(&message);
        }
        let stall = self.submit_delay.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.submit_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.submission.lock().unwrap().clone())
    }

    async fn confirm(&self, submission: &Submission, _ctx: &StepContext) -> BridgeResult<()> {
        self.confirms.fetch_add(1, Ordering::SeqCst);
        self.confirmed.lock().unwrap().push(submission.ids.clone());
        let stall = self.confirm_delay.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.confirm_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}
