//! Scripted canister transport
//!
//! Replies are keyed by method name and shared by query and update calls.
//! A script of several replies is consumed in order; its last reply repeats.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::{AdapterError, AdapterResult};
use crate::ic::CanisterTransport;

/// One recorded canister call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub canister: String,
    pub method: String,
    pub arg: Value,
    pub update: bool,
}

#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<AdapterResult<Value>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `method` with `reply`, replacing any script
    pub fn on(&self, method: &str, reply: Value) {
        self.script(method, vec![reply]);
    }

    /// Answer successive calls to `method` with `replies`
    pub fn script(&self, method: &str, replies: Vec<Value>) {
        let mut map = self.replies.lock().unwrap();
        map.insert(method.to_string(), replies.into_iter().map(Ok).collect());
    }

    /// Fail every call to `method`
    pub fn fail(&self, method: &str, error: AdapterError) {
        let mut map = self.replies.lock().unwrap();
        map.insert(method.to_string(), VecDeque::from(vec![Err(error)]));
    }

    /// Arguments of every call made to `method`, oldest first
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .map(|c| c.arg.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn reply(&self, canister: &str, method: &str, arg: Value, update: bool) -> AdapterResult<Value> {
        self.calls.lock().unwrap().push(RecordedCall {
            canister: canister.to_string(),
            method: method.to_string(),
            arg,
            update,
        });
        let mut map = self.replies.lock().unwrap();
        let script = map
            .get_mut(method)
            .ok_or_else(|| AdapterError::rpc("scripted", format!("no reply scripted for {}", method)))?;
        if script.len() > 1 {
            script
                .pop_front()
                .unwrap_or_else(|| Err(AdapterError::rpc("scripted", "empty script")))
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(AdapterError::rpc("scripted", "empty script")))
        }
    }
}

#[async_trait]
impl CanisterTransport for ScriptedTransport {
    async fn query(&self, canister: &str, method: &str, arg: Value) -> AdapterResult<Value> {
        self.reply(canister, method, arg, false)
    }

    async fn update(&self, canister: &str, method: &str, arg: Value) -> AdapterResult<Value> {
        self.reply(canister, method, arg, true)
    }
}
