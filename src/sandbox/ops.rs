//! Host functions exposed to the guest.
//!
//! Every capability the guest can touch goes through one of these ops; the
//! bootstrap script captures the handles in closure scope and freezes the
//! wrapper objects so untrusted code cannot replace them.

use std::cell::RefCell;
use std::rc::Rc;

use deno_core::anyhow::anyhow;
use deno_core::error::AnyError;
use deno_core::{OpState, op2};
use crate::fetch::{FetchEnv, FetchOptions};
use crate::store::ScopedStore;
use crate::worker::CommandBridge;

use super::util;

/// Per-submission context stashed in the op state.
pub struct JobContext {
    /// Raw caller msg (not the filtered view; filtering happens at each
    /// export site).
    pub msg: serde_json::Value,
}

/// Final result envelope reported by the driver script.
#[derive(Default)]
pub struct EvalResult(pub Option<String>);

deno_core::extension!(
    potat_ext,
    ops = [
        op_potat_fetch,
        op_potat_store_get,
        op_potat_store_set,
        op_potat_store_del,
        op_potat_store_len,
        op_potat_store_ex,
        op_potat_command,
        op_potat_report,
        op_potat_random_string,
        op_potat_random_int,
        op_potat_atob,
        op_potat_btoa,
        op_potat_humanize,
    ],
);

/// Scope flags arrive as arbitrary guest values; anything non-numeric
/// means "use the default key".
fn flag_of(value: &serde_json::Value) -> Option<f64> {
    value.as_f64()
}

fn msg_of(state: &Rc<RefCell<OpState>>) -> serde_json::Value {
    state.borrow().borrow::<JobContext>().msg.clone()
}

#[op2(async)]
#[serde]
pub async fn op_potat_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[serde] options: Option<FetchOptions>,
) -> Result<serde_json::Value, AnyError> {
    let (env, msg) = {
        let state = state.borrow();
        (state.borrow::<Rc<FetchEnv>>().clone(), state.borrow::<JobContext>().msg.clone())
    };
    env.fetch(&url, options.unwrap_or_default(), &msg)
        .await
        .map_err(|message| anyhow!(message))
}

#[op2(async)]
#[serde]
pub async fn op_potat_store_get(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    #[serde] flag: serde_json::Value,
) -> Result<serde_json::Value, AnyError> {
    let store = state.borrow().borrow::<Rc<ScopedStore>>().clone();
    let msg = msg_of(&state);
    store
        .get(&msg, &key, flag_of(&flag))
        .await
        .map_err(|message| anyhow!(message))
}

#[op2(async)]
#[serde]
pub async fn op_potat_store_set(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    #[serde] value: serde_json::Value,
    #[serde] flag: serde_json::Value,
    #[serde] ex: serde_json::Value,
) -> Result<serde_json::Value, AnyError> {
    let store = state.borrow().borrow::<Rc<ScopedStore>>().clone();
    let msg = msg_of(&state);
    store
        .set(&msg, &key, &value, flag_of(&flag), ex.as_f64())
        .await
        .map_err(|message| anyhow!(message))
}

#[op2(async)]
#[serde]
pub async fn op_potat_store_del(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    #[serde] flag: serde_json::Value,
) -> Result<serde_json::Value, AnyError> {
    let store = state.borrow().borrow::<Rc<ScopedStore>>().clone();
    let msg = msg_of(&state);
    store
        .del(&msg, &key, flag_of(&flag))
        .await
        .map_err(|message| anyhow!(message))
}

#[op2(async)]
#[serde]
pub async fn op_potat_store_len(
    state: Rc<RefCell<OpState>>,
    #[serde] flag: serde_json::Value,
) -> Result<serde_json::Value, AnyError> {
    let store = state.borrow().borrow::<Rc<ScopedStore>>().clone();
    let msg = msg_of(&state);
    store
        .len(&msg, flag_of(&flag))
        .await
        .map_err(|message| anyhow!(message))
}

#[op2(async)]
#[serde]
pub async fn op_potat_store_ex(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    seconds: f64,
    #[serde] flag: serde_json::Value,
) -> Result<serde_json::Value, AnyError> {
    let store = state.borrow().borrow::<Rc<ScopedStore>>().clone();
    let msg = msg_of(&state);
    store
        .ex(&msg, &key, seconds, flag_of(&flag))
        .await
        .map_err(|message| anyhow!(message))
}

#[op2(async)]
#[serde]
pub async fn op_potat_command(
    state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[string] text: String,
) -> Result<serde_json::Value, AnyError> {
    let (bridge, msg) = {
        let state = state.borrow();
        (state.borrow::<CommandBridge>().clone(), state.borrow::<JobContext>().msg.clone())
    };
    bridge
        .call(&name, &text, &msg)
        .await
        .map_err(|message| anyhow!(message))
}

/// The driver script reports its `{ok}` / `{error}` envelope here.
#[op2(fast)]
pub fn op_potat_report(state: &mut OpState, #[string] payload: String) {
    state.put(EvalResult(Some(payload)));
}

#[op2]
#[string]
pub fn op_potat_random_string(#[smi] length: u32) -> String {
    util::random_string(length as usize)
}

#[op2(fast)]
pub fn op_potat_random_int(min: f64, max: f64) -> f64 {
    util::random_int(min, max) as f64
}

#[op2]
#[string]
pub fn op_potat_atob(#[string] data: String) -> Result<String, AnyError> {
    util::atob(&data).map_err(|message| anyhow!(message))
}

#[op2]
#[string]
pub fn op_potat_btoa(#[string] data: String) -> Result<String, AnyError> {
    util::btoa(&data).map_err(|message| anyhow!(message))
}

#[op2]
#[string]
pub fn op_potat_humanize(ms: f64) -> String {
    util::humanize_duration(ms)
}
