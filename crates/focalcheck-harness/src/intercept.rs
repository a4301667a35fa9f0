//! Call interception for the external dependencies of a focal routine.
//!
//! A [`CallInterceptor`] maps dependency names to either a *binding* (a
//! test-scoped substitute with a call log and scripted responses) or a *real
//! implementation* (the behavior the name has when nothing is bound). Code
//! under test reaches dependencies through a [`Dependency`] handle and never
//! learns which of the two answered.
//!
//! Bindings are released when their [`BindingGuard`] drops, which also covers
//! unwinding out of a faulting case. The table lives behind a
//! `parking_lot::Mutex`, which does not poison, so the release path can always
//! read it after a panic inside a substitute.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A scripted or real answer: a JSON value, or a failure message.
pub type Response = Result<Value, String>;

/// Real implementation of a dependency, used when no binding is active.
pub type RealFn = Arc<dyn Fn(&Value) -> Response + Send + Sync>;

/// Substitute computed from the call arguments.
pub type RuleFn = Box<dyn FnMut(&Value) -> Response + Send>;

type SharedRule = Arc<Mutex<RuleFn>>;

/// Returned when a binding has nothing scripted: the unit/success sentinel.
pub const DEFAULT_RESPONSE: Value = Value::Null;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("dependency '{name}' is already bound by an active binding")]
    AlreadyBound { name: String },
    #[error("dependency '{name}' has no binding and no real implementation")]
    NotBound { name: String },
    #[error("dependency '{name}' returned scripted failure: {message}")]
    Scripted { name: String, message: String },
    #[error("real implementation of '{name}' failed: {message}")]
    Real { name: String, message: String },
    #[error("arguments for '{name}' could not be captured: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response of '{name}' has an unexpected shape: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One observed invocation of a bound dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedCall {
    /// Position in the interceptor-wide call order, starting at 1.
    pub sequence: u64,
    /// Argument snapshot taken at call time.
    pub arguments: Value,
}

/// How a binding answers its calls.
pub enum ResponseScript {
    /// Always answer [`DEFAULT_RESPONSE`].
    Default,
    /// Answer the same response on every call.
    Always(Response),
    /// Answer in order; once exhausted, repeat the last answer and leave a note.
    Sequence(VecDeque<Response>),
    /// Compute the answer from the argument snapshot.
    ///
    /// Runs with the interceptor table unlocked, so it may call other
    /// dependencies. A rule that re-enters its own binding gets a scripted
    /// failure instead of recursing.
    Rule(RuleFn),
}

impl ResponseScript {
    #[must_use]
    pub fn always(value: Value) -> Self {
        Self::Always(Ok(value))
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::Always(Err(message.into()))
    }

    /// Successful answers, in order.
    pub fn sequence(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Sequence(values.into_iter().map(Ok).collect())
    }

    /// Mixed successes and failures, in order.
    pub fn responses(responses: impl IntoIterator<Item = Response>) -> Self {
        Self::Sequence(responses.into_iter().collect())
    }

    pub fn rule(f: impl FnMut(&Value) -> Response + Send + 'static) -> Self {
        Self::Rule(Box::new(f))
    }
}

impl fmt::Debug for ResponseScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Always(r) => f.debug_tuple("Always").field(r).finish(),
            Self::Sequence(q) => f.debug_tuple("Sequence").field(q).finish(),
            Self::Rule(_) => f.write_str("Rule(..)"),
        }
    }
}

struct Binding {
    generation: u64,
    script: ResponseScript,
    rule: Option<SharedRule>,
    scripted: usize,
    last: Option<Response>,
    calls: Vec<CapturedCall>,
    exhaustion_noted: bool,
}

impl Binding {
    fn new(generation: u64, script: ResponseScript) -> Self {
        let scripted = match &script {
            ResponseScript::Sequence(q) => q.len(),
            _ => 0,
        };
        let (script, rule) = match script {
            ResponseScript::Rule(f) => (ResponseScript::Default, Some(Arc::new(Mutex::new(f)))),
            other => (other, None),
        };
        Self {
            generation,
            script,
            rule,
            scripted,
            last: None,
            calls: Vec::new(),
            exhaustion_noted: false,
        }
    }

    fn respond(&mut self, name: &str, notes: &mut Vec<String>) -> Response {
        match &mut self.script {
            // Rules are lifted into `Binding::rule` on bind.
            ResponseScript::Default | ResponseScript::Rule(_) => Ok(DEFAULT_RESPONSE),
            ResponseScript::Always(response) => response.clone(),
            ResponseScript::Sequence(queue) => match queue.pop_front() {
                Some(response) => {
                    self.last = Some(response.clone());
                    response
                }
                None => {
                    if !self.exhaustion_noted {
                        self.exhaustion_noted = true;
                        notes.push(format!(
                            "'{name}' invoked {} times but only {} responses were scripted; repeating {}",
                            self.calls.len(),
                            self.scripted,
                            if self.last.is_some() { "the last response" } else { "the default response" },
                        ));
                    }
                    self.last.clone().unwrap_or(Ok(DEFAULT_RESPONSE))
                }
            },
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("generation", &self.generation)
            .field("script", &self.script)
            .field("rule", &self.rule.is_some())
            .field("calls", &self.calls.len())
            .finish_non_exhaustive()
    }
}

/// Where an answer comes from once the table is unlocked.
enum Deferred {
    Rule(SharedRule),
    Real(RealFn),
}

#[derive(Default)]
struct InterceptorState {
    bindings: BTreeMap<String, Binding>,
    reals: BTreeMap<String, RealFn>,
    next_sequence: u64,
    next_generation: u64,
    notes: Vec<String>,
}

/// Dependency table shared by a case, its substitutes and its guards.
#[derive(Clone, Default)]
pub struct CallInterceptor {
    state: Arc<Mutex<InterceptorState>>,
}

impl fmt::Debug for CallInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallInterceptor")
            .field("bound", &state.bindings.keys().collect::<Vec<_>>())
            .field("reals", &state.reals.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CallInterceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interceptor whose unbound names fall through to `reals`.
    #[must_use]
    pub fn with_reals(reals: BTreeMap<String, RealFn>) -> Self {
        let interceptor = Self::new();
        interceptor.state.lock().reals = reals;
        interceptor
    }

    /// Register (or replace) the real implementation of `name`.
    pub fn provide_real(
        &self,
        name: impl Into<String>,
        f: impl Fn(&Value) -> Response + Send + Sync + 'static,
    ) {
        self.state.lock().reals.insert(name.into(), Arc::new(f));
    }

    /// Substitute `name` until the returned guard drops.
    ///
    /// Fails with [`InterceptError::AlreadyBound`] if an unreleased binding
    /// exists; that binding stays active and keeps its log.
    pub fn bind(
        &self,
        name: impl Into<String>,
        script: ResponseScript,
    ) -> Result<BindingGuard, InterceptError> {
        let name = name.into();
        let mut state = self.state.lock();
        if state.bindings.contains_key(&name) {
            return Err(InterceptError::AlreadyBound { name });
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .bindings
            .insert(name.clone(), Binding::new(generation, script));
        Ok(BindingGuard {
            interceptor: self.clone(),
            name,
            generation,
        })
    }

    /// Call `name` with `args`.
    ///
    /// A bound name logs the call and answers from its script; an unbound
    /// name is forwarded to its real implementation without being logged.
    pub fn invoke<A>(&self, name: &str, args: &A) -> Result<Value, InterceptError>
    where
        A: Serialize + ?Sized,
    {
        let arguments = serde_json::to_value(args).map_err(|source| InterceptError::Encode {
            name: name.to_string(),
            source,
        })?;

        let deferred = {
            let mut guard = self.state.lock();
            let InterceptorState {
                bindings,
                reals,
                next_sequence,
                notes,
                ..
            } = &mut *guard;

            if let Some(binding) = bindings.get_mut(name) {
                *next_sequence += 1;
                binding.calls.push(CapturedCall {
                    sequence: *next_sequence,
                    arguments: arguments.clone(),
                });
                if let Some(rule) = &binding.rule {
                    Deferred::Rule(Arc::clone(rule))
                } else {
                    let response = binding.respond(name, notes);
                    return response.map_err(|message| InterceptError::Scripted {
                        name: name.to_string(),
                        message,
                    });
                }
            } else {
                match reals.get(name) {
                    Some(real) => Deferred::Real(Arc::clone(real)),
                    None => {
                        return Err(InterceptError::NotBound {
                            name: name.to_string(),
                        });
                    }
                }
            }
        };

        match deferred {
            Deferred::Rule(rule) => {
                let response = match rule.try_lock() {
                    Some(mut f) => f(&arguments),
                    None => Err(format!("rule for '{name}' re-entered its own binding")),
                };
                response.map_err(|message| InterceptError::Scripted {
                    name: name.to_string(),
                    message,
                })
            }
            Deferred::Real(real) => real(&arguments).map_err(|message| InterceptError::Real {
                name: name.to_string(),
                message,
            }),
        }
    }

    /// [`invoke`](Self::invoke) and deserialize the answer.
    pub fn invoke_as<T, A>(&self, name: &str, args: &A) -> Result<T, InterceptError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let value = self.invoke(name, args)?;
        serde_json::from_value(value).map_err(|source| InterceptError::Decode {
            name: name.to_string(),
            source,
        })
    }

    /// Callable handle for code under test.
    #[must_use]
    pub fn dependency(&self, name: impl Into<String>) -> Dependency {
        Dependency {
            interceptor: self.clone(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn is_bound(&self, name: &str) -> bool {
        self.state.lock().bindings.contains_key(name)
    }

    /// Calls observed by the active binding of `name` (0 when unbound).
    #[must_use]
    pub fn call_count_for(&self, name: &str) -> usize {
        self.state
            .lock()
            .bindings
            .get(name)
            .map_or(0, |b| b.calls.len())
    }

    #[must_use]
    pub fn last_arguments_for(&self, name: &str) -> Option<Value> {
        self.state
            .lock()
            .bindings
            .get(name)
            .and_then(|b| b.calls.last())
            .map(|c| c.arguments.clone())
    }

    #[must_use]
    pub fn calls_for(&self, name: &str) -> Vec<CapturedCall> {
        self.state
            .lock()
            .bindings
            .get(name)
            .map(|b| b.calls.clone())
            .unwrap_or_default()
    }

    /// Drop the binding of `name`, returning its call log.
    pub fn release(&self, name: &str) -> Result<Vec<CapturedCall>, InterceptError> {
        self.state
            .lock()
            .bindings
            .remove(name)
            .map(|b| b.calls)
            .ok_or_else(|| InterceptError::NotBound {
                name: name.to_string(),
            })
    }

    fn release_generation(&self, name: &str, generation: u64) {
        let mut state = self.state.lock();
        if state
            .bindings
            .get(name)
            .is_some_and(|b| b.generation == generation)
        {
            state.bindings.remove(name);
        }
    }

    /// Drop every active binding; returns the released names in order.
    pub fn release_all(&self) -> Vec<String> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.bindings).into_keys().collect()
    }

    /// Observability notes (e.g. over-invoked sequences).
    #[must_use]
    pub fn notes(&self) -> Vec<String> {
        self.state.lock().notes.clone()
    }

    pub(crate) fn take_notes(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().notes)
    }
}

/// Scoped ownership of one binding; releases it on drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the binding immediately"]
pub struct BindingGuard {
    interceptor: CallInterceptor,
    name: String,
    generation: u64,
}

impl BindingGuard {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this guard's binding is still the active one.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.interceptor
            .state
            .lock()
            .bindings
            .get(&self.name)
            .is_some_and(|b| b.generation == self.generation)
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    #[must_use]
    pub fn last_arguments(&self) -> Option<Value> {
        self.calls().last().map(|c| c.arguments.clone())
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CapturedCall> {
        let state = self.interceptor.state.lock();
        match state.bindings.get(&self.name) {
            Some(b) if b.generation == self.generation => b.calls.clone(),
            _ => Vec::new(),
        }
    }

    /// Release now and hand back the call log.
    pub fn release(self) -> Vec<CapturedCall> {
        let calls = self.calls();
        self.interceptor
            .release_generation(&self.name, self.generation);
        calls
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.interceptor
            .release_generation(&self.name, self.generation);
    }
}

/// A named dependency as seen by code under test.
#[derive(Debug, Clone)]
pub struct Dependency {
    interceptor: CallInterceptor,
    name: String,
}

impl Dependency {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call<A: Serialize + ?Sized>(&self, args: &A) -> Result<Value, InterceptError> {
        self.interceptor.invoke(&self.name, args)
    }

    pub fn call_as<T, A>(&self, args: &A) -> Result<T, InterceptError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.interceptor.invoke_as(&self.name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bound_calls_are_logged_in_order() {
        let icpt = CallInterceptor::new();
        let _read = icpt.bind("readFile", ResponseScript::always(json!([1, 2]))).unwrap();
        let _close = icpt.bind("close", ResponseScript::Default).unwrap();

        icpt.invoke("readFile", "a.png").unwrap();
        icpt.invoke("close", &3).unwrap();
        icpt.invoke("readFile", "b.png").unwrap();

        let reads = icpt.calls_for("readFile");
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].sequence, 1);
        assert_eq!(reads[1].sequence, 3);
        assert_eq!(icpt.last_arguments_for("readFile"), Some(json!("b.png")));
        assert_eq!(icpt.calls_for("close")[0].sequence, 2);
    }

    #[test]
    fn double_bind_keeps_the_first_binding() {
        let icpt = CallInterceptor::new();
        let first = icpt.bind("readFile", ResponseScript::always(json!("first"))).unwrap();
        let err = icpt
            .bind("readFile", ResponseScript::always(json!("second")))
            .unwrap_err();
        assert!(matches!(err, InterceptError::AlreadyBound { .. }));
        assert!(first.is_active());
        assert_eq!(icpt.invoke("readFile", &()).unwrap(), json!("first"));
    }

    #[test]
    fn exhausted_sequence_repeats_last_and_notes_it() {
        let icpt = CallInterceptor::new();
        let _g = icpt
            .bind("next", ResponseScript::sequence([json!(1), json!(2)]))
            .unwrap();
        let got: Vec<i64> = (0..4)
            .map(|_| icpt.invoke_as::<i64, _>("next", &()).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 2, 2]);
        let notes = icpt.notes();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("invoked 3 times"), "{notes:?}");
    }

    #[test]
    fn empty_sequence_falls_back_to_default() {
        let icpt = CallInterceptor::new();
        let _g = icpt.bind("hook", ResponseScript::sequence([])).unwrap();
        assert_eq!(icpt.invoke("hook", &()).unwrap(), DEFAULT_RESPONSE);
        assert_eq!(icpt.notes().len(), 1);
    }

    #[test]
    fn scripted_failures_surface_as_errors() {
        let icpt = CallInterceptor::new();
        let _g = icpt
            .bind(
                "open",
                ResponseScript::responses([Err("ENOENT".to_string()), Ok(json!(7))]),
            )
            .unwrap();
        let err = icpt.invoke("open", "x").unwrap_err();
        assert!(matches!(err, InterceptError::Scripted { ref message, .. } if message == "ENOENT"));
        assert_eq!(icpt.invoke_as::<i32, _>("open", "x").unwrap(), 7);
        assert_eq!(icpt.call_count_for("open"), 2);
    }

    #[test]
    fn rule_sees_arguments() {
        let icpt = CallInterceptor::new();
        let _g = icpt
            .bind(
                "double",
                ResponseScript::rule(|args| {
                    let n = args.as_i64().ok_or("not a number")?;
                    Ok(json!(n * 2))
                }),
            )
            .unwrap();
        assert_eq!(icpt.invoke_as::<i64, _>("double", &21).unwrap(), 42);
        assert!(icpt.invoke("double", "x").is_err());
    }

    #[test]
    fn rule_can_delegate_to_another_dependency() {
        let icpt = CallInterceptor::new();
        icpt.provide_real("stat", |_| Ok(json!(4096)));
        let _inner = icpt.bind("inflate", ResponseScript::always(json!("Z_OK"))).unwrap();
        let delegate = icpt.clone();
        let _outer = icpt
            .bind(
                "open",
                ResponseScript::rule(move |args| {
                    let status = delegate.invoke("inflate", args).map_err(|e| e.to_string())?;
                    let size = delegate.invoke("stat", args).map_err(|e| e.to_string())?;
                    Ok(json!({
                        "status": status,
                        "size": size,
                        "inflate_calls": delegate.call_count_for("inflate"),
                        "open_bound": delegate.is_bound("open"),
                    }))
                }),
            )
            .unwrap();

        let answer = icpt.invoke("open", "image.png").unwrap();
        assert_eq!(
            answer,
            json!({ "status": "Z_OK", "size": 4096, "inflate_calls": 1, "open_bound": true })
        );
        let open = icpt.calls_for("open");
        let inflate = icpt.calls_for("inflate");
        assert_eq!(open[0].sequence, 1);
        assert_eq!(inflate[0].sequence, 2);
        assert_eq!(inflate[0].arguments, json!("image.png"));
    }

    #[test]
    fn rule_reentering_itself_fails_instead_of_hanging() {
        let icpt = CallInterceptor::new();
        let again = icpt.clone();
        let _g = icpt
            .bind(
                "walk",
                ResponseScript::rule(move |_| match again.invoke("walk", &()) {
                    Err(InterceptError::Scripted { message, .. }) => Ok(json!(message)),
                    other => Err(format!("unexpected nested answer: {other:?}")),
                }),
            )
            .unwrap();

        let answer = icpt.invoke("walk", &()).unwrap();
        assert_eq!(answer, json!("rule for 'walk' re-entered its own binding"));
        assert_eq!(icpt.call_count_for("walk"), 2);
    }

    #[test]
    fn release_restores_real_implementation() {
        let icpt = CallInterceptor::new();
        icpt.provide_real("len", |args| Ok(json!(args.as_str().map_or(0, str::len))));
        assert_eq!(icpt.invoke("len", "abc").unwrap(), json!(3));

        let guard = icpt.bind("len", ResponseScript::always(json!(99))).unwrap();
        assert_eq!(icpt.invoke("len", "abc").unwrap(), json!(99));
        let log = guard.release();
        assert_eq!(log.len(), 1);

        assert!(!icpt.is_bound("len"));
        assert_eq!(icpt.invoke("len", "abc").unwrap(), json!(3));
        assert_eq!(icpt.call_count_for("len"), 0);
    }

    #[test]
    fn stale_guard_does_not_release_a_newer_binding() {
        let icpt = CallInterceptor::new();
        let old = icpt.bind("x", ResponseScript::always(json!(1))).unwrap();
        icpt.release("x").unwrap();
        let _new = icpt.bind("x", ResponseScript::always(json!(2))).unwrap();
        assert!(!old.is_active());
        drop(old);
        assert_eq!(icpt.invoke("x", &()).unwrap(), json!(2));
    }

    #[test]
    fn guard_releases_during_unwind() {
        let icpt = CallInterceptor::new();
        let inner = icpt.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _g = inner.bind("fatal", ResponseScript::Default).unwrap();
            panic!("library fatal error handler");
        }));
        assert!(result.is_err());
        assert!(!icpt.is_bound("fatal"));
    }

    #[test]
    fn unbound_without_real_is_an_error() {
        let icpt = CallInterceptor::new();
        assert!(matches!(
            icpt.invoke("missing", &()),
            Err(InterceptError::NotBound { .. })
        ));
        assert!(icpt.release("missing").is_err());
    }

    #[test]
    fn decode_error_names_the_dependency() {
        let icpt = CallInterceptor::new();
        let _g = icpt.bind("size", ResponseScript::always(json!("big"))).unwrap();
        let dep = icpt.dependency("size");
        let err = dep.call_as::<u32, _>(&()).unwrap_err();
        assert!(matches!(err, InterceptError::Decode { ref name, .. } if name == "size"));
    }
}
