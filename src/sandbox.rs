//! Ephemeral evaluation of operator-authored code: subject expressions,
//! embedded-expression templates, and resumable flow programs.
//!
//! Every entry point builds a fresh `rhai::Engine`, evaluates, and drops it;
//! no interpreter state survives a call, and the engine exposes only the
//! string/numeric standard library (no modules, no I/O).

mod template;

use std::sync::Arc;
use std::sync::RwLock;

use rhai::serde::from_dynamic;
use rhai::serde::to_dynamic;
use rhai::Dynamic;
use rhai::Engine;
use rhai::EvalAltResult;
use rhai::FnPtr;
use rhai::Position;
use rhai::Scope;
use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    /// Authored code failed to compile or threw at runtime.
    #[error("Script error: {0}")]
    Script(String),
    /// Authored code produced a value the engine cannot carry back out
    /// (e.g. attributes that are no longer a JSON document).
    #[error("Script produced an unusable value: {0}")]
    Convert(String),
}

/// A command yielded by a flow program, constructed through the runtime
/// object passed as the flow's second parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowCommand {
    SendEmail { template_id: String },
    Wait { duration: WaitDuration },
    SendSms { message: String },
}

/// Additive duration components for `rt.wait`; a week is seven days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitDuration {
    pub seconds: i64,
    pub minutes: i64,
    pub hours: i64,
    pub days: i64,
    pub weeks: i64,
}

impl WaitDuration {
    fn from_map(map: &rhai::Map) -> Result<Self, String> {
        let mut duration = Self::default();
        for (key, value) in map {
            let amount = value
                .as_int()
                .map_err(|t| format!("Duration component {key:?} must be an integer, got {t}"))?;
            match key.as_str() {
                "seconds" => duration.seconds = amount,
                "minutes" => duration.minutes = amount,
                "hours" => duration.hours = amount,
                "days" => duration.days = amount,
                "weeks" => duration.weeks = amount,
                other => return Err(format!("Unknown duration component {other:?}")),
            }
        }
        Ok(duration)
    }

    pub fn to_duration(&self) -> chrono::Duration {
        let seconds = self.seconds
            + self.minutes * 60
            + self.hours * 3600
            + self.days * 86_400
            + self.weeks * 7 * 86_400;
        chrono::Duration::seconds(seconds)
    }
}

/// The result of driving a flow one yield forward.
#[derive(Debug)]
pub struct StepOutcome {
    /// The command produced by the target yield; `None` when the program
    /// returned instead of yielding.
    pub command: Option<FlowCommand>,
    pub done: bool,
    /// `ctx.attributes` as the flow left it.
    pub attributes: Value,
}

/// `source` must evaluate to a one-parameter closure; the result is coerced
/// to a string.
pub fn eval_user_expr(
    source: &str,
    user: &Value,
) -> Result<String, SandboxError> {
    let engine = new_engine();
    let (ast, f) = compile_closure(&engine, source)?;
    let user = to_dynamic(user).map_err(convert_err)?;
    let out: Dynamic = f
        .call(&engine, &ast, (user,))
        .map_err(|e| SandboxError::Script(e.to_string()))?;
    Ok(coerce_string(out))
}

/// `source` must evaluate to a two-parameter closure over `(user, event)`.
pub fn eval_user_event_expr(
    source: &str,
    user: &Value,
    event: &Value,
) -> Result<String, SandboxError> {
    let engine = new_engine();
    let (ast, f) = compile_closure(&engine, source)?;
    let user = to_dynamic(user).map_err(convert_err)?;
    let event = to_dynamic(event).map_err(convert_err)?;
    let out: Dynamic = f
        .call(&engine, &ast, (user, event))
        .map_err(|e| SandboxError::Script(e.to_string()))?;
    Ok(coerce_string(out))
}

/// Render template text with `<%= expr %>`/`<% stmt %>` tags. The preamble
/// runs first as a statement block; `vars` are bound as top-level names.
pub fn render_template(
    html_source: &str,
    preamble_source: &str,
    vars: &[(&str, &Value)],
) -> Result<String, SandboxError> {
    let body = template::compile(html_source).map_err(SandboxError::Script)?;
    let script = format!("{preamble_source}\n{body}");

    let engine = new_engine();
    let mut scope = Scope::new();
    for (name, value) in vars {
        scope.push_dynamic(*name, to_dynamic(value).map_err(convert_err)?);
    }
    let out: Dynamic = engine
        .eval_with_scope(&mut scope, &script)
        .map_err(|e| SandboxError::Script(e.to_string()))?;
    Ok(coerce_string(out))
}

/// Drive `flow_source` from its beginning through `target_index + 1` yields.
///
/// `attr_states[i]` is presented as `ctx.attributes` immediately before the
/// i-th yield is produced, so conditional branches replay exactly as they
/// ran on earlier ticks; the caller supplies one state per yield up to and
/// including the target. The (possibly mutated) attributes are read back
/// after the advance.
pub fn step_flow(
    flow_source: &str,
    attr_states: &[Value],
    target_index: usize,
) -> Result<StepOutcome, SandboxError> {
    debug_assert_eq!(attr_states.len(), target_index + 1);

    let mut engine = new_engine();
    register_flow_types(&mut engine);
    let (ast, f) = compile_closure(&engine, flow_source)?;

    let attr_states = attr_states
        .iter()
        .map(to_dynamic)
        .collect::<Result<Vec<_>, _>>()
        .map_err(convert_err)?;
    let state = Arc::new(RwLock::new(StepState {
        target: target_index,
        yields_seen: 0,
        attributes: attr_states[0].clone(),
        attr_states,
        emitted: None,
    }));

    let ctx = FlowContext {
        state: state.clone(),
    };
    let rt = FlowRuntime {
        state: state.clone(),
    };
    let result: Result<Dynamic, _> = f.call(&engine, &ast, (ctx, rt));

    let mut state = state
        .write()
        .map_err(|_| SandboxError::Convert("flow state lock poisoned".to_string()))?;
    let attributes: Value = from_dynamic(&state.attributes).map_err(convert_err)?;

    match result {
        Ok(_) => Ok(StepOutcome {
            command: None,
            done: true,
            attributes,
        }),
        Err(e) if is_yield_break(&e) => Ok(StepOutcome {
            command: state.emitted.take(),
            done: false,
            attributes,
        }),
        Err(e) => Err(SandboxError::Script(e.to_string())),
    }
}

/// Raised by the runtime object to stop evaluation once the target yield
/// has produced its command.
const YIELD_BREAK: &str = "segflow::yield_break";

struct StepState {
    target: usize,
    yields_seen: usize,
    attr_states: Vec<Dynamic>,
    /// Current value of `ctx.attributes`; rebound between yields, mutable
    /// from the script.
    attributes: Dynamic,
    emitted: Option<FlowCommand>,
}

/// The flow's first parameter: exposes `ctx.attributes`.
#[derive(Clone)]
struct FlowContext {
    state: Arc<RwLock<StepState>>,
}

impl FlowContext {
    fn attributes(&mut self) -> Result<Dynamic, Box<EvalAltResult>> {
        Ok(self.state.read().map_err(lock_err)?.attributes.clone())
    }

    fn set_attributes(
        &mut self,
        value: Dynamic,
    ) -> Result<(), Box<EvalAltResult>> {
        self.state.write().map_err(lock_err)?.attributes = value;
        Ok(())
    }
}

/// The flow's second parameter: each command constructor is one yield.
#[derive(Clone)]
struct FlowRuntime {
    state: Arc<RwLock<StepState>>,
}

impl FlowRuntime {
    fn send_email(
        &mut self,
        template_id: &str,
    ) -> Result<(), Box<EvalAltResult>> {
        self.advance(FlowCommand::SendEmail {
            template_id: template_id.to_string(),
        })
    }

    fn wait(
        &mut self,
        duration: rhai::Map,
    ) -> Result<(), Box<EvalAltResult>> {
        let duration = WaitDuration::from_map(&duration)?;
        self.advance(FlowCommand::Wait { duration })
    }

    fn send_sms(
        &mut self,
        message: &str,
    ) -> Result<(), Box<EvalAltResult>> {
        self.advance(FlowCommand::SendSms {
            message: message.to_string(),
        })
    }

    fn advance(
        &mut self,
        command: FlowCommand,
    ) -> Result<(), Box<EvalAltResult>> {
        let mut state = self.state.write().map_err(lock_err)?;
        let index = state.yields_seen;
        state.yields_seen += 1;
        if index >= state.target {
            state.emitted = Some(command);
            return Err(
                EvalAltResult::ErrorRuntime(Dynamic::from(YIELD_BREAK), Position::NONE).into(),
            );
        }
        // rebind the snapshot the flow will observe at the next yield
        state.attributes = state.attr_states[index + 1].clone();
        Ok(())
    }
}

fn new_engine() -> Engine { Engine::new() }

fn register_flow_types(engine: &mut Engine) {
    engine.register_type_with_name::<FlowContext>("FlowContext");
    engine.register_get("attributes", FlowContext::attributes);
    engine.register_set("attributes", FlowContext::set_attributes);
    engine.register_type_with_name::<FlowRuntime>("FlowRuntime");
    engine.register_fn("send_email", FlowRuntime::send_email);
    engine.register_fn("wait", FlowRuntime::wait);
    engine.register_fn("send_sms", FlowRuntime::send_sms);
}

/// Compile and evaluate a source whose result must be a closure.
fn compile_closure(
    engine: &Engine,
    source: &str,
) -> Result<(rhai::AST, FnPtr), SandboxError> {
    let ast = engine
        .compile(source)
        .map_err(|e| SandboxError::Script(e.to_string()))?;
    let f: FnPtr = engine
        .eval_ast(&ast)
        .map_err(|e| SandboxError::Script(format!("Source is not a function: {e}")))?;
    Ok((ast, f))
}

fn is_yield_break(e: &EvalAltResult) -> bool {
    match e {
        EvalAltResult::ErrorRuntime(token, _) => {
            token.clone().into_string().is_ok_and(|s| s == YIELD_BREAK)
        }
        // errors crossing a function-call boundary come back wrapped
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_yield_break(inner),
        _ => false,
    }
}

fn coerce_string(value: Dynamic) -> String {
    if value.is_string() {
        value.into_string().unwrap_or_default()
    } else {
        value.to_string()
    }
}

fn convert_err(e: Box<EvalAltResult>) -> SandboxError { SandboxError::Convert(e.to_string()) }

fn lock_err<E>(_: E) -> Box<EvalAltResult> { "flow state lock poisoned".into() }
