//! Response scripts.
//!
//! A template's `script` is JavaScript executed after a successful response in
//! an embedded QuickJS interpreter. The script only sees what the host hands
//! it:
//!
//! - `resp`: the parsed response body (`null` when the body is not JSON),
//! - `args`: the run parameters,
//! - `supply`: the effective supply for this ammo,
//! - `ammo`: the campaign request table,
//! - `reload(targets, repeat?, supply?)`: queue more ammo, where `targets` is an
//!   ammo name, a template object, or an array of those.
//!
//! Calls to `reload` and assignments to `supply` are recorded as
//! [`ScriptEffects`] and applied by the engine once the script has returned,
//! or thrown; nothing else leaves the interpreter.
//!
//! ```js
//! supply.user = resp.user.id;
//! for (const order of resp.orders) {
//!     reload(ammo.getOrder, 1, { order: order.id });
//! }
//! ```
use std::{
    cell::RefCell,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Function, Object, Runtime, Value as JsValue,
    function::Opt,
};
use serde_json::Value;

use crate::{error::AmmoError, supply::Supply};

/// Memory available to one script invocation.
const MEMORY_LIMIT: usize = 64 * 1024 * 1024;
/// Wall time after which a running script is interrupted.
const TIME_LIMIT: Duration = Duration::from_secs(5);

/// What a script can read.
#[derive(Debug, Clone, Copy)]
pub struct ScriptScope<'a> {
    /// Raw response body.
    pub response: &'a str,
    pub args: &'a Value,
    pub supply: &'a Supply,
    /// Request table, name to template.
    pub ammo: &'a Value,
}

/// A `reload(...)` call made by a script.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadCall {
    /// Name, template object, or an array of those.
    pub targets: Value,
    pub repeat: Option<usize>,
    pub supply: Supply,
}

/// Everything a finished script asked the host to do.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScriptEffects {
    pub reloads: Vec<ReloadCall>,
    /// Supply keys the script added or changed.
    pub supply_updates: Supply,
}

#[derive(Default)]
struct RawCall {
    targets: String,
    repeat: Option<i32>,
    supply: Option<String>,
}

/// Outcome of one invocation.
///
/// A script that throws half way keeps the effects it recorded before the
/// throw; `error` says why it stopped.
#[derive(Debug, Default)]
pub struct ScriptRun {
    pub effects: ScriptEffects,
    pub error: Option<AmmoError>,
}

/// The `supply` object as JSON text before and after the call, and what the
/// script threw, if anything.
struct Snapshots {
    before: String,
    after: String,
    thrown: Option<String>,
}

impl Snapshots {
    /// Keys whose value differs from what the script was given.
    ///
    /// Both sides went through JS numbers, so values the script never touched
    /// compare equal even when JS cannot represent them exactly.
    fn updates(&self) -> Result<Supply, AmmoError> {
        let before: Supply = serde_json::from_str(&self.before)
            .map_err(|e| AmmoError::Script(format!("cannot read `supply`: {e}")))?;
        let after: Supply = serde_json::from_str(&self.after)
            .map_err(|e| AmmoError::Script(format!("`supply` is no longer an object: {e}")))?;
        Ok(after
            .into_iter()
            .filter(|(k, v)| before.get(k) != Some(v))
            .collect())
    }
}

/// A script wrapped for execution.
///
/// "Compiling" only wraps the source into a function taking the sandbox
/// globals as parameters; QuickJS parses the wrapped source again on every
/// run, in a fresh context.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    source: Arc<str>,
}

impl CompiledScript {
    pub fn compile(source: &str) -> Self {
        Self {
            source: format!("(function (reload, resp, args, supply, ammo) {{\n{source}\n}})").into(),
        }
    }

    /// Run the script synchronously. Call from a blocking thread.
    pub fn run(&self, scope: ScriptScope<'_>) -> ScriptRun {
        let calls: Rc<RefCell<Vec<RawCall>>> = Rc::default();
        let (supply_updates, mut error) = match self.execute(scope, calls.clone()) {
            Ok(snapshots) => {
                let mut error = snapshots.thrown.clone().map(AmmoError::Script);
                let updates = snapshots.updates().unwrap_or_else(|e| {
                    error.get_or_insert(e);
                    Supply::new()
                });
                (updates, error)
            }
            Err(e) => (Supply::new(), Some(e)),
        };

        let mut reloads = Vec::new();
        for raw in calls.take() {
            match raw.decode() {
                Ok(call) => reloads.push(call),
                Err(e) => {
                    error.get_or_insert(e);
                }
            }
        }

        ScriptRun {
            effects: ScriptEffects {
                reloads,
                supply_updates,
            },
            error,
        }
    }

    fn execute(
        &self,
        scope: ScriptScope<'_>,
        calls: Rc<RefCell<Vec<RawCall>>>,
    ) -> Result<Snapshots, AmmoError> {
        let script_err = |e: rquickjs::Error| AmmoError::Script(e.to_string());

        let runtime = Runtime::new().map_err(script_err)?;
        runtime.set_memory_limit(MEMORY_LIMIT);
        let started = Instant::now();
        runtime.set_interrupt_handler(Some(Box::new(move || started.elapsed() > TIME_LIMIT)));
        let context = Context::full(&runtime).map_err(script_err)?;

        let snapshots = context
            .with(|ctx| self.call(&ctx, scope, calls))
            .map_err(AmmoError::Script);
        drop(context);
        runtime.run_gc();
        snapshots
    }

    /// Run inside a context. Errors before the script starts are `Err`;
    /// a throw from the script itself is reported in [`Snapshots::thrown`].
    fn call<'js>(
        &self,
        ctx: &Ctx<'js>,
        scope: ScriptScope<'_>,
        calls: Rc<RefCell<Vec<RawCall>>>,
    ) -> Result<Snapshots, String> {
        let resp = match serde_json::from_str::<Value>(scope.response) {
            Ok(_) => json_parse(ctx, scope.response),
            Err(e) => {
                tracing::debug!("Response is not JSON, scripts see `resp = null`: {e}");
                json_parse(ctx, "null")
            }
        }
        .catch(ctx)
        .map_err(|e| format_js_error(&e))?;
        let args = to_js(ctx, scope.args)?;
        let supply = to_js(ctx, scope.supply)?;
        let ammo = to_js(ctx, scope.ammo)?;
        let before = json_stringify(ctx, supply.clone())
            .catch(ctx)
            .map_err(|e| format_js_error(&e))?;

        let reload = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  targets: JsValue<'js>,
                  repeat: Opt<i32>,
                  extra: Opt<JsValue<'js>>|
                  -> rquickjs::Result<()> {
                let targets = json_stringify(&ctx, targets)?;
                let supply = match extra.0 {
                    Some(v) if !v.is_undefined() => Some(json_stringify(&ctx, v)?),
                    _ => None,
                };
                calls.borrow_mut().push(RawCall {
                    targets,
                    repeat: repeat.0,
                    supply,
                });
                Ok(())
            },
        )
        .catch(ctx)
        .map_err(|e| format_js_error(&e))?;

        let func: Function = ctx
            .eval(self.source.as_bytes())
            .catch(ctx)
            .map_err(|e| format_js_error(&e))?;
        let thrown = func
            .call::<_, ()>((reload, resp, args, supply.clone(), ammo))
            .catch(ctx)
            .err()
            .map(|e| format_js_error(&e));

        // an interrupted runtime refuses further calls, keep what we had
        let after = match json_stringify(ctx, supply).catch(ctx) {
            Ok(after) => after,
            Err(_) if thrown.is_some() => before.clone(),
            Err(e) => return Err(format_js_error(&e)),
        };

        Ok(Snapshots {
            before,
            after,
            thrown,
        })
    }
}

impl RawCall {
    fn decode(self) -> Result<ReloadCall, AmmoError> {
        let targets = serde_json::from_str(&self.targets)
            .map_err(|e| AmmoError::Script(format!("bad reload targets: {e}")))?;
        let supply = match self.supply {
            Some(text) => serde_json::from_str::<Option<Supply>>(&text)
                .map_err(|e| AmmoError::Script(format!("bad reload supply: {e}")))?
                .unwrap_or_default(),
            None => Supply::new(),
        };
        Ok(ReloadCall {
            targets,
            repeat: self.repeat.map(|r| r.max(0) as usize),
            supply,
        })
    }
}

fn to_js<'js, T: serde::Serialize>(ctx: &Ctx<'js>, value: &T) -> Result<JsValue<'js>, String> {
    let text = serde_json::to_string(value).map_err(|e| e.to_string())?;
    json_parse(ctx, &text)
        .catch(ctx)
        .map_err(|e| format_js_error(&e))
}

fn json_stringify<'js>(ctx: &Ctx<'js>, value: JsValue<'js>) -> rquickjs::Result<String> {
    let json: Object = ctx.globals().get("JSON")?;
    let stringify: Function = json.get("stringify")?;
    stringify.call((value,))
}

fn json_parse<'js>(ctx: &Ctx<'js>, text: &str) -> rquickjs::Result<JsValue<'js>> {
    let json: Object = ctx.globals().get("JSON")?;
    let parse: Function = json.get("parse")?;
    parse.call((text,))
}

fn format_js_error(error: &CaughtError) -> String {
    match error {
        CaughtError::Exception(ex) => {
            let message = ex.message().unwrap_or_else(|| "unknown error".to_string());
            match ex.stack() {
                Some(stack) => format!("{message}\n{stack}"),
                None => message,
            }
        }
        CaughtError::Value(value) => format!("thrown value: {value:?}"),
        CaughtError::Error(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str, response: &str, supply: &Supply) -> ScriptRun {
        let args = json!({"workers": 2});
        let ammo = json!({"next": {"url": "http://localhost/next"}});
        CompiledScript::compile(source).run(ScriptScope {
            response,
            args: &args,
            supply,
            ammo: &ammo,
        })
    }

    fn effects(source: &str, response: &str, supply: &Supply) -> ScriptEffects {
        let outcome = run(source, response, supply);
        assert!(outcome.error.is_none(), "script failed: {:?}", outcome.error);
        outcome.effects
    }

    #[test]
    fn records_reload_calls() {
        let effects = effects(
            r#"
            for (const id of resp.ids) {
                reload("next", 2, { id: id });
            }
            reload([ammo.next, "next"]);
            "#,
            r#"{"ids": [1, 2]}"#,
            &Supply::new(),
        );

        assert_eq!(effects.reloads.len(), 3);
        assert_eq!(effects.reloads[0].targets, json!("next"));
        assert_eq!(effects.reloads[0].repeat, Some(2));
        assert_eq!(effects.reloads[1].supply["id"], json!(2));
        assert_eq!(
            effects.reloads[2].targets,
            json!([{"url": "http://localhost/next"}, "next"])
        );
        assert_eq!(effects.reloads[2].repeat, None);
        assert!(effects.reloads[2].supply.is_empty());
    }

    #[test]
    fn reports_changed_supply_keys_only() {
        let supply = Supply::from([
            ("kept".to_string(), json!(1)),
            ("changed".to_string(), json!("old")),
        ]);
        let effects = effects(
            "supply.changed = 'new'; supply.added = resp.id * args.workers;",
            r#"{"id": 21}"#,
            &supply,
        );

        assert_eq!(
            effects.supply_updates,
            Supply::from([
                ("changed".to_string(), json!("new")),
                ("added".to_string(), json!(42)),
            ])
        );
        assert!(effects.reloads.is_empty());
    }

    #[test]
    fn untouched_large_integers_are_not_rewritten() {
        let supply = Supply::from([("order".to_string(), json!(1234567890123456789u64))]);
        let effects = effects("supply.other = 1;", "{}", &supply);

        assert_eq!(
            effects.supply_updates,
            Supply::from([("other".to_string(), json!(1))])
        );
    }

    #[test]
    fn non_json_response_is_null() {
        let effects = effects("supply.seen = resp === null;", "<html>", &Supply::new());
        assert_eq!(effects.supply_updates["seen"], json!(true));
    }

    #[test]
    fn thrown_errors_become_script_errors() {
        let outcome = run("throw new Error('boom');", "{}", &Supply::new());
        assert!(matches!(outcome.error, Some(AmmoError::Script(ref msg)) if msg.contains("boom")));

        let outcome = run("this is not javascript", "{}", &Supply::new());
        assert!(matches!(outcome.error, Some(AmmoError::Script(_))));
    }

    #[test]
    fn effects_before_a_throw_are_kept() {
        let outcome = run(
            "reload('next'); supply.step = 1; throw new Error('late failure');",
            "{}",
            &Supply::new(),
        );

        assert!(matches!(outcome.error, Some(AmmoError::Script(ref msg)) if msg.contains("late failure")));
        assert_eq!(outcome.effects.reloads.len(), 1);
        assert_eq!(outcome.effects.reloads[0].targets, json!("next"));
        assert_eq!(outcome.effects.supply_updates["step"], json!(1));
    }

    #[test]
    fn runaway_scripts_are_interrupted() {
        let outcome = run("while (true) {}", "{}", &Supply::new());
        assert!(outcome.error.is_some());
    }
}
