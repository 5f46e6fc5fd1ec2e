//! V8-backed evaluation environment for user-supplied scraper source.
//!
//! Each evaluation gets a fresh isolate whose only bridge back into the
//! process is the `__host` function. `__host` dispatches to the per-task
//! scraper context, so scripts can issue HTTP requests, read params and
//! log — and nothing else: no filesystem, no module loader, no storage
//! handles. The script must define `handler(ctx, kwargs)`; its return
//! value (string, or anything JSON-serializable) becomes the task result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};

use errors::{Error, Result, SandboxError};
use serde_json::Value;

use common::model::{HttpMethod, Request, RequestBody};
use context::ScraperContext;

static INIT: Once = Once::new();
static PLATFORM: OnceLock<v8::SharedRef<v8::Platform>> = OnceLock::new();
static NEXT_EVAL_ID: AtomicU64 = AtomicU64::new(1);
static HOST_REG: OnceLock<Mutex<HashMap<u64, Arc<HostEnv>>>> = OnceLock::new();

/// Everything a running script may reach through `__host`.
pub struct HostEnv {
    pub ctx: Arc<ScraperContext>,
    pub kwargs: Value,
    pub handle: tokio::runtime::Handle,
}

#[derive(Clone, Copy)]
struct EvalSlot(u64);

/// Bridge glue evaluated before the user source. Everything the script can
/// touch funnels through `__host(name, argsJson)`.
const PRELUDE: &str = r#"
const ctx = {
    params: JSON.parse(__host("params", "[]")),
    get: (url) => JSON.parse(__host("get", JSON.stringify([url]))),
    head: (url) => JSON.parse(__host("head", JSON.stringify([url]))),
    delete: (url) => JSON.parse(__host("delete", JSON.stringify([url]))),
    options: (url) => JSON.parse(__host("options", JSON.stringify([url]))),
    post: (url, body) => JSON.parse(__host("post", JSON.stringify([url, body ?? null]))),
    put: (url, body) => JSON.parse(__host("put", JSON.stringify([url, body ?? null]))),
    patch: (url, body) => JSON.parse(__host("patch", JSON.stringify([url, body ?? null]))),
    log: (level, message) => { __host("log", JSON.stringify([level, String(message)])); },
};
const kwargs = JSON.parse(__host("kwargs", "[]"));
"#;

fn init_v8() {
    INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        let _ = PLATFORM.set(platform);
    });
}

fn host_registry() -> &'static Mutex<HashMap<u64, Arc<HostEnv>>> {
    HOST_REG.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Evaluates user source and invokes its `handler(ctx, kwargs)`.
///
/// Blocking; run it on a blocking thread. The tokio handle inside `env` is
/// used to drive the context's async HTTP calls from host functions.
pub fn evaluate(source: &str, env: HostEnv) -> Result<String> {
    init_v8();
    let eval_id = NEXT_EVAL_ID.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut registry) = host_registry().lock() {
        registry.insert(eval_id, Arc::new(env));
    }
    let result = run_isolate(source, eval_id);
    if let Ok(mut registry) = host_registry().lock() {
        registry.remove(&eval_id);
    }
    result
}

fn run_isolate(source: &str, eval_id: u64) -> Result<String> {
    let isolate = &mut v8::Isolate::new(Default::default());
    isolate.set_slot(EvalSlot(eval_id));
    let scope = &mut v8::HandleScope::new(isolate);
    let context = v8::Context::new(scope, v8::ContextOptions::default());
    let scope = &mut v8::ContextScope::new(scope, context);
    let global = context.global(scope);

    let host_fn = v8::Function::new(scope, host_call)
        .ok_or_else(|| Error::from(SandboxError::Compile("failed to bind host".into())))?;
    let host_key = new_string(scope, "__host")?;
    global.set(scope, host_key.into(), host_fn.into());

    run_script(scope, PRELUDE)?;
    run_script(scope, source)?;

    let handler_key = new_string(scope, "handler")?;
    let handler = global
        .get(scope, handler_key.into())
        .filter(|value| value.is_function())
        .ok_or_else(|| Error::from(SandboxError::MissingHandler))?;
    let handler = v8::Local::<v8::Function>::try_from(handler)
        .map_err(|_| Error::from(SandboxError::MissingHandler))?;

    let ctx_key = new_string(scope, "ctx")?;
    let kwargs_key = new_string(scope, "kwargs")?;
    let ctx_value = global
        .get(scope, ctx_key.into())
        .unwrap_or_else(|| v8::undefined(scope).into());
    let kwargs_value = global
        .get(scope, kwargs_key.into())
        .unwrap_or_else(|| v8::undefined(scope).into());

    let tc = &mut v8::TryCatch::new(scope);
    let receiver = v8::undefined(tc).into();
    match handler.call(tc, receiver, &[ctx_value, kwargs_value]) {
        Some(value) => stringify_result(tc, value),
        None => Err(SandboxError::Exception(exception_message(tc)).into()),
    }
}

fn new_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, value)
        .ok_or_else(|| Error::from(SandboxError::Compile("string allocation failed".into())))
}

fn run_script(scope: &mut v8::ContextScope<'_, v8::HandleScope<'_>>, source: &str) -> Result<()> {
    let tc = &mut v8::TryCatch::new(scope);
    let code = new_string(tc, source)?;
    let script = v8::Script::compile(tc, code, None)
        .ok_or_else(|| Error::from(SandboxError::Compile(exception_message(tc))))?;
    if script.run(tc).is_none() {
        return Err(SandboxError::Exception(exception_message(tc)).into());
    }
    Ok(())
}

fn exception_message(tc: &mut v8::TryCatch<v8::HandleScope>) -> String {
    let exception = match tc.exception() {
        Some(exception) => exception,
        None => return "unknown error".to_string(),
    };
    let message = exception.to_rust_string_lossy(tc);
    match tc.stack_trace() {
        Some(stack) => format!("{}\n{}", message, stack.to_rust_string_lossy(tc)),
        None => message,
    }
}

fn stringify_result(
    scope: &mut v8::TryCatch<v8::HandleScope>,
    value: v8::Local<v8::Value>,
) -> Result<String> {
    if value.is_null_or_undefined() {
        return Ok("no result was returned".to_string());
    }
    if value.is_string() {
        return Ok(value.to_rust_string_lossy(scope));
    }
    match v8::json::stringify(scope, value) {
        Some(json) => Ok(json.to_rust_string_lossy(scope)),
        None => Err(SandboxError::Exception("result is not serializable".into()).into()),
    }
}

/// The single host trampoline: `__host(name, argsJson) -> resultJson`.
fn host_call(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let eval_id = match scope.get_slot::<EvalSlot>() {
        Some(slot) => slot.0,
        None => return throw(scope, "host environment is gone"),
    };
    let env = match host_registry().lock() {
        Ok(registry) => registry.get(&eval_id).cloned(),
        Err(_) => None,
    };
    let env = match env {
        Some(env) => env,
        None => return throw(scope, "host environment is gone"),
    };

    let name = args.get(0).to_rust_string_lossy(scope);
    let payload = args.get(1).to_rust_string_lossy(scope);
    match dispatch_host(&env, &name, &payload) {
        Ok(result) => {
            if let Some(result) = v8::String::new(scope, &result) {
                rv.set(result.into());
            }
        }
        Err(message) => throw(scope, &message),
    }
}

fn throw(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
    }
}

fn dispatch_host(env: &HostEnv, name: &str, payload: &str) -> std::result::Result<String, String> {
    let args: Vec<Value> = serde_json::from_str(payload).unwrap_or_default();
    match name {
        "params" => serde_json::to_string(env.ctx.params()).map_err(|e| e.to_string()),
        "kwargs" => serde_json::to_string(&env.kwargs).map_err(|e| e.to_string()),
        "log" => {
            let level = args.first().and_then(Value::as_str).unwrap_or("info");
            let message = args.get(1).and_then(Value::as_str).unwrap_or_default();
            match env.ctx.logger() {
                Some(logger) => {
                    let logger = logger.clone();
                    let level = level.to_string();
                    let message = message.to_string();
                    env.handle.block_on(async move {
                        logger.log(&level, &message).await;
                    });
                }
                None => log::info!("[sandbox] {message}"),
            }
            Ok("null".to_string())
        }
        "get" | "head" | "delete" | "options" | "post" | "put" | "patch" => {
            let url = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{name} requires a url"))?;
            let method = match name {
                "get" => HttpMethod::Get,
                "head" => HttpMethod::Head,
                "delete" => HttpMethod::Delete,
                "options" => HttpMethod::Options,
                "post" => HttpMethod::Post,
                "put" => HttpMethod::Put,
                _ => HttpMethod::Patch,
            };
            let mut request = Request::new(method, url);
            if let Some(body) = args.get(1) {
                if !body.is_null() {
                    request.body = Some(RequestBody::Json(body.clone()));
                }
            }
            let ctx = env.ctx.clone();
            env.handle.block_on(async move {
                let mut response = ctx.request(request).await.map_err(|e| e.to_string())?;
                let body = response.text().await.map_err(|e| e.to_string())?;
                serde_json::to_string(&serde_json::json!({
                    "status": response.status(),
                    "url": response.url(),
                    "headers": response.headers(),
                    "body": body,
                }))
                .map_err(|e| e.to_string())
            })
        }
        other => Err(format!("unknown host function '{other}'")),
    }
}
