//! Introspection commands served from the root of every tree

use chrono::SecondsFormat;
use serde_json::{json, Value};

use crate::backend::Mid;
use crate::errors::MethodError;
use crate::rpc::{Args, HandlerNode, RegistryError, RequestContext, Signature};

pub fn server_commands() -> Result<HandlerNode, RegistryError> {
    HandlerNode::root()
        .with_method("ping", Signature::new(), "Ping the server", |_, _| Ok("pong"))?
        .with_method(
            "server_info",
            Signature::new().optional("full", json!(false)),
            "Dictionary of information about the server",
            server_info,
        )?
        .with_method(
            "functions_list",
            Signature::new(),
            "List of the functions served",
            |ctx, _| Ok(ctx.root.function_paths()),
        )?
        .with_method(
            "documentation",
            Signature::new(),
            "Documentation in reStructuredText",
            |ctx, _| Ok(ctx.root.documentation()),
        )?
        .with_method(
            "check_request",
            Signature::new().required("name"),
            "True when the request context reaching the callable is for `name`",
            check_request,
        )?
        .with_method(
            "kill_actor",
            Signature::new().required("aid"),
            "Kill the server instance whose id is `aid`",
            kill_actor,
        )?
        .with_method(
            "shut_down",
            Signature::new(),
            "Stop this server once in-flight requests are answered",
            |ctx, _| {
                ctx.server.control.shut_down();
                Ok(true)
            },
        )
}

fn server_info(ctx: &RequestContext<'_>, args: &Args) -> Result<Value, MethodError> {
    let server = ctx.server;
    let mut info = json!({
        "server": {
            "name": server.name,
            "version": env!("CARGO_PKG_VERSION"),
            "mid": server.mid.as_str(),
            "concurrency": server.mode.as_str(),
            "pid": server.pid,
            "started_at": server.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "uptime_secs": server.uptime_secs(),
        }
    });

    if args.get_bool("full")? {
        info["functions"] = json!(ctx.root.function_paths());
    }
    Ok(info)
}

fn check_request(ctx: &RequestContext<'_>, args: &Args) -> Result<bool, MethodError> {
    let name = args
        .require("name")?
        .as_str()
        .ok_or_else(|| MethodError::invalid_params("name must be a string"))?;
    Ok(ctx.method == name && !ctx.server.mid.as_str().is_empty())
}

/// True when the request was handed to the arbiter. The kill itself happens
/// after the response is sent; unknown ids are ignored there.
fn kill_actor(ctx: &RequestContext<'_>, args: &Args) -> Result<bool, MethodError> {
    let aid = args
        .require("aid")?
        .as_str()
        .filter(|aid| !aid.trim().is_empty())
        .ok_or_else(|| MethodError::invalid_params("aid must be a non-empty string"))?;
    if !ctx.server.control.is_supervised() {
        return Err(MethodError::failed("this server has no arbiter to kill through"));
    }
    Ok(ctx.server.control.kill(Mid::from(aid.to_string())))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::ConcurrencyMode;
    use crate::rpc::{validate, Params, ServerControl, ServerMeta};

    fn meta() -> ServerMeta {
        ServerMeta::new("info-test", Mid::generate(), ConcurrencyMode::Process)
    }

    fn call(method: &str, params: Params) -> Result<Value, MethodError> {
        call_on(&meta(), method, params)
    }

    fn call_on(server: &ServerMeta, method: &str, params: Params) -> Result<Value, MethodError> {
        let root = server_commands().expect("commands");
        let entry = root.resolve(method).expect("registered");
        let args = validate::bind(entry.signature(), &params).expect("bind");
        let id = json!("req-1");
        let ctx = RequestContext {
            method,
            id: &id,
            server,
            root: &root,
        };
        entry.invoke(&ctx, &args)
    }

    #[test]
    fn ping_pongs() {
        assert_eq!(call("ping", Params::default()).expect("ping"), json!("pong"));
    }

    #[test]
    fn server_info_reports_version_and_mode() {
        let info = call("server_info", Params::default()).expect("info");
        assert_eq!(info["server"]["version"], json!(env!("CARGO_PKG_VERSION")));
        assert_eq!(info["server"]["concurrency"], json!("process"));
        assert_eq!(info["server"]["name"], json!("info-test"));
        assert!(info.get("functions").is_none());
    }

    #[test]
    fn full_server_info_lists_functions() {
        let info = call("server_info", Params::positional(vec![json!(true)])).expect("info");
        let functions = info["functions"].as_array().expect("functions");
        assert!(functions.contains(&json!("ping")));
    }

    #[test]
    fn functions_list_is_sorted_and_complete() {
        let functions = call("functions_list", Params::default()).expect("list");
        assert_eq!(
            functions,
            json!([
                "check_request",
                "documentation",
                "functions_list",
                "kill_actor",
                "ping",
                "server_info",
                "shut_down"
            ])
        );
    }

    #[test]
    fn check_request_matches_the_invoked_method() {
        assert_eq!(
            call("check_request", Params::positional(vec![json!("check_request")]))
                .expect("check"),
            json!(true)
        );
        assert_eq!(
            call("check_request", Params::positional(vec![json!("ping")])).expect("check"),
            json!(false)
        );
        assert!(matches!(
            call("check_request", Params::positional(vec![json!(3)])),
            Err(MethodError::InvalidParams(_))
        ));
    }

    #[test]
    fn kill_actor_queues_the_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = meta().with_control(ServerControl::supervised(tx));

        let accepted =
            call_on(&server, "kill_actor", Params::positional(vec![json!("abc123")])).expect("kill");
        assert_eq!(accepted, json!(true));
        assert_eq!(rx.try_recv().expect("queued").as_str(), "abc123");

        assert!(matches!(
            call_on(&server, "kill_actor", Params::positional(vec![json!(7)])),
            Err(MethodError::InvalidParams(_))
        ));
    }

    #[test]
    fn kill_actor_needs_an_arbiter() {
        let err = call("kill_actor", Params::positional(vec![json!("abc123")]))
            .expect_err("unsupervised");
        assert!(matches!(err, MethodError::Failed(_)));
    }

    #[tokio::test]
    async fn shut_down_signals_the_server() {
        let server = meta();
        assert_eq!(
            call_on(&server, "shut_down", Params::default()).expect("shut_down"),
            json!(true)
        );
        tokio::time::timeout(Duration::from_secs(1), server.control.shutdown_requested())
            .await
            .expect("shutdown signalled");
    }
}
