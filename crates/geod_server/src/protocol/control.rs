//! Line-oriented control sessions.
//!
//! Each line is split into words. Built-in commands are tried first; any
//! other command goes to the module whose control route matches the longest
//! run of leading words.

use super::http::is_timeout;
use super::{dispatch_to_module, Dispatch};
use crate::connection::ConnectionContext;
use crate::error::ServerError;
use crate::server::ServerShared;
use crate::status;
use geod_host::{Protocol, Request, Transport};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use tracing::{debug, info};

const BANNER: &str = "geod control ready, type 'help' for commands";

const HELP: &[&str] = &[
    "help              this list",
    "stat              listener and module status",
    "stat clear        reset listener statistics and diagnostics",
    "debug             host diagnostics",
    "reload            rescan the module directory",
    "stop              shut the daemon down",
    "quit | exit       close this session",
];

/// Whether the session continues after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Continue,
    Close,
}

fn reply(out: &mut dyn Transport, lines: &[String]) -> Result<(), ServerError> {
    for line in lines {
        out.write_all(line.as_bytes())?;
        out.write_all(b"\r\n")?;
    }
    out.flush()?;
    Ok(())
}

fn reply_line(out: &mut dyn Transport, line: &str) -> Result<(), ServerError> {
    reply(out, &[line.to_string()])
}

/// Runs one command line.
///
/// # Arguments
///
/// * `words` - The line split on whitespace; never empty
/// * `out` - Where replies are written
pub fn execute(shared: &ServerShared, words: &[&str], out: &mut dyn Transport) -> Result<Session, ServerError> {
    match words {
        [] => return Ok(Session::Continue),
        ["quit"] | ["exit"] => {
            reply_line(out, "bye")?;
            return Ok(Session::Close);
        }
        ["help"] => {
            let mut lines: Vec<String> = HELP.iter().map(|l| l.to_string()).collect();
            for module in shared.registry.contexts() {
                for path in module.routes().paths(Protocol::Control) {
                    lines.push(format!("{:<17} ({})", path, module.name()));
                }
            }
            reply(out, &lines)?;
            return Ok(Session::Continue);
        }
        ["reload"] => {
            shared.registry.request_reload();
            reply_line(out, "module rescan scheduled")?;
            return Ok(Session::Continue);
        }
        ["stop"] => {
            info!("Shutdown requested from control session");
            shared.shutdown.request();
            reply_line(out, "stopping")?;
            return Ok(Session::Close);
        }
        ["stat"] => {
            reply(out, &status::render_text(&status::collect(shared)))?;
            return Ok(Session::Continue);
        }
        ["stat", "clear"] => {
            for listener in &shared.listeners {
                listener.stats().clear();
            }
            shared.registry.diagnostics().clear();
            reply_line(out, "statistics cleared")?;
            return Ok(Session::Continue);
        }
        ["debug"] => {
            reply(out, &status::render_diagnostics(&status::collect(shared)))?;
            return Ok(Session::Continue);
        }
        _ => {}
    }

    let Some((id, matched)) = shared.registry.resolve_command(words) else {
        reply_line(out, &format!("unknown command '{}', type 'help'", words[0]))?;
        return Ok(Session::Continue);
    };

    let command = words[..matched].join(" ");
    let args = words[matched..].iter().map(|w| w.to_string()).collect();
    let mut request = Request::new(Protocol::Control, command, &mut *out).with_args(args);

    match dispatch_to_module(&shared.registry, id, &mut request) {
        Dispatch::Handled => {}
        Dispatch::Unavailable => request.write_line("module busy, try again later")?,
        Dispatch::NoHandler => request.write_line(&format!(
            "unknown command '{}', type 'help'",
            words[0]
        ))?,
        Dispatch::Failed(e) => request.write_line(&format!("module error: {}", e))?,
    }
    request.stream().flush()?;
    Ok(Session::Continue)
}

pub fn process(shared: &ServerShared, conn: &ConnectionContext, mut stream: TcpStream) -> Result<(), ServerError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    reply_line(&mut stream, BANNER)?;

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if is_timeout(&e) => {
                debug!("Control session {} idle, closing", conn.id());
                let _ = reply_line(&mut stream, "idle timeout");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        debug!("control {}: {}", conn.peer(), words.join(" "));
        if execute(shared, &words, &mut stream)? == Session::Close {
            break;
        }
        if shared.shutdown.is_requested() {
            let _ = reply_line(&mut stream, "server shutting down");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use geod_host::{
        AuxResource, HostInterface, Module, ModuleContext, ModuleError, Registry, StaticLoader,
        SymbolTable,
    };
    use std::io::Cursor;
    use std::sync::Arc;

    struct Echo;

    impl Module for Echo {
        fn register(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError> {
            host.register_routes(module, Protocol::Control, &["map", "map render"]);
            Ok(())
        }

        fn init(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError> {
            host.set_handler(module, Protocol::Control, |_: &ModuleContext, req: &mut Request<'_>| {
                let line = format!("{} [{}]", req.path(), req.args().join(","));
                let _ = req.write_line(&line);
            });
            Ok(())
        }

        fn finish(&self, _module: &ModuleContext) {}
    }

    fn shared() -> ServerShared {
        let loader = StaticLoader::new().with_module("echo", || SymbolTable::from_module(Arc::new(Echo)));
        let registry = Arc::new(Registry::new(
            Default::default(),
            Arc::new(loader),
            AuxResource::disabled(),
        ));
        registry.scan_and_register();
        ServerShared::new(registry, Vec::new(), ServerConfig::default())
    }

    fn run(shared: &ServerShared, line: &str) -> (Session, String) {
        let mut out = Cursor::new(Vec::new());
        let words: Vec<&str> = line.split_whitespace().collect();
        let session = execute(shared, &words, &mut out).unwrap();
        (session, String::from_utf8(out.into_inner()).unwrap())
    }

    #[test]
    fn builtins() {
        let shared = shared();
        assert_eq!(run(&shared, "quit").0, Session::Close);
        let help = run(&shared, "help").1;
        assert!(help.contains("stat clear"));
        assert!(help.contains("map render") && help.contains("(echo)"));
        assert!(run(&shared, "stat").1.starts_with("uptime: "));

        let (session, text) = run(&shared, "reload");
        assert_eq!(session, Session::Continue);
        assert!(text.contains("scheduled"));
        assert!(shared.registry.take_reload_request());
    }

    #[test]
    fn stop_requests_shutdown() {
        let shared = shared();
        assert_eq!(run(&shared, "stop").0, Session::Close);
        assert!(shared.shutdown.is_requested());
    }

    #[test]
    fn unknown_command_is_reported() {
        let shared = shared();
        let (_, text) = run(&shared, "frobnicate now");
        assert_eq!(text, "unknown command 'frobnicate', type 'help'\r\n");
    }

    #[test]
    fn module_command_gets_longest_match_and_args() {
        let shared = shared();
        let (_, text) = run(&shared, "map render 3 4");
        assert_eq!(text, "map render [3,4]\r\n");
        let (_, text) = run(&shared, "map 7");
        assert_eq!(text, "map [7]\r\n");
    }
}
