//! The `loopgate_handler` tool is what the custom URL scheme launches.
//!
//! # Architecture
//!
//! Each click on a `sgrlhiop:` link starts a new handler process. The first one becomes the
//! server; later ones only deliver their request to it:
//!
//! 1.  **Hand-off**: parse the URL and send the request to a server on the configured port
//!     over the binary protocol. If that server acknowledges it, exit.
//! 2.  **Serve**: otherwise bind the port, submit the request locally, and keep serving the
//!     page's status queries until the server has been idle for a while.
//!
//! Two handlers racing for the port is resolved by retrying the hand-off once after a bind
//! failure.

use loopgate::config::{COMMANDS_VAR, HANDSHAKE_MS_VAR, IDLE_SECS_VAR, PORT_VAR};
use loopgate::jobs::definition::{self, CommandDefinition};
use loopgate::{Bridge, JobRegistry, Listener, ServerConfig, Supervisor};
use loopgate_internal::request::CommandRequest;
use loopgate_internal::{url, wire};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// How long a handler that lost the race for the port waits before handing off again.
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    let config = ServerConfig::from_env();
    match args.first().map(String::as_str) {
        None | Some("-h") | Some("--help") => {
            help();
            ExitCode::SUCCESS
        }
        Some("--serve") => serve(&config, None),
        Some(launch_url) => match url::parse(launch_url) {
            Ok(request) => dispatch(&config, request),
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn dispatch(config: &ServerConfig, request: CommandRequest) -> ExitCode {
    match hand_off(config, &request) {
        Some(true) => ExitCode::SUCCESS,
        Some(false) => {
            eprintln!("The running server could not handle the request");
            ExitCode::FAILURE
        }
        None => serve(config, Some(request)),
    }
}

/// `None` if no server answered.
fn hand_off(config: &ServerConfig, request: &CommandRequest) -> Option<bool> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
    match wire::handoff(addr, request, config.handshake_timeout) {
        Ok(handled) => Some(handled),
        Err(e) => {
            logwise::info_sync!("No server to hand off to: {e}", e = logwise::privacy::LogIt(&e));
            None
        }
    }
}

fn serve(config: &ServerConfig, request: Option<CommandRequest>) -> ExitCode {
    let registry = Arc::new(JobRegistry::with_definitions(load_definitions()));
    let listener = Listener::new(config.clone(), Arc::new(Bridge::new(registry.clone())));
    if let Err(e) = listener.start(config.port) {
        eprintln!("{e}");
        let Some(request) = request else {
            return ExitCode::FAILURE;
        };
        // another handler probably won the race for the port
        std::thread::sleep(BIND_RETRY_DELAY);
        return match hand_off(config, &request) {
            Some(true) => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        };
    }
    if let Some(request) = request {
        registry.submit(request);
    }
    Supervisor::new(config).run(&listener, &registry);
    ExitCode::SUCCESS
}

fn load_definitions() -> Vec<CommandDefinition> {
    let Some(path) = std::env::var_os(COMMANDS_VAR).map(PathBuf::from) else {
        return Vec::new();
    };
    match definition::load_file(&path) {
        Ok(definitions) => definitions,
        Err(e) => {
            logwise::error_sync!(
                "Could not load command definitions from {path}: {e}",
                path = logwise::privacy::LogIt(&path),
                e = logwise::privacy::LogIt(&e)
            );
            Vec::new()
        }
    }
}

fn help() {
    eprintln!("Runs pre-registered local commands on behalf of a web page");
    eprintln!();
    eprintln!("Usage: loopgate_handler {}:<callback id>:<command>?<key>=<value>&...", url::SCHEME);
    eprintln!("       loopgate_handler --serve");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  {COMMANDS_VAR}: JSON file with command definitions");
    eprintln!("  {PORT_VAR}: listening port (default {})", wire::DEFAULT_PORT);
    eprintln!("  {IDLE_SECS_VAR}: idle seconds before the server exits");
    eprintln!("  {HANDSHAKE_MS_VAR}: handshake timeout in milliseconds");
}
