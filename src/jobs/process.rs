//! Runs a command definition as a child process.

use super::JobSink;
use super::definition::CommandDefinition;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};

/// Builds the process for `parameters`, failing on missing required parameters.
pub(super) fn prepare(
    definition: &CommandDefinition,
    parameters: &BTreeMap<String, String>,
) -> Result<Command, String> {
    let exec = definition
        .resolved_exec()
        .ok_or_else(|| format!("Command `{}` has no resolved executable", definition.name))?;
    let mut command = Command::new(exec);
    command
        .args(definition.arguments(parameters)?)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = definition.working_directory() {
        command.current_dir(dir);
    }
    Ok(command)
}

/// Runs the process to completion, streaming its output lines into `sink`.
pub(super) fn run(mut command: Command, sink: &JobSink) {
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            sink.fail(format!(
                "Failed to start {}: {e}",
                command.get_program().to_string_lossy()
            ));
            return;
        }
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    std::thread::scope(|scope| {
        if let Some(stdout) = stdout {
            scope.spawn(|| pump_lines(stdout, sink));
        }
        if let Some(stderr) = stderr {
            scope.spawn(|| pump_lines(stderr, sink));
        }
    });
    match child.wait() {
        // killed by a signal when there is no code
        Ok(status) => sink.complete(Some(status.code().unwrap_or(-1))),
        Err(e) => sink.fail(format!("Failed to wait for process: {e}")),
    }
}

fn pump_lines<R: Read>(stream: R, sink: &JobSink) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {
                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                let mut text = String::from_utf8_lossy(&line).into_owned();
                text.push('\n');
                sink.append(&text);
            }
            Err(e) => {
                logwise::warn_sync!("Output stream read failed: {e}", e = logwise::privacy::LogIt(&e));
                return;
            }
        }
    }
}
