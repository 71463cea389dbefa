/*!
The job registry: runs submitted commands and answers status queries.

A job is created for every [`CommandRequest`]. Requests naming a known command start
`Pending` and run on their own thread; everything else is recorded as `Error` right away.
Jobs are never removed, so a job stays queryable by its callback id for as long as the
registry lives, whether or not the connection that submitted it is still open.

# Handlers

| Name | Behavior |
|---|---|
| `echo` | Completes immediately, describing the request. |
| `delay` | Emits `steps` progress lines, sleeping `ms` before each one. |
| anything else | Runs the [`CommandDefinition`] registered under that name. |

Command names match case-insensitively.
*/

pub mod definition;
mod process;

use definition::CommandDefinition;
use loopgate_internal::request::CommandRequest;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_DELAY_STEPS: u32 = 3;
const MAX_DELAY_STEPS: u32 = 100;
const DEFAULT_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Completed,
    Error,
    /// Only reported for callback ids that were never submitted.
    Unknown,
}

/// The reply to a status query, as sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackResponse {
    pub status: Status,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
}

impl CallbackResponse {
    pub fn unknown() -> Self {
        CallbackResponse {
            status: Status::Unknown,
            output: "Unknown callback id".to_string(),
            exitcode: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug)]
struct Job {
    command: String,
    callback_id: Option<String>,
    status: Status,
    output: String,
    exit_code: Option<i32>,
}

impl Job {
    fn snapshot(&self) -> CallbackResponse {
        CallbackResponse {
            status: self.status,
            output: self.output.clone(),
            exitcode: self.exit_code,
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    jobs: Vec<Job>,
    /// Callback id to the first job submitted with it.
    by_callback: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
enum Executor {
    Echo,
    Delay,
    Process(Arc<CommandDefinition>),
}

/// How a submitted job starts: already finished, or on a worker thread.
enum Launch {
    Finished(Status, String),
    Worker(Box<dyn FnOnce(&JobSink) + Send>),
}

const BUILTINS: [(&str, Executor); 2] = [("echo", Executor::Echo), ("delay", Executor::Delay)];

/// Write access to one job, held by the thread executing it.
///
/// Only a pending job can change; the first terminal transition wins.
#[derive(Clone)]
pub(crate) struct JobSink {
    table: Arc<Mutex<Table>>,
    index: usize,
}

impl JobSink {
    fn with_job(&self, f: impl FnOnce(&mut Job)) {
        let mut table = lock(&self.table);
        if let Some(job) = table.jobs.get_mut(self.index)
            && job.status == Status::Pending
        {
            f(job);
        }
    }

    pub(crate) fn append(&self, text: &str) {
        self.with_job(|job| job.output.push_str(text));
    }

    pub(crate) fn complete(&self, exit_code: Option<i32>) {
        self.with_job(|job| {
            job.status = Status::Completed;
            job.exit_code = exit_code;
            log_finished(job);
        });
    }

    pub(crate) fn fail(&self, reason: String) {
        self.with_job(|job| {
            job.status = Status::Error;
            job.output.push_str(&reason);
            log_finished(job);
        });
    }
}

fn log_finished(job: &Job) {
    logwise::info_sync!(
        "Command {command} for {callback} finished as {status}",
        command = job.command.as_str(),
        callback = job.callback_id.as_deref().unwrap_or("-"),
        status = logwise::privacy::LogIt(&job.status)
    );
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct JobRegistry {
    table: Arc<Mutex<Table>>,
    executors: HashMap<String, Executor>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// A registry with only the built-in commands.
    pub fn new() -> Self {
        JobRegistry {
            table: Arc::new(Mutex::new(Table::default())),
            executors: BUILTINS
                .into_iter()
                .map(|(name, executor)| (name.to_string(), executor))
                .collect(),
        }
    }

    pub fn with_definitions(definitions: impl IntoIterator<Item = CommandDefinition>) -> Self {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(definition);
        }
        registry
    }

    /// Registers a command definition under its name.
    ///
    /// Built-in names cannot be replaced. A later definition with the same name
    /// replaces an earlier one.
    pub fn register(&mut self, definition: CommandDefinition) {
        let key = definition.name.trim().to_lowercase();
        if BUILTINS.iter().any(|(name, _)| *name == key) {
            logwise::warn_sync!(
                "Ignoring command definition {name}: the name is built in",
                name = definition.name.as_str()
            );
            return;
        }
        self.executors.insert(key, Executor::Process(Arc::new(definition)));
    }

    /// Records a job for `request` and starts it. Never waits for the command to run.
    ///
    /// Returns the job's status right after submission. Only `echo` completes inline.
    /// Jobs that cannot run are recorded directly as `Error`.
    pub fn submit(&self, request: CommandRequest) -> Status {
        logwise::info_sync!(
            "Submitted {command} for {callback} with {count} parameters",
            command = request.command.as_str(),
            callback = request.callback_id.as_deref().unwrap_or("-"),
            count = request.parameters.len()
        );
        match self.launch(&request) {
            Launch::Finished(status, output) => {
                self.insert(&request, status, output);
                status
            }
            Launch::Worker(work) => {
                let sink = self.insert(&request, Status::Pending, String::new());
                spawn(sink, &request.command, work)
            }
        }
    }

    fn launch(&self, request: &CommandRequest) -> Launch {
        let executor = self.executors.get(&request.command.trim().to_lowercase()).cloned();
        let Some(executor) = executor else {
            return Launch::Finished(Status::Error, "Command processor not found.".to_string());
        };
        match executor {
            Executor::Echo => Launch::Finished(Status::Completed, echo(request)),
            Executor::Delay => {
                let (steps, pause) = delay_plan(&request.parameters);
                Launch::Worker(Box::new(move |sink: &JobSink| {
                    for step in 1..=steps {
                        std::thread::sleep(pause);
                        sink.append(&format!("step {step}/{steps}\n"));
                    }
                    sink.complete(Some(0));
                }))
            }
            Executor::Process(definition) => {
                if let Some(reason) = definition.validation_error() {
                    logwise::error_sync!(
                        "Command {command} selected an invalid definition: {reason}",
                        command = request.command.as_str(),
                        reason = reason
                    );
                    return Launch::Finished(Status::Error, format!("Invalid command definition: {reason}"));
                }
                match process::prepare(&definition, &request.parameters) {
                    Ok(command) => Launch::Worker(Box::new(move |sink: &JobSink| process::run(command, sink))),
                    Err(reason) => Launch::Finished(Status::Error, reason),
                }
            }
        }
    }

    /// Adds a job in its initial state. The first job submitted with a callback id keeps it.
    fn insert(&self, request: &CommandRequest, status: Status, output: String) -> JobSink {
        let mut table = lock(&self.table);
        let index = table.jobs.len();
        let job = Job {
            command: request.command.clone(),
            callback_id: request.callback_id.clone(),
            status,
            output,
            exit_code: None,
        };
        if status != Status::Pending {
            log_finished(&job);
        }
        table.jobs.push(job);
        if let Some(callback_id) = &request.callback_id {
            table.by_callback.entry(callback_id.clone()).or_insert(index);
        }
        JobSink {
            table: self.table.clone(),
            index,
        }
    }

    /// A consistent snapshot of the first job submitted with `callback_id`.
    pub fn query(&self, callback_id: &str) -> CallbackResponse {
        let table = lock(&self.table);
        table
            .by_callback
            .get(callback_id)
            .and_then(|&index| table.jobs.get(index))
            .map(Job::snapshot)
            .unwrap_or_else(CallbackResponse::unknown)
    }

    pub fn count_pending(&self) -> usize {
        lock(&self.table)
            .jobs
            .iter()
            .filter(|job| job.status == Status::Pending)
            .count()
    }
}

fn spawn(sink: JobSink, command: &str, work: impl FnOnce(&JobSink) + Send + 'static) -> Status {
    let worker = sink.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("loopgate::job {command}"))
        .spawn(move || work(&worker));
    match spawned {
        Ok(_) => Status::Pending,
        Err(e) => {
            sink.fail(format!("Failed to start worker: {e}"));
            Status::Error
        }
    }
}

fn echo(request: &CommandRequest) -> String {
    let mut out = String::from("Echo Response:\n");
    if let Some(callback_id) = &request.callback_id {
        let _ = writeln!(out, "  to: {callback_id}");
    }
    for (key, value) in &request.parameters {
        let _ = writeln!(out, "  {key} = {value}");
    }
    out
}

fn delay_plan(parameters: &BTreeMap<String, String>) -> (u32, Duration) {
    let steps = parameters
        .get("steps")
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(DEFAULT_DELAY_STEPS)
        .min(MAX_DELAY_STEPS);
    let ms = parameters
        .get("ms")
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_DELAY_MS);
    (steps, Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::definition::ArgumentTemplate;
    use std::time::Instant;

    fn request(command: &str, callback_id: &str) -> CommandRequest {
        CommandRequest::new(command, Some(callback_id.to_string()))
    }

    fn wait_done(registry: &JobRegistry, callback_id: &str) -> CallbackResponse {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let response = registry.query(callback_id);
            if response.status != Status::Pending {
                return response;
            }
            assert!(Instant::now() < deadline, "job {callback_id} never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn echo_describes_the_request() {
        let registry = JobRegistry::new();
        let status = registry.submit(request("ECHO", "abc").with_parameter("x", "1"));
        assert_eq!(status, Status::Completed);
        let response = registry.query("abc");
        assert_eq!(
            response.to_json().unwrap(),
            r#"{"status":"completed","output":"Echo Response:\n  to: abc\n  x = 1\n"}"#
        );
        assert_eq!(registry.query("abc"), response);
        assert_eq!(registry.count_pending(), 0);
    }

    #[test]
    fn unknown_commands_and_tokens() {
        let registry = JobRegistry::new();
        assert_eq!(registry.submit(request("nope", "t1")), Status::Error);
        let response = registry.query("t1");
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.output, "Command processor not found.");

        assert_eq!(
            registry.query("never").to_json().unwrap(),
            r#"{"status":"unknown","output":"Unknown callback id"}"#
        );
    }

    #[test]
    fn fire_and_forget_jobs_still_run() {
        let registry = JobRegistry::new();
        assert_eq!(registry.submit(CommandRequest::new("echo", None)), Status::Completed);
        assert_eq!(registry.query("").status, Status::Unknown);
    }

    #[test]
    fn delay_reports_progress_then_completes() {
        let registry = JobRegistry::new();
        let status = registry.submit(
            request("delay", "d")
                .with_parameter("steps", "2")
                .with_parameter("ms", "20"),
        );
        assert_eq!(status, Status::Pending);
        assert_eq!(registry.count_pending(), 1);
        let response = wait_done(&registry, "d");
        assert_eq!(response.status, Status::Completed);
        assert_eq!(response.output, "step 1/2\nstep 2/2\n");
        assert_eq!(response.exitcode, Some(0));
        assert_eq!(registry.count_pending(), 0);
    }

    #[test]
    fn first_submission_keeps_a_reused_token() {
        let registry = JobRegistry::new();
        registry.submit(request("echo", "same"));
        registry.submit(request("nope", "same"));
        assert_eq!(registry.query("same").status, Status::Completed);
        assert_eq!(registry.submit(request("nope", "other")), Status::Error);
        registry.submit(request("echo", "other"));
        assert_eq!(registry.query("other").output, "Command processor not found.");
    }

    #[test]
    fn finished_jobs_are_never_seen_pending() {
        let registry = Arc::new(JobRegistry::new());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let watcher = {
            let registry = registry.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    assert_eq!(registry.count_pending(), 0);
                    for i in 0..10 {
                        assert_ne!(registry.query(&format!("n{i}")).status, Status::Pending);
                        assert_ne!(registry.query(&format!("e{i}")).status, Status::Pending);
                    }
                }
            })
        };
        for i in 0..500 {
            registry.submit(request("nope", &format!("n{}", i % 10)));
            registry.submit(request("echo", &format!("e{}", i % 10)));
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        watcher.join().unwrap();
    }

    #[test]
    fn invalid_definitions_refuse_to_run() {
        let mut definition = CommandDefinition::new("broken", "definitely-not-an-executable-7f3a", Vec::new());
        definition.validate(&std::env::temp_dir());
        let registry = JobRegistry::with_definitions([definition]);
        assert_eq!(registry.submit(request("Broken", "b")), Status::Error);
        assert!(registry.query("b").output.starts_with("Invalid command definition: "));

        let unvalidated = CommandDefinition::new("raw", "/bin/sh", Vec::new());
        let registry = JobRegistry::with_definitions([unvalidated]);
        assert_eq!(registry.submit(request("raw", "r")), Status::Error);
    }

    #[test]
    fn builtin_names_cannot_be_replaced() {
        let registry = JobRegistry::with_definitions([CommandDefinition::new("Echo", "/bin/false", Vec::new())]);
        assert_eq!(registry.submit(request("echo", "e")), Status::Completed);
    }

    #[cfg(unix)]
    fn shell(name: &str, script_param: bool) -> CommandDefinition {
        let script = if script_param {
            ArgumentTemplate::parameter("script", true)
        } else {
            ArgumentTemplate::literal("echo out; echo err >&2; exit 3")
        };
        let mut definition = CommandDefinition::new(name, "/bin/sh", vec![ArgumentTemplate::literal("-c"), script]);
        assert!(definition.validate(&std::env::temp_dir()));
        definition
    }

    #[cfg(unix)]
    #[test]
    fn process_output_and_exit_code_are_recorded() {
        let registry = JobRegistry::with_definitions([shell("fails", false)]);
        assert_eq!(registry.submit(request("fails", "p")), Status::Pending);
        let response = wait_done(&registry, "p");
        // a failing program still completes; the exit code tells the caller
        assert_eq!(response.status, Status::Completed);
        assert_eq!(response.exitcode, Some(3));
        let mut lines: Vec<&str> = response.output.lines().collect();
        lines.sort();
        assert_eq!(lines, ["err", "out"]);
        assert!(response.to_json().unwrap().ends_with(r#""exitcode":3}"#));
    }

    #[cfg(unix)]
    #[test]
    fn missing_required_parameter_fails_at_submission() {
        let registry = JobRegistry::with_definitions([shell("run", true)]);
        assert_eq!(registry.submit(request("run", "m")), Status::Error);
        assert_eq!(registry.query("m").output, "Required argument script not provided");

        assert_eq!(
            registry.submit(request("run", "ok").with_parameter("SCRIPT", "printf 'a\\r\\nb'")),
            Status::Pending
        );
        let response = wait_done(&registry, "ok");
        assert_eq!(response.output, "a\nb\n");
        assert_eq!(response.exitcode, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failure_is_an_error() {
        let dir = std::env::temp_dir().join(format!("loopgate-spawn-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let exec = dir.join("not-executable");
        std::fs::write(&exec, "plain text").unwrap();
        let mut definition = CommandDefinition::new("plain", &exec, Vec::new());
        assert!(definition.validate(&dir));
        let registry = JobRegistry::with_definitions([definition]);
        registry.submit(request("plain", "s"));
        let response = wait_done(&registry, "s");
        assert_eq!(response.status, Status::Error);
        assert!(response.output.starts_with("Failed to start"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
