//! Recording executor for tests.
//!
//! Tracks every command the components issue so tests can assert on the
//! sequence of OS mutations, not just on return values. Responses are
//! scripted per command prefix; the last scripted response for a prefix
//! repeats, which keeps polling loops (handshake waits) easy to drive.
//!
//! All state lives behind `Arc<Mutex<_>>` so cloned handles share it.

#![cfg(test)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{ChildProcess, Error, Exec};

type ScriptedResponse = Result<String, (i32, String)>;

#[derive(Default)]
pub struct ExecState {
    /// Every `run` invocation, rendered as "tool arg1 arg2 ...".
    pub commands: Vec<String>,
    /// Environment passed alongside each `run` invocation (same index).
    pub envs: Vec<Vec<(String, String)>>,
    /// Scripted responses matched by command-string prefix.
    responses: Vec<(String, VecDeque<ScriptedResponse>)>,
    /// Scripts for upcoming `spawn` calls, consumed in order.
    spawn_scripts: VecDeque<SpawnScript>,
    /// Spawned children: rendered command plus a handle to force an exit.
    pub spawned: Vec<String>,
    pub spawn_exits: Vec<crossbeam_channel::Sender<i32>>,
    pub kill_count: usize,
}

pub struct SpawnScript {
    pub stdout_lines: Vec<String>,
    pub exit_on_spawn: Option<i32>,
}

impl Default for SpawnScript {
    fn default() -> Self {
        SpawnScript {
            stdout_lines: vec!["UAPI listener started".to_string()],
            exit_on_spawn: None,
        }
    }
}

#[derive(Clone)]
pub struct RecordingExec {
    pub state: Arc<Mutex<ExecState>>,
}

fn render(binary: &Path, args: &[&str]) -> String {
    let tool = binary
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| binary.display().to_string());
    if args.is_empty() {
        tool
    } else {
        format!("{} {}", tool, args.join(" "))
    }
}

impl RecordingExec {
    pub fn new() -> Self {
        RecordingExec {
            state: Arc::new(Mutex::new(ExecState::default())),
        }
    }

    /// Script a successful response for commands starting with `prefix`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.script(prefix, Ok(stdout.to_string()));
    }

    /// Script a failure for commands starting with `prefix`.
    pub fn respond_err(&self, prefix: &str, code: i32, stderr: &str) {
        self.script(prefix, Err((code, stderr.to_string())));
    }

    fn script(&self, prefix: &str, response: ScriptedResponse) {
        let mut s = self.state.lock().unwrap();
        if let Some((_, queue)) = s.responses.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(response);
        } else {
            s.responses.push((prefix.to_string(), VecDeque::from([response])));
        }
    }

    pub fn push_spawn(&self, script: SpawnScript) {
        self.state.lock().unwrap().spawn_scripts.push_back(script);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }
}

impl Exec for RecordingExec {
    fn run_with_env(&self, binary: &Path, args: &[&str], envs: &[(String, String)]) -> Result<String, Error> {
        let rendered = render(binary, args);
        let mut s = self.state.lock().unwrap();
        s.commands.push(rendered.clone());
        s.envs.push(envs.to_vec());

        let response = s
            .responses
            .iter_mut()
            .find(|(prefix, queue)| rendered.starts_with(prefix.as_str()) && !queue.is_empty())
            .map(|(_, queue)| {
                if queue.len() == 1 {
                    queue.front().cloned().unwrap_or(Ok(String::new()))
                } else {
                    queue.pop_front().unwrap_or(Ok(String::new()))
                }
            });

        match response {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err((code, stderr))) => Err(Error::Command(code, stderr)),
            None => Ok(String::new()),
        }
    }

    fn spawn(&self, binary: &Path, args: &[&str]) -> Result<Box<dyn ChildProcess>, Error> {
        let mut s = self.state.lock().unwrap();
        s.spawned.push(render(binary, args));
        let script = s.spawn_scripts.pop_front().unwrap_or_default();

        let (stdout_tx, stdout_rx) = crossbeam_channel::unbounded();
        for line in &script.stdout_lines {
            let _ = stdout_tx.send(line.clone());
        }
        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);
        if let Some(code) = script.exit_on_spawn {
            let _ = exit_tx.send(code);
        }
        s.spawn_exits.push(exit_tx.clone());

        Ok(Box::new(MockChild {
            stdout_rx,
            exit_rx,
            exit_tx,
            state: self.state.clone(),
        }))
    }
}

pub struct MockChild {
    stdout_rx: crossbeam_channel::Receiver<String>,
    exit_rx: crossbeam_channel::Receiver<i32>,
    exit_tx: crossbeam_channel::Sender<i32>,
    state: Arc<Mutex<ExecState>>,
}

impl ChildProcess for MockChild {
    fn output_lines(&self) -> crossbeam_channel::Receiver<String> {
        self.stdout_rx.clone()
    }

    fn exited(&self) -> crossbeam_channel::Receiver<i32> {
        self.exit_rx.clone()
    }

    fn kill(&mut self) {
        self.state.lock().unwrap().kill_count += 1;
        let _ = self.exit_tx.try_send(0);
    }
}
