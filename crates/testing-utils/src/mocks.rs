//! Mock implementations of the remote session and store traits
//!
//! `MockConnector` plays a scripted remote host: replies are matched by
//! command prefix, uploads land in an in-memory file map, and every call is
//! recorded so tests can assert the exact command sequence.

use async_trait::async_trait;
use runner_domain::entities::{NewTask, Task, TaskStatus, TaskTransition};
use runner_domain::repositories::TaskStateStore;
use runner_errors::{RunnerError, RunnerResult};
use runner_remote::{
    CommandOutput, RemoteConnector, RemoteSession, SessionError, SessionResult, SshCredentials,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the mock host does when it receives a command or an upload
#[derive(Debug, Clone)]
pub enum MockReply {
    Output(CommandOutput),
    /// The transport fails while the call is in flight
    ConnectionLost(String),
    /// Never answers; the caller's timeout decides
    Hang,
    /// Panics inside the session call
    Panic(String),
}

impl MockReply {
    pub fn stdout(stdout: &str) -> Self {
        MockReply::Output(CommandOutput::new(stdout, "", 0))
    }

    pub fn exit(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        MockReply::Output(CommandOutput::new(stdout, stderr, exit_code))
    }
}

#[derive(Debug, Clone)]
pub enum MockConnectBehavior {
    Accept,
    Refuse(String),
    Hang,
}

#[derive(Debug)]
struct MockHostState {
    connect: MockConnectBehavior,
    rules: Vec<(String, MockReply)>,
    upload_reply: Option<MockReply>,
    commands: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    connect_attempts: usize,
    sessions_opened: usize,
    sessions_closed: usize,
    sessions_released: usize,
    last_credentials: Option<SshCredentials>,
}

/// Scripted remote host
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockHostState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockHostState {
                connect: MockConnectBehavior::Accept,
                rules: Vec::new(),
                upload_reply: None,
                commands: Vec::new(),
                files: HashMap::new(),
                connect_attempts: 0,
                sessions_opened: 0,
                sessions_closed: 0,
                sessions_released: 0,
                last_credentials: None,
            })),
        }
    }

    // mock 内部 panic 后锁可能已中毒，照常读取
    fn state(&self) -> MutexGuard<'_, MockHostState> {
        lock(&self.state)
    }

    pub fn refuse_connections(self, reason: &str) -> Self {
        self.state().connect = MockConnectBehavior::Refuse(reason.to_string());
        self
    }

    pub fn hang_on_connect(self) -> Self {
        self.state().connect = MockConnectBehavior::Hang;
        self
    }

    /// Reply to every command starting with `prefix`; first matching rule wins
    pub fn on_command(self, prefix: &str, reply: MockReply) -> Self {
        self.state().rules.push((prefix.to_string(), reply));
        self
    }

    pub fn on_upload(self, reply: MockReply) -> Self {
        self.state().upload_reply = Some(reply);
        self
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.state().files.insert(path.to_string(), content.to_vec());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state().sessions_closed
    }

    /// Sessions that are neither closed nor dropped
    pub fn open_sessions(&self) -> usize {
        let state = self.state();
        state.sessions_opened - state.sessions_released
    }

    pub fn last_credentials(&self) -> Option<SshCredentials> {
        self.state().last_credentials.clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<MockHostState>) -> MutexGuard<'_, MockHostState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(
        &self,
        host: &str,
        credentials: &SshCredentials,
        timeout: Duration,
    ) -> SessionResult<Box<dyn RemoteSession>> {
        let behavior = {
            let mut state = self.state();
            state.connect_attempts += 1;
            state.last_credentials = Some(credentials.clone());
            state.connect.clone()
        };

        match behavior {
            MockConnectBehavior::Accept => {
                self.state().sessions_opened += 1;
                let session: Box<dyn RemoteSession> = Box::new(MockSession {
                    state: Arc::clone(&self.state),
                });
                Ok(session)
            }
            MockConnectBehavior::Refuse(reason) => {
                Err(SessionError::Connect(format!("{host}: {reason}")))
            }
            MockConnectBehavior::Hang => {
                tokio::time::sleep(timeout).await;
                Err(SessionError::timeout(format!("connect {host}"), timeout))
            }
        }
    }
}

pub struct MockSession {
    state: Arc<Mutex<MockHostState>>,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        lock(&self.state).sessions_released += 1;
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn run(&mut self, command: &str, timeout: Duration) -> SessionResult<CommandOutput> {
        let reply = {
            let mut state = lock(&self.state);
            state.commands.push(command.to_string());
            let reply = state
                .rules
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, reply)| reply.clone());
            if reply.is_none() {
                if let Some(path) = command.strip_prefix("rm -rf ") {
                    state.files.remove(path);
                }
            }
            reply
        };

        match reply {
            None => Ok(CommandOutput::default()),
            Some(MockReply::Output(output)) => Ok(output),
            Some(MockReply::ConnectionLost(reason)) => Err(SessionError::Run(reason)),
            Some(MockReply::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(SessionError::timeout(command, timeout))
            }
            Some(MockReply::Panic(message)) => panic!("{message}"),
        }
    }

    async fn upload(
        &mut self,
        content: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> SessionResult<()> {
        let reply = {
            let mut state = lock(&self.state);
            state.commands.push(format!("upload {remote_path}"));
            state.upload_reply.clone()
        };

        match reply {
            None | Some(MockReply::Output(_)) => {
                lock(&self.state)
                    .files
                    .insert(remote_path.to_string(), content.to_vec());
                Ok(())
            }
            Some(MockReply::ConnectionLost(reason)) => Err(SessionError::Transfer(reason)),
            Some(MockReply::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(SessionError::timeout(format!("upload {remote_path}"), timeout))
            }
            Some(MockReply::Panic(message)) => panic!("{message}"),
        }
    }

    async fn download(&mut self, remote_path: &str, _timeout: Duration) -> SessionResult<Vec<u8>> {
        let mut state = lock(&self.state);
        state.commands.push(format!("download {remote_path}"));
        state
            .files
            .get(remote_path)
            .cloned()
            .ok_or_else(|| SessionError::Transfer(format!("{remote_path}: No such file")))
    }

    async fn close(self: Box<Self>) -> SessionResult<()> {
        lock(&self.state).sessions_closed += 1;
        Ok(())
    }
}

/// In-memory TaskStateStore with failure injection
#[derive(Debug, Clone, Default)]
pub struct MockTaskStateStore {
    tasks: Arc<Mutex<HashMap<String, Task>>>,
    history: Arc<Mutex<Vec<(String, TaskStatus)>>>,
    fail_terminal_writes: Arc<AtomicBool>,
    failing_terminal_writes: Arc<AtomicUsize>,
    terminal_write_attempts: Arc<AtomicUsize>,
    reject_success_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    panic_on_start: Arc<AtomicBool>,
}

impl MockTaskStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        {
            let mut map = store.tasks.lock().unwrap();
            for task in tasks {
                map.insert(task.task_id.clone(), task);
            }
        }
        store
    }

    /// Make every transition into success/failure fail with a database error
    pub fn fail_terminal_writes(&self, enabled: bool) {
        self.fail_terminal_writes.store(enabled, Ordering::SeqCst);
    }

    /// Fail only the next `count` terminal writes, then recover
    pub fn fail_next_terminal_writes(&self, count: usize) {
        self.failing_terminal_writes.store(count, Ordering::SeqCst);
    }

    /// Reject transitions into success with a non-retryable serialization error
    pub fn reject_success_writes(&self, enabled: bool) {
        self.reject_success_writes.store(enabled, Ordering::SeqCst);
    }

    /// Make `get` fail with a retryable database error
    pub fn fail_reads(&self, enabled: bool) {
        self.fail_reads.store(enabled, Ordering::SeqCst);
    }

    /// Panic inside the queued -> running transition
    pub fn panic_on_start(&self, enabled: bool) {
        self.panic_on_start.store(enabled, Ordering::SeqCst);
    }

    /// Number of transition calls that targeted success or failure
    pub fn terminal_write_attempts(&self) -> usize {
        self.terminal_write_attempts.load(Ordering::SeqCst)
    }

    /// Statuses written so far, in order, for one task
    pub fn history(&self, task_id: &str) -> Vec<TaskStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskStateStore for MockTaskStateStore {
    async fn create(&self, new_task: NewTask) -> RunnerResult<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&new_task.task_id) {
            return Err(RunnerError::duplicate_task(new_task.task_id));
        }
        let task = Task::new(new_task);
        tasks.insert(task.task_id.clone(), task.clone());
        self.history
            .lock()
            .unwrap()
            .push((task.task_id.clone(), task.status));
        Ok(task)
    }

    async fn get(&self, task_id: &str) -> RunnerResult<Task> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RunnerError::database_error("store unavailable"));
        }
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| RunnerError::task_not_found(task_id))
    }

    async fn transition(&self, task_id: &str, transition: TaskTransition) -> RunnerResult<Task> {
        let target = transition.target_status();
        // Panic before locking so the mutex stays usable
        if target == TaskStatus::Running && self.panic_on_start.load(Ordering::SeqCst) {
            panic!("store panicked while starting {task_id}");
        }
        if target.is_terminal() {
            self.terminal_write_attempts.fetch_add(1, Ordering::SeqCst);
            let scheduled_failure = self
                .failing_terminal_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if scheduled_failure || self.fail_terminal_writes.load(Ordering::SeqCst) {
                return Err(RunnerError::database_error("store unavailable"));
            }
            if target == TaskStatus::Success && self.reject_success_writes.load(Ordering::SeqCst) {
                return Err(RunnerError::Serialization(
                    "result column rejected".to_string(),
                ));
            }
        }

        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| RunnerError::task_not_found(task_id))?;
        task.apply(transition)?;
        self.history
            .lock()
            .unwrap()
            .push((task_id.to_string(), task.status));
        Ok(task.clone())
    }
}
