use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use slipway_core::{
    ExitStatus, LogStream, ResourceUsage, SandboxError, SandboxHandle, SandboxRole,
    SandboxRuntime, SandboxSpec, SandboxState,
};
use tokio::sync::watch;

/// Exit code reported for sandboxes killed by stop/remove
const KILLED: i64 = 137;

/// Behaviour of a [`FakeRuntime`]
#[derive(Debug, Clone)]
pub struct Script {
    /// Exit code of every build
    pub build_exit_code: i64,
    /// Lines the builder prints
    pub build_logs: Vec<String>,
    /// How long a build runs before exiting
    pub build_delay: Duration,
    /// Builds never exit on their own
    pub build_hangs: bool,
    pub build_usage: ResourceUsage,
    /// `create` fails for this role
    pub fail_create: Option<SandboxRole>,
    pub fail_start: bool,
    /// `wait` errors for builders
    pub fail_wait: bool,
    /// `wait` panics for builders
    pub panic_on_wait: bool,
    pub fail_commit: bool,
    pub fail_stop: bool,
    pub fail_remove: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            build_exit_code: 0,
            build_logs: vec!["installing".to_string(), "built".to_string()],
            build_delay: Duration::ZERO,
            build_hangs: false,
            build_usage: ResourceUsage {
                memory_bytes: 64 * 1024 * 1024,
                cpu_time_ms: 1_500,
            },
            fail_create: None,
            fail_start: false,
            fail_wait: false,
            panic_on_wait: false,
            fail_commit: false,
            fail_stop: false,
            fail_remove: false,
        }
    }
}

#[derive(Debug)]
struct FakeSandbox {
    spec: SandboxSpec,
    state: SandboxState,
    exit: watch::Sender<Option<i64>>,
}

/// In-memory sandbox runtime
#[derive(Debug, Default)]
pub struct FakeRuntime {
    script: Mutex<Script>,
    sandboxes: Mutex<HashMap<String, FakeSandbox>>,
    created: Mutex<Vec<SandboxSpec>>,
    operations: Mutex<Vec<String>>,
    next_id: AtomicU64,
    builders_running: AtomicUsize,
    peak_builders: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Script) -> Self {
        let runtime = Self::default();
        *runtime.script.lock() = script;
        runtime
    }

    /// Change behaviour mid-test
    pub fn update_script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock());
    }

    /// Sandboxes created and not yet removed
    pub fn live_count(&self) -> usize {
        self.sandboxes.lock().len()
    }

    /// Live sandboxes of `role`
    pub fn live_count_of(&self, role: SandboxRole) -> usize {
        self.sandboxes
            .lock()
            .values()
            .filter(|s| s.spec.role == role)
            .count()
    }

    /// Every spec passed to `create`, in order
    pub fn created_specs(&self) -> Vec<SandboxSpec> {
        self.created.lock().clone()
    }

    /// Operation log, e.g. `stop:fake-1`
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().clone()
    }

    /// Highest number of builders running at once
    pub fn peak_builders(&self) -> usize {
        self.peak_builders.load(Ordering::SeqCst)
    }

    /// Make a running sandbox exit with `code`
    pub fn crash(&self, handle: &SandboxHandle, code: i64) {
        if let Some(sandbox) = self.sandboxes.lock().get_mut(&handle.id) {
            sandbox.state = SandboxState::Exited { code };
            sandbox.exit.send_replace(Some(code));
        }
    }

    /// Handles of live sandboxes of `role`
    pub fn handles_of(&self, role: SandboxRole) -> Vec<SandboxHandle> {
        self.sandboxes
            .lock()
            .iter()
            .filter(|(_, s)| s.spec.role == role)
            .map(|(id, s)| SandboxHandle {
                id: id.clone(),
                name: s.spec.name.clone(),
                role,
            })
            .collect()
    }

    fn log(&self, op: &str, handle: &SandboxHandle) {
        self.operations.lock().push(format!("{op}:{}", handle.id));
    }

    fn exit_receiver(&self, handle: &SandboxHandle) -> Result<watch::Receiver<Option<i64>>, SandboxError> {
        self.sandboxes
            .lock()
            .get(&handle.id)
            .map(|s| s.exit.subscribe())
            .ok_or_else(|| SandboxError::NotFound(handle.id.clone()))
    }

    async fn wait_exit(mut rx: watch::Receiver<Option<i64>>) -> Option<i64> {
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return Some(code);
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    fn kill(sandbox: &mut FakeSandbox) {
        if sandbox.exit.borrow().is_none() {
            sandbox.exit.send_replace(Some(KILLED));
        }
        sandbox.state = SandboxState::Exited {
            code: (*sandbox.exit.borrow()).unwrap_or(KILLED),
        };
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        if self.script.lock().fail_create == Some(spec.role) {
            return Err(SandboxError::operation("create", "injected failure"));
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (exit, _) = watch::channel(None);
        self.sandboxes.lock().insert(
            id.clone(),
            FakeSandbox {
                spec: spec.clone(),
                state: SandboxState::Created,
                exit,
            },
        );
        self.created.lock().push(spec.clone());

        let handle = SandboxHandle {
            id,
            name: spec.name.clone(),
            role: spec.role,
        };
        self.log("create", &handle);
        Ok(handle)
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.log("start", handle);
        if self.script.lock().fail_start {
            return Err(SandboxError::operation("start", "injected failure"));
        }

        let mut sandboxes = self.sandboxes.lock();
        let sandbox = sandboxes
            .get_mut(&handle.id)
            .ok_or_else(|| SandboxError::NotFound(handle.id.clone()))?;
        sandbox.state = SandboxState::Running;
        drop(sandboxes);

        if handle.role == SandboxRole::Builder {
            let running = self.builders_running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_builders.fetch_max(running, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn logs(&self, handle: &SandboxHandle) -> Result<LogStream, SandboxError> {
        let lines = match handle.role {
            SandboxRole::Builder => self.script.lock().build_logs.clone(),
            SandboxRole::Runner => Vec::new(),
        };
        Ok(stream::iter(lines.into_iter().map(|l| Ok(format!("{l}\n")))).boxed())
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<ExitStatus, SandboxError> {
        let rx = self.exit_receiver(handle)?;
        let script = self.script.lock().clone();

        if handle.role == SandboxRole::Runner {
            return Self::wait_exit(rx)
                .await
                .map(|code| ExitStatus {
                    code,
                    usage: ResourceUsage::default(),
                })
                .ok_or_else(|| SandboxError::NotFound(handle.id.clone()));
        }

        if script.panic_on_wait {
            panic!("runtime crashed while waiting on {}", handle.id);
        }
        if script.fail_wait {
            return Err(SandboxError::operation("wait", "injected failure"));
        }

        let code = if script.build_hangs {
            Self::wait_exit(rx).await
        } else {
            tokio::select! {
                () = tokio::time::sleep(script.build_delay) => Some(script.build_exit_code),
                code = Self::wait_exit(rx) => code,
            }
        };

        let code = code.ok_or_else(|| SandboxError::NotFound(handle.id.clone()))?;
        if let Some(sandbox) = self.sandboxes.lock().get_mut(&handle.id) {
            sandbox.state = SandboxState::Exited { code };
        }
        Ok(ExitStatus {
            code,
            usage: script.build_usage,
        })
    }

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, SandboxError> {
        Ok(self
            .sandboxes
            .lock()
            .get(&handle.id)
            .map_or(SandboxState::Missing, |s| s.state))
    }

    async fn commit(&self, handle: &SandboxHandle, reference: &str) -> Result<String, SandboxError> {
        self.log("commit", handle);
        if self.script.lock().fail_commit {
            return Err(SandboxError::operation("commit", "injected failure"));
        }
        Ok(format!("sha256:{}-{reference}", handle.id))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        _command: &[String],
    ) -> Result<ExitStatus, SandboxError> {
        self.log("exec", handle);
        Ok(ExitStatus {
            code: 0,
            usage: ResourceUsage::default(),
        })
    }

    async fn stop(&self, handle: &SandboxHandle, _grace: Duration) -> Result<(), SandboxError> {
        self.log("stop", handle);
        if self.script.lock().fail_stop {
            return Err(SandboxError::operation("stop", "injected failure"));
        }
        if let Some(sandbox) = self.sandboxes.lock().get_mut(&handle.id) {
            Self::kill(sandbox);
        }
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.log("remove", handle);
        if self.script.lock().fail_remove {
            return Err(SandboxError::operation("remove", "injected failure"));
        }

        let removed = self.sandboxes.lock().remove(&handle.id);
        if let Some(mut sandbox) = removed {
            let was_started = sandbox.state != SandboxState::Created;
            Self::kill(&mut sandbox);
            if sandbox.spec.role == SandboxRole::Builder && was_started {
                self.builders_running.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}
