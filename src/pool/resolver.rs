//! Lifecycle of one rendering-engine process.
//!
//! A resolver launches its process lazily, queues acquirers while the launch
//! is in flight, counts the pages the process serves, and retires the process
//! once it has served enough pages or the registry asks it to step aside.
//! Retirement never interrupts open pages: the process is marked end-of-life
//! and disposed when its last page closes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use metrics::counter;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::error::PoolError;
use super::hooks::{LifecycleHooks, LiveProcess};
use super::page::Page;
use super::state::{ProcessState, ResolverState};
use crate::domain::pool_key::PoolKey;
use crate::engine::{EngineLauncher, LaunchProfile};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "pool::resolver";
pub const DEFAULT_END_OF_LIFE_PAGE_COUNT: u32 = 10;

/// Settings shared by every resolver a registry creates.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub profile: LaunchProfile,
    /// Pages a single process may serve before it is retired.
    pub end_of_life_page_count: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            profile: LaunchProfile::default(),
            end_of_life_page_count: DEFAULT_END_OF_LIFE_PAGE_COUNT,
        }
    }
}

type Waiter = oneshot::Sender<Result<LiveProcess, PoolError>>;

enum Phase {
    Uninitialized,
    Initializing { waiters: VecDeque<Waiter> },
    Ready(LiveProcess),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverPhase {
    Uninitialized,
    Initializing,
    Ready,
    EndOfLife,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverSnapshot {
    pub key: PoolKey,
    pub phase: ResolverPhase,
    /// Callers parked behind the launch in flight, not counting the one
    /// that started it.
    pub queued_waiters: usize,
    pub generation: Option<u64>,
    pub state: Option<ResolverState>,
}

pub struct Resolver {
    key: PoolKey,
    launcher: Arc<dyn EngineLauncher>,
    config: ResolverConfig,
    weak_self: Weak<Resolver>,
    generations: AtomicU64,
    phase: Mutex<Phase>,
}

impl Resolver {
    pub fn new(
        key: PoolKey,
        launcher: Arc<dyn EngineLauncher>,
        config: ResolverConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            key,
            launcher,
            config,
            weak_self: weak_self.clone(),
            generations: AtomicU64::new(0),
            phase: Mutex::new(Phase::Uninitialized),
        })
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Open a page on the current process, launching one when needed.
    ///
    /// A process found disconnected is disposed and relaunched once.
    pub async fn new_page(&self) -> Result<Page, PoolError> {
        let mut process = self.acquire_process().await?;
        if !process.handle.is_connected() {
            warn!(
                target = "pool::resolver",
                op = "new_page",
                pool_key = %self.key,
                generation = process.generation,
                "Opening a page on a disconnected engine process; relaunching"
            );
            if let Err(err) = self.dispose_process_inner(&process).await {
                debug!(
                    target = "pool::resolver",
                    pool_key = %self.key,
                    error = %err,
                    "Closing disconnected engine process failed"
                );
            }
            process = self.acquire_process().await?;
        }

        let page = process.handle.new_page().await?;
        counter!("renderpool_pages_created_total").increment(1);

        let created = process.state.record_created();
        if created >= self.config.end_of_life_page_count && process.state.mark_end_of_life() {
            debug!(
                target = "pool::resolver",
                pool_key = %self.key,
                generation = process.generation,
                created_pages = created,
                "Engine process reached its page budget; marked end of life"
            );
        }

        Ok(Page::new(page, self.key.clone(), process.generation))
    }

    /// Dispose the current process unconditionally, then open a page on a
    /// fresh one.
    pub async fn new_clean_page(&self) -> Result<Page, PoolError> {
        self.dispose_process().await?;
        self.new_page().await
    }

    /// Dispose the process if nothing is using it.
    ///
    /// Returns `true` when the resolver holds no process afterwards. A busy
    /// process is marked end-of-life instead and disposed by its last page
    /// close; a launch in flight is never interrupted.
    pub async fn dispose_if_idle(&self) -> Result<bool, PoolError> {
        let process = {
            let phase = mutex_lock(&self.phase, SOURCE, "dispose_if_idle");
            match &*phase {
                Phase::Uninitialized => return Ok(true),
                Phase::Initializing { .. } => {
                    warn!(
                        target = "pool::resolver",
                        op = "dispose_if_idle",
                        pool_key = %self.key,
                        "Initializing engine process cannot be disposed"
                    );
                    return Ok(false);
                }
                Phase::Ready(process) => process.clone(),
            }
        };

        if process.state.active_pages() > 0 {
            process.state.mark_end_of_life();
            info!(
                target = "pool::resolver",
                op = "dispose_if_idle",
                pool_key = %self.key,
                generation = process.generation,
                active_pages = process.state.active_pages(),
                "Marked busy engine process end of life"
            );
            return Ok(false);
        }

        match process.handle.page_urls().await {
            // One blank page exists from launch and is never tracked.
            Ok(urls) if urls.len() > 1 => {
                counter!("renderpool_orphaned_pages_total").increment((urls.len() - 1) as u64);
                warn!(
                    target = "pool::resolver",
                    op = "dispose_if_idle",
                    pool_key = %self.key,
                    generation = process.generation,
                    open_pages = urls.len(),
                    urls = %urls.join(" "),
                    "Found orphaned engine page(s)"
                );
            }
            Ok(_) => {}
            Err(err) => {
                debug!(
                    target = "pool::resolver",
                    op = "dispose_if_idle",
                    pool_key = %self.key,
                    error = %err,
                    "Could not list pages before disposal"
                );
            }
        }

        self.dispose_process_inner(&process).await?;
        info!(
            target = "pool::resolver",
            op = "dispose_if_idle",
            pool_key = %self.key,
            generation = process.generation,
            "Disposed idle engine process"
        );
        Ok(true)
    }

    pub fn snapshot(&self) -> ResolverSnapshot {
        let phase = mutex_lock(&self.phase, SOURCE, "snapshot");
        match &*phase {
            Phase::Uninitialized => ResolverSnapshot {
                key: self.key.clone(),
                phase: ResolverPhase::Uninitialized,
                queued_waiters: 0,
                generation: None,
                state: None,
            },
            Phase::Initializing { waiters } => ResolverSnapshot {
                key: self.key.clone(),
                phase: ResolverPhase::Initializing,
                queued_waiters: waiters.len().saturating_sub(1),
                generation: None,
                state: None,
            },
            Phase::Ready(process) => {
                let state = process.state.snapshot();
                ResolverSnapshot {
                    key: self.key.clone(),
                    phase: if state.end_of_life {
                        ResolverPhase::EndOfLife
                    } else {
                        ResolverPhase::Ready
                    },
                    queued_waiters: 0,
                    generation: Some(process.generation),
                    state: Some(state),
                }
            }
        }
    }

    /// Counters of the current process, if one is live.
    pub fn state(&self) -> Option<ResolverState> {
        self.snapshot().state
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        matches!(
            &*mutex_lock(&self.phase, SOURCE, "is_current"),
            Phase::Ready(process) if process.generation == generation
        )
    }

    fn current(&self) -> Option<LiveProcess> {
        match &*mutex_lock(&self.phase, SOURCE, "current") {
            Phase::Ready(process) => Some(process.clone()),
            _ => None,
        }
    }

    /// Return the current process, joining or starting a launch as needed.
    ///
    /// Acquirers that arrive during a launch are answered in arrival order
    /// with the same outcome.
    pub(crate) async fn acquire_process(&self) -> Result<LiveProcess, PoolError> {
        let receiver = {
            let mut guard = mutex_lock(&self.phase, SOURCE, "acquire_process");
            let phase = &mut *guard;
            match phase {
                Phase::Ready(process) => {
                    debug!(
                        target = "pool::resolver",
                        pool_key = %self.key,
                        generation = process.generation,
                        "Reusing engine process"
                    );
                    return Ok(process.clone());
                }
                Phase::Initializing { waiters } => {
                    debug!(
                        target = "pool::resolver",
                        pool_key = %self.key,
                        queued = waiters.len(),
                        "Queuing for engine process"
                    );
                    let (sender, receiver) = oneshot::channel();
                    waiters.push_back(sender);
                    receiver
                }
                Phase::Uninitialized => {
                    let (sender, receiver) = oneshot::channel();
                    *phase = Phase::Initializing {
                        waiters: VecDeque::from([sender]),
                    };
                    self.spawn_launch();
                    receiver
                }
            }
        };

        receiver.await.map_err(|_| PoolError::LaunchAbandoned)?
    }

    fn spawn_launch(&self) {
        let Some(resolver) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move { resolver.launch().await });
    }

    async fn launch(self: Arc<Self>) {
        let started_at = Instant::now();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            target = "pool::resolver",
            op = "launch",
            pool_key = %self.key,
            generation,
            "Starting new engine process"
        );

        let outcome = match self.launcher.launch(&self.config.profile).await {
            Ok(handle) => {
                let process = LiveProcess {
                    generation,
                    handle,
                    state: Arc::new(ProcessState::default()),
                };
                process.handle.attach(Arc::new(LifecycleHooks::new(
                    self.key.clone(),
                    self.weak_self.clone(),
                    process.clone(),
                )));
                counter!("renderpool_engine_launch_total").increment(1);
                info!(
                    target = "pool::resolver",
                    op = "launch",
                    pool_key = %self.key,
                    generation,
                    result = "ok",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Engine process ready"
                );
                Ok(process)
            }
            Err(err) => {
                counter!("renderpool_engine_launch_failed_total").increment(1);
                warn!(
                    target = "pool::resolver",
                    op = "launch",
                    pool_key = %self.key,
                    generation,
                    result = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "Engine process failed to launch"
                );
                Err(PoolError::Launch(err))
            }
        };

        let waiters = {
            let mut phase = mutex_lock(&self.phase, SOURCE, "launch");
            let next = match &outcome {
                Ok(process) => Phase::Ready(process.clone()),
                Err(_) => Phase::Uninitialized,
            };
            match std::mem::replace(&mut *phase, next) {
                Phase::Initializing { waiters } => waiters,
                _ => VecDeque::new(),
            }
        };

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Dispose `process`, clearing the resolver's reference first so that a
    /// concurrent acquirer can launch a replacement without waiting for the
    /// termination to finish. Idempotent.
    pub(crate) async fn dispose_process_inner(&self, process: &LiveProcess) -> Result<(), PoolError> {
        {
            let mut phase = mutex_lock(&self.phase, SOURCE, "dispose_process");
            if matches!(&*phase, Phase::Ready(current) if current.generation == process.generation)
            {
                *phase = Phase::Uninitialized;
            }
        }
        process.state.mark_end_of_life();
        process.terminate(&self.key).await?;
        Ok(())
    }

    /// Dispose the current process, if any.
    pub async fn dispose_process(&self) -> Result<(), PoolError> {
        match self.current() {
            Some(process) => self.dispose_process_inner(&process).await,
            None => Ok(()),
        }
    }
}
