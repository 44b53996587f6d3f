//! Per-key call coalescing.
//!
//! A burst of calls for one key runs the action on the first call
//! (`leading`), on every `cycle`-th call while the burst lasts, and once
//! more after `wait` has passed without calls (`trailing`). The forced
//! `cycle` executions keep a steady flood of calls from postponing the
//! action forever.
//!
//! [`DebounceSession`] holds the state machine and knows nothing about
//! time; [`Debouncer`] owns one session per key and drives them with tokio
//! timers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Quiet period after the latest call before the session ends.
    pub wait: Duration,
    /// Run on the first call of a burst.
    pub leading: bool,
    /// Run once after the quiet period if calls were held back.
    pub trailing: bool,
    /// Force a run every `cycle` calls within a burst; 0 disables it.
    pub cycle: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(300),
            leading: true,
            trailing: true,
            cycle: 10,
        }
    }
}

/// Scheduling state for one key.
#[derive(Debug, Clone)]
pub struct DebounceSession {
    config: DebounceConfig,
    counter: u64,
    called_during_wait: bool,
    active: bool,
    generation: u64,
}

impl DebounceSession {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            counter: 1,
            called_during_wait: false,
            active: false,
            generation: 0,
        }
    }

    /// Register a call. Returns whether the action runs immediately.
    ///
    /// The caller must (re)arm the quiet-period timer afterwards; the
    /// session is active from here until [`on_expiry`](Self::on_expiry).
    pub fn on_call(&mut self) -> bool {
        let cycle = u64::from(self.config.cycle);
        if cycle > 0 {
            self.counter += 1;
        }

        let execute = if !self.active && self.config.leading {
            true
        } else if cycle > 0 && self.counter % cycle == 0 {
            true
        } else {
            self.called_during_wait = true;
            false
        };

        if execute {
            self.counter = 1;
        }
        self.active = true;
        self.generation += 1;
        execute
    }

    /// The quiet period elapsed. Returns whether the trailing run happens.
    pub fn on_expiry(&mut self) -> bool {
        let execute = self.called_during_wait && self.config.trailing && self.counter > 0;
        if execute {
            self.counter = 1;
        }
        self.active = false;
        self.called_during_wait = false;
        execute
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Bumped on every call; a timer armed for an older generation is stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Slot {
    session: DebounceSession,
    timer: Option<JoinHandle<()>>,
}

type Sessions<K> = Arc<Mutex<HashMap<K, Slot>>>;
type Action<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// Coalesces calls per key and runs `action` according to a
/// [`DebounceConfig`].
///
/// Sessions are created on a key's first call and dropped once its quiet
/// period ends. The action runs outside the session lock, on the calling
/// task for immediate runs and on the timer task for trailing ones.
pub struct Debouncer<K> {
    config: DebounceConfig,
    action: Action<K>,
    sessions: Sessions<K>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(config: DebounceConfig, action: impl Fn(&K) + Send + Sync + 'static) -> Self {
        Self {
            config,
            action: Arc::new(action),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> DebounceConfig {
        self.config
    }

    /// Register a call for `key`. Must be called from within a tokio runtime.
    pub fn call(&self, key: K) {
        let execute = {
            let mut sessions = self.sessions.lock();
            let slot = sessions.entry(key.clone()).or_insert_with(|| Slot {
                session: DebounceSession::new(self.config),
                timer: None,
            });
            let execute = slot.session.on_call();
            if let Some(handle) = slot.timer.take() {
                handle.abort();
            }
            slot.timer = Some(tokio::spawn(Self::expire(
                self.sessions.clone(),
                self.action.clone(),
                key.clone(),
                slot.session.generation(),
                self.config.wait,
            )));
            execute
        };
        if execute {
            (self.action)(&key);
        }
    }

    async fn expire(
        sessions: Sessions<K>,
        action: Action<K>,
        key: K,
        generation: u64,
        wait: Duration,
    ) {
        sleep(wait).await;
        let execute = {
            let mut map = sessions.lock();
            let Some(slot) = map.get_mut(&key) else {
                return;
            };
            // A newer call re-armed the timer after this one was aborted
            // too late to stop it.
            if slot.session.generation() != generation {
                return;
            }
            let execute = slot.session.on_expiry();
            map.remove(&key);
            execute
        };
        if execute {
            action(&key);
        }
    }

    /// Number of keys with a live session.
    pub fn pending(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drop every session without running trailing calls. Returns how many
    /// were pending.
    pub fn cancel_all(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let count = sessions.len();
        for (_, slot) in sessions.drain() {
            if let Some(handle) = slot.timer {
                handle.abort();
            }
        }
        count
    }
}
