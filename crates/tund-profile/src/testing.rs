//! Test doubles.
//!
//! [`ScriptedLauncher`] starts fake tunnel processes that replay a
//! [`Script`]: emit status lines, optionally apply host changes to a
//! [`FakePlatform`], then hold or exit. Every spawn, termination
//! request, kill and exit is written to a shared [`Journal`].

use crate::profile::{Profile, ProfileId};
use crate::supervisor::{LaunchedProcess, Launcher, SpawnError, TunnelProcess};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tund_net::testing::{FakePlatform, Journal};
use tund_net::{NetworkOverride, Route};

/// What a fake process does after emitting its lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Keep running until terminated
    Hold,
    /// Exit with a code
    Exit(i32),
}

/// Behavior of one fake process.
#[derive(Debug, Clone)]
pub struct Script {
    pub lines: Vec<String>,
    pub finish: Finish,
    /// Host changes applied before the lines are emitted
    pub applies: Option<NetworkOverride>,
    pub ignore_term: bool,
    pub line_delay: Duration,
}

impl Script {
    pub fn new(lines: Vec<&str>) -> Self {
        Self {
            lines: lines.into_iter().map(str::to_string).collect(),
            finish: Finish::Hold,
            applies: None,
            ignore_term: false,
            line_delay: Duration::ZERO,
        }
    }

    /// Brings up `iface` with a route and a DNS server, then holds.
    pub fn connects(iface: &str) -> Self {
        let subnet = iface
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .parse::<u8>()
            .unwrap_or(0);
        let octet = 100u16 + u16::from(subnet);
        let net = format!("10.{}.0.0/24", octet.min(255));
        let gw = format!("10.{}.0.1", octet.min(255));

        let mut applies = NetworkOverride::new();
        applies.set_interface(iface);
        applies.add_route(Route::parse_cidr(&net, gw.parse().ok()).unwrap());
        applies.add_dns_server(gw.parse().unwrap());

        let mut script = Self::new(vec![]);
        script.lines = vec![
            format!("TUN/TAP device {} opened", iface),
            format!("net_route_v4_add: {} via {} dev {}", net, gw, iface),
            format!("PUSH_REPLY,dhcp-option DNS {},ping 10", gw),
            "Initialization Sequence Completed".to_string(),
        ];
        script.applies = Some(applies);
        script
    }

    /// Fails to reach the server and exits 1.
    pub fn fails_network() -> Self {
        Self::new(vec!["TCP: connect to [AF_INET]192.0.2.1:443 failed: Connection refused"]).exits(1)
    }

    /// Credentials rejected, exits 1.
    pub fn fails_auth() -> Self {
        Self::new(vec!["AUTH: Received control message: AUTH_FAILED"]).exits(1)
    }

    pub fn exits(mut self, code: i32) -> Self {
        self.finish = Finish::Exit(code);
        self
    }

    pub fn holding(mut self) -> Self {
        self.finish = Finish::Hold;
        self
    }

    pub fn ignoring_term(mut self) -> Self {
        self.ignore_term = true;
        self
    }

    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }
}

#[derive(Default)]
struct LauncherState {
    scripts: HashMap<ProfileId, VecDeque<Script>>,
    spawns: HashMap<ProfileId, usize>,
    live: HashMap<ProfileId, usize>,
    max_live: HashMap<ProfileId, usize>,
    config_errors: HashSet<ProfileId>,
    exits: HashMap<ProfileId, Vec<Arc<ExitSignal>>>,
    next_pid: u32,
}

/// [`Launcher`] producing scripted fake processes.
#[derive(Clone)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<LauncherState>>,
    default_script: Script,
    journal: Journal,
    host: Option<FakePlatform>,
}

impl ScriptedLauncher {
    pub fn new(journal: Journal, default_script: Script) -> Self {
        Self {
            state: Arc::new(Mutex::new(LauncherState {
                next_pid: 1000,
                ..LauncherState::default()
            })),
            default_script,
            journal,
            host: None,
        }
    }

    /// Apply script host changes to `host`.
    pub fn with_host(mut self, host: FakePlatform) -> Self {
        self.host = Some(host);
        self
    }

    /// Queue a script for the next spawn of `id`.
    pub fn push(&self, id: &ProfileId, script: Script) {
        lock(&self.state)
            .scripts
            .entry(id.clone())
            .or_default()
            .push_back(script);
    }

    /// Make every launch of `id` fail with a configuration error.
    pub fn fail_config(&self, id: &ProfileId) {
        lock(&self.state).config_errors.insert(id.clone());
    }

    pub fn spawns(&self, id: &ProfileId) -> usize {
        lock(&self.state).spawns.get(id).copied().unwrap_or(0)
    }

    /// Processes of `id` that have not exited.
    pub fn live(&self, id: &ProfileId) -> usize {
        lock(&self.state).live.get(id).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously live processes seen for `id`.
    pub fn max_live(&self, id: &ProfileId) -> usize {
        lock(&self.state).max_live.get(id).copied().unwrap_or(0)
    }

    /// Make every live process of `id` exit unexpectedly.
    pub fn crash(&self, id: &ProfileId, code: i32) {
        let signals = lock(&self.state).exits.get(id).cloned().unwrap_or_default();
        for signal in signals {
            signal.exit(code);
        }
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, profile: &Profile) -> Result<LaunchedProcess, SpawnError> {
        let id = profile.id.clone();
        self.journal.record(format!("spawn:{}", id));

        let (script, pid, exit) = {
            let mut state = lock(&self.state);
            *state.spawns.entry(id.clone()).or_insert(0) += 1;
            if state.config_errors.contains(&id) {
                return Err(SpawnError::Config(format!("profile {} is broken", id)));
            }
            let script = state
                .scripts
                .get_mut(&id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| self.default_script.clone());

            let live = state.live.entry(id.clone()).or_insert(0);
            *live += 1;
            let live = *live;
            let max = state.max_live.entry(id.clone()).or_insert(0);
            *max = (*max).max(live);

            state.next_pid += 1;
            let pid = state.next_pid;

            let (tx, _) = watch::channel(None);
            let exit = Arc::new(ExitSignal {
                id: id.clone(),
                tx,
                state: self.state.clone(),
                journal: self.journal.clone(),
            });
            state.exits.entry(id.clone()).or_default().push(exit.clone());
            (script, pid, exit)
        };

        if let (Some(host), Some(applies)) = (&self.host, &script.applies) {
            host.apply(applies);
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(feed(script.clone(), tx, exit.clone()));

        Ok(LaunchedProcess {
            process: Box::new(FakeProcess {
                pid,
                exit_rx: exit.tx.subscribe(),
                exit,
                ignore_term: script.ignore_term,
                journal: self.journal.clone(),
            }),
            output: rx,
        })
    }
}

/// Emit the script's lines, then finish. Output closes on exit.
async fn feed(script: Script, tx: mpsc::Sender<String>, exit: Arc<ExitSignal>) {
    for line in script.lines {
        if !script.line_delay.is_zero() {
            tokio::time::sleep(script.line_delay).await;
        }
        if tx.send(line).await.is_err() {
            return;
        }
    }
    if let Finish::Exit(code) = script.finish {
        exit.exit(code);
    }
    let mut exited = exit.tx.subscribe();
    let _ = exited.wait_for(Option::is_some).await;
}

/// Exit state of one fake process.
struct ExitSignal {
    id: ProfileId,
    tx: watch::Sender<Option<i32>>,
    state: Arc<Mutex<LauncherState>>,
    journal: Journal,
}

impl ExitSignal {
    /// First call wins.
    fn exit(self: &Arc<Self>, code: i32) {
        let changed = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        self.journal.record(format!("process:exit:{}", self.id));
        let mut state = lock(&self.state);
        if let Some(live) = state.live.get_mut(&self.id) {
            *live = live.saturating_sub(1);
        }
        if let Some(list) = state.exits.get_mut(&self.id) {
            list.retain(|s| !Arc::ptr_eq(s, self));
        }
    }
}

struct FakeProcess {
    pid: u32,
    exit: Arc<ExitSignal>,
    exit_rx: watch::Receiver<Option<i32>>,
    ignore_term: bool,
    journal: Journal,
}

#[async_trait]
impl TunnelProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.journal.record(format!("process:term:{}", self.exit.id));
        if !self.ignore_term {
            self.exit.exit(0);
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.journal.record(format!("process:kill:{}", self.exit.id));
        self.exit.exit(137);
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let code = self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(*code)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
