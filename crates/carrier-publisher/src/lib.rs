//! Publisher (spec §2 `pub`, §4.6).
//!
//! Keeps the Cartesian product of a set of names and a set of
//! `(server, serves_mount_table)` pairs mounted in the namespace. A single
//! runloop task owns all the mutable state and consumes commands off a
//! channel (spec §4.6 "one goroutine-equivalent runloop consumes a command
//! channel; all state mutations occur there") — `Publisher`'s public
//! methods only ever send a command and await its reply.

use carrier_ns::NamespaceResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Mount {
    name: String,
    server: String,
}

#[derive(Debug, Clone)]
struct MountState {
    serves_mount_table: bool,
    /// `None` once the mount is believed live in the namespace; `Some`
    /// while backing off after a failed Mount/Unmount attempt.
    backoff: Option<Backoff>,
    pending_unmount: bool,
}

#[derive(Debug, Clone)]
struct Backoff {
    next_attempt_in: Duration,
}

impl Backoff {
    fn initial(base: Duration) -> Self {
        Backoff {
            next_attempt_in: base,
        }
    }

    fn advance(&mut self, max: Duration) {
        self.next_attempt_in = (self.next_attempt_in * 2).min(max);
    }
}

enum Command {
    Add {
        name: String,
        server: String,
        serves_mount_table: bool,
        reply: oneshot::Sender<()>,
    },
    Remove {
        name: String,
        server: String,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Tunables for the refresh loop (spec §0 ambient `RuntimeConfig`
/// publisher-facing knobs).
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub refresh_interval: Duration,
    pub ttl_slack: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            refresh_interval: Duration::from_secs(60),
            ttl_slack: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Background keep-alive that refreshes a set of mounts (spec §2 `pub`,
/// §4.6, GLOSSARY "Publisher").
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Command>,
}

impl Publisher {
    pub fn spawn(ns: Arc<NamespaceResolver>, config: PublisherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(ns, config, rx));
        Publisher { tx }
    }

    /// Adds `(name, server)` to the published set and mounts it
    /// synchronously before returning (spec §4.6 "On explicit Add/Remove,
    /// mount/unmount synchronously"). A send after `stop()` is a no-op.
    pub async fn add(&self, name: impl Into<String>, server: impl Into<String>, serves_mount_table: bool) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(Command::Add {
                name: name.into(),
                server: server.into(),
                serves_mount_table,
                reply,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub async fn remove(&self, name: impl Into<String>, server: impl Into<String>) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(Command::Remove {
                name: name.into(),
                server: server.into(),
                reply,
            })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Unmounts every published pair and stops the runloop. Idempotent:
    /// calling `stop` twice has the same effect as calling it once (spec
    /// §8 "Calling Stop twice on a server has the same effect as calling
    /// it once" — the publisher honors the same discipline).
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Stop { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

async fn run(ns: Arc<NamespaceResolver>, config: PublisherConfig, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut mounts: HashMap<Mount, MountState> = HashMap::new();
    let mut ticker = tokio::time::interval(config.refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Add { name, server, serves_mount_table, reply }) => {
                        let key = Mount { name: name.clone(), server: server.clone() };
                        let ttl = config.refresh_interval + config.ttl_slack;
                        let outcome = ns.mount(&name, &server, ttl, serves_mount_table).await;
                        mounts.insert(key, MountState {
                            serves_mount_table,
                            backoff: outcome.err().map(|_| Backoff::initial(config.backoff_base)),
                            pending_unmount: false,
                        });
                        let _ = reply.send(());
                    }
                    Some(Command::Remove { name, server, reply }) => {
                        let key = Mount { name: name.clone(), server: server.clone() };
                        if ns.unmount(&name, &server).await.is_ok() {
                            mounts.remove(&key);
                        } else if let Some(state) = mounts.get_mut(&key) {
                            state.pending_unmount = true;
                            state.backoff = Some(Backoff::initial(config.backoff_base));
                        }
                        let _ = reply.send(());
                    }
                    Some(Command::Stop { reply }) => {
                        for (mount, _) in mounts.drain() {
                            let _ = ns.unmount(&mount.name, &mount.server).await;
                        }
                        let _ = reply.send(());
                        return;
                    }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                refresh_all(&ns, &config, &mut mounts).await;
            }
        }
    }
}

/// One refresh cycle: re-Mount every live entry, retry pending unmounts,
/// and back off entries that keep failing (spec §4.6 bullets 1, 3, 4).
async fn refresh_all(ns: &NamespaceResolver, config: &PublisherConfig, mounts: &mut HashMap<Mount, MountState>) {
    let ttl = config.refresh_interval + config.ttl_slack;
    for (mount, state) in mounts.iter_mut() {
        if state.pending_unmount {
            if ns.unmount(&mount.name, &mount.server).await.is_ok() {
                state.pending_unmount = false;
                state.backoff = None;
            } else {
                bump_backoff(state, config);
            }
            continue;
        }
        match ns
            .mount(&mount.name, &mount.server, ttl, state.serves_mount_table)
            .await
        {
            Ok(()) => state.backoff = None,
            Err(e) => {
                tracing::warn!(name = %mount.name, server = %mount.server, error = %e.0, "mount refresh failed, backing off");
                bump_backoff(state, config);
            }
        }
    }
    mounts.retain(|_, state| !(state.pending_unmount && state.backoff.is_none()));
}

fn bump_backoff(state: &mut MountState, config: &PublisherConfig) {
    match state.backoff.as_mut() {
        Some(b) => b.advance(config.backoff_max),
        None => state.backoff = Some(Backoff::initial(config.backoff_base)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carrier_ns::{ClientFactory, GlobMatch, MountEntry, MountTableClient, MountedServer};
    use std::collections::HashMap as StdHashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    type BoxFut<'a, T> = Pin<Box<dyn Future<Output = carrier_endpoint::Result<T>> + Send + 'a>>;

    #[derive(Default)]
    struct FakeMountTable {
        mounts: Mutex<StdHashMap<String, Vec<MountedServer>>>,
        fail_next_mount: Mutex<bool>,
    }

    impl MountTableClient for FakeMountTable {
        fn resolve_step<'a>(&'a self, suffix: &'a str) -> BoxFut<'a, MountEntry> {
            Box::pin(async move {
                Ok(MountEntry {
                    servers: vec![],
                    suffix: suffix.to_string(),
                    ttl: Duration::from_secs(60),
                })
            })
        }

        fn mount<'a>(
            &'a self,
            name: &'a str,
            server: &'a str,
            _ttl: Duration,
            serves_mount_table: bool,
        ) -> BoxFut<'a, ()> {
            Box::pin(async move {
                let mut fail = self.fail_next_mount.lock().unwrap();
                if *fail {
                    *fail = false;
                    return Err(carrier_endpoint::CarrierError::aborted("mount table unreachable"));
                }
                self.mounts
                    .lock()
                    .unwrap()
                    .entry(name.to_string())
                    .or_default()
                    .push(MountedServer {
                        server: server.to_string(),
                        serves_mount_table,
                    });
                Ok(())
            })
        }

        fn unmount<'a>(&'a self, name: &'a str, server: &'a str) -> BoxFut<'a, ()> {
            Box::pin(async move {
                if let Some(servers) = self.mounts.lock().unwrap().get_mut(name) {
                    servers.retain(|s| s.server != server);
                }
                Ok(())
            })
        }

        fn glob_step<'a>(&'a self, _pattern: &'a str) -> BoxFut<'a, Vec<GlobMatch>> {
            Box::pin(async move { Ok(vec![]) })
        }
    }

    fn resolver(table: Arc<FakeMountTable>) -> Arc<NamespaceResolver> {
        let factory: ClientFactory = Arc::new(move |_s: &str| table.clone() as Arc<dyn MountTableClient>);
        Arc::new(NamespaceResolver::new(vec!["root".to_string()], factory))
    }

    #[tokio::test]
    async fn add_mounts_synchronously() {
        let table = Arc::new(FakeMountTable::default());
        let ns = resolver(table.clone());
        let pub_ = Publisher::spawn(ns, PublisherConfig::default());

        pub_.add("server", "/ep/a:1", false).await;

        assert_eq!(
            table.mounts.lock().unwrap().get("server").cloned(),
            Some(vec![MountedServer {
                server: "/ep/a:1".to_string(),
                serves_mount_table: false,
            }])
        );
    }

    #[tokio::test]
    async fn remove_unmounts_synchronously() {
        let table = Arc::new(FakeMountTable::default());
        let ns = resolver(table.clone());
        let pub_ = Publisher::spawn(ns, PublisherConfig::default());

        pub_.add("server", "/ep/a:1", false).await;
        pub_.remove("server", "/ep/a:1").await;

        assert_eq!(table.mounts.lock().unwrap().get("server"), Some(&vec![]));
    }

    #[tokio::test]
    async fn stop_unmounts_every_published_pair() {
        let table = Arc::new(FakeMountTable::default());
        let ns = resolver(table.clone());
        let pub_ = Publisher::spawn(ns, PublisherConfig::default());

        pub_.add("server", "/ep/a:1", false).await;
        pub_.add("server", "/ep/b:1", false).await;
        pub_.stop().await;

        assert_eq!(table.mounts.lock().unwrap().get("server"), Some(&vec![]));
    }

    #[tokio::test]
    async fn commands_after_stop_are_no_ops() {
        let table = Arc::new(FakeMountTable::default());
        let ns = resolver(table.clone());
        let pub_ = Publisher::spawn(ns, PublisherConfig::default());
        pub_.stop().await;

        pub_.add("server", "/ep/a:1", false).await;

        assert_eq!(table.mounts.lock().unwrap().get("server"), None);
    }

    #[tokio::test]
    async fn failed_mount_is_retried_on_the_next_refresh_tick() {
        let table = Arc::new(FakeMountTable::default());
        *table.fail_next_mount.lock().unwrap() = true;
        let ns = resolver(table.clone());
        let config = PublisherConfig {
            refresh_interval: Duration::from_millis(20),
            ttl_slack: Duration::from_millis(5),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        };
        let pub_ = Publisher::spawn(ns, config);

        pub_.add("server", "/ep/a:1", false).await;
        assert_eq!(table.mounts.lock().unwrap().get("server"), None);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            table.mounts.lock().unwrap().get("server").cloned(),
            Some(vec![MountedServer {
                server: "/ep/a:1".to_string(),
                serves_mount_table: false,
            }])
        );
    }
}
