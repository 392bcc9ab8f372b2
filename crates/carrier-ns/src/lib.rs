//! Namespace resolver (spec §2 `ns`, §4.7).
//!
//! `resolve`/`resolve_to_mount_table` walk a chain of mount tables one hop
//! at a time, fanning each hop out to every server the current entry
//! names (first success wins) and caching successful answers under
//! `(server, suffix)` until their TTL lapses. `mount`/`unmount` resolve a
//! name to its serving mount tables and fan the mutation out in parallel.
//! `glob` is a bounded breadth-first walk over recursive (`...`) patterns.
//!
//! The mount tables themselves are an RPC-layer concern external to this
//! crate (a mount table is just a server whose `Invoker` happens to
//! implement `ResolveStep`/`Mount`/`Unmount`/`Glob` — spec §4.8); this
//! crate depends only on the [`MountTableClient`] trait so it can be
//! tested without the full client/server stack.

use carrier_endpoint::{CarrierError, ErrorKind, Result as EpResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One server behind a mount-table entry (spec §3 "Mount entry").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedServer {
    pub server: String,
    pub serves_mount_table: bool,
}

/// The result of resolving one hop: the servers now hosting the name, and
/// the suffix still to be resolved against them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub servers: Vec<MountedServer>,
    pub suffix: String,
    pub ttl: Duration,
}

impl MountEntry {
    fn any_serves_mount_table(&self) -> bool {
        self.servers.iter().any(|s| s.serves_mount_table)
    }
}

/// One matched name from a `Glob` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobMatch {
    pub name: String,
    pub servers: Vec<MountedServer>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("ns: {0}")]
pub struct NsError(pub CarrierError);

impl From<CarrierError> for NsError {
    fn from(e: CarrierError) -> Self {
        NsError(e)
    }
}

pub type NsResult<T> = std::result::Result<T, NsError>;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = EpResult<T>> + Send + 'a>>;

/// What the resolver needs from a single mount-table server (spec §4.7,
/// §4.8 `ResolveStep`/`Mount`/`Unmount`/`Glob`). Implemented by the RPC
/// client layer against a real mount table, or by an in-memory stand-in
/// for tests.
pub trait MountTableClient: Send + Sync + 'static {
    /// Resolves one hop of `suffix` against this server.
    fn resolve_step<'a>(&'a self, suffix: &'a str) -> BoxFut<'a, MountEntry>;
    fn mount<'a>(
        &'a self,
        name: &'a str,
        server: &'a str,
        ttl: Duration,
        serves_mount_table: bool,
    ) -> BoxFut<'a, ()>;
    fn unmount<'a>(&'a self, name: &'a str, server: &'a str) -> BoxFut<'a, ()>;
    /// One level of glob matching against this server's own children.
    fn glob_step<'a>(&'a self, pattern: &'a str) -> BoxFut<'a, Vec<GlobMatch>>;
}

pub type ClientFactory = Arc<dyn Fn(&str) -> Arc<dyn MountTableClient> + Send + Sync>;

struct CacheEntry {
    value: MountEntry,
    not_after: Instant,
}

struct Cache {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl Cache {
    fn new() -> Self {
        Cache {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, server: &str, suffix: &str) -> Option<MountEntry> {
        let entries = self.entries.read();
        let entry = entries.get(&(server.to_string(), suffix.to_string()))?;
        if Instant::now() >= entry.not_after {
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, server: &str, suffix: &str, value: MountEntry) {
        let not_after = Instant::now() + value.ttl;
        self.entries.write().insert(
            (server.to_string(), suffix.to_string()),
            CacheEntry { value, not_after },
        );
    }

    /// Flushed explicitly after Mount/Unmount on any prefix (spec §4.7).
    fn flush_prefix(&self, name_prefix: &str) {
        self.entries
            .write()
            .retain(|(server, _), _| !server.starts_with(name_prefix) && server != name_prefix);
    }

    fn flush_all(&self) {
        self.entries.write().clear();
    }
}

/// Splits `name` into its first slash-separated component and the rest.
fn split_first(name: &str) -> (&str, &str) {
    let name = name.trim_start_matches('/');
    match name.split_once('/') {
        Some((head, rest)) => (head, rest),
        None => (name, ""),
    }
}

pub struct NamespaceResolver {
    roots: Vec<String>,
    client_factory: ClientFactory,
    cache: Cache,
    max_resolve_depth: usize,
    max_glob_depth: usize,
}

impl NamespaceResolver {
    pub fn new(roots: Vec<String>, client_factory: ClientFactory) -> Self {
        NamespaceResolver {
            roots,
            client_factory,
            cache: Cache::new(),
            max_resolve_depth: 32,
            max_glob_depth: 8,
        }
    }

    pub fn with_max_resolve_depth(mut self, depth: usize) -> Self {
        self.max_resolve_depth = depth;
        self
    }

    pub fn with_max_glob_depth(mut self, depth: usize) -> Self {
        self.max_glob_depth = depth;
        self
    }

    fn root_entry(&self) -> MountEntry {
        MountEntry {
            servers: self
                .roots
                .iter()
                .map(|r| MountedServer {
                    server: r.clone(),
                    serves_mount_table: true,
                })
                .collect(),
            suffix: String::new(),
            ttl: Duration::MAX,
        }
    }

    /// Resolves one hop from `entry` with the given `suffix`, fanning out
    /// to every server in `entry` in turn (first success wins), using the
    /// cache where possible. Fails only once every server has failed
    /// (spec §4.7/§7: "fails the whole call only when all replicas for a
    /// given mount table fail").
    async fn step(&self, entry: &MountEntry, suffix: &str) -> NsResult<MountEntry> {
        let mut last_err: Option<NsError> = None;
        for server in &entry.servers {
            if let Some(cached) = self.cache.get(&server.server, suffix) {
                return Ok(cached);
            }
            let client = (self.client_factory)(&server.server);
            match client.resolve_step(suffix).await {
                Ok(next) => {
                    self.cache.put(&server.server, suffix, next.clone());
                    return Ok(next);
                }
                Err(e) if e.kind() == ErrorKind::NoSuchName => return Err(e.into()),
                Err(e) => last_err = Some(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| CarrierError::no_such_name("no servers to resolve against").into()))
    }

    /// Iteratively resolves `name`, returning the terminal entry (spec
    /// §4.7 point 1-3).
    pub async fn resolve(&self, name: &str) -> NsResult<MountEntry> {
        self.resolve_inner(name).await.map(|(entry, _)| entry)
    }

    /// Same walk as `resolve`, but returns the last mount-table entry
    /// visited instead of the terminal one (spec §4.7
    /// `ResolveToMountTable`).
    pub async fn resolve_to_mount_table(&self, name: &str) -> NsResult<MountEntry> {
        self.resolve_inner(name).await.map(|(_, last_mt)| last_mt)
    }

    async fn resolve_inner(&self, name: &str) -> NsResult<(MountEntry, MountEntry)> {
        let mut current = self.root_entry();
        let mut suffix = name.trim_start_matches('/').to_string();
        let mut last_mount_table = current.clone();

        for _ in 0..self.max_resolve_depth {
            if !current.any_serves_mount_table() || suffix.is_empty() {
                return Ok((current, last_mount_table));
            }
            last_mount_table = current.clone();
            let next = self.step(&current, &suffix).await?;
            suffix = next.suffix.clone();
            current = next;
        }
        Err(CarrierError::new(
            ErrorKind::Unknown,
            format!("resolution-depth-exceeded resolving {name:?}"),
        )
        .into())
    }

    /// Resolves `name` to its serving mount tables, then fans the mount
    /// out to each in parallel (spec §4.7 `Mount`). Succeeds once at
    /// least one targeted server accepts the mount.
    pub async fn mount(
        &self,
        name: &str,
        server: &str,
        ttl: Duration,
        serves_mount_table: bool,
    ) -> NsResult<()> {
        let (parent_suffix, leaf) = split_parent_leaf(name);
        let mt = self.resolve_to_mount_table(parent_suffix).await?;
        self.fan_out_mutation(&mt, leaf, |client, leaf| {
            client.mount(leaf, server, ttl, serves_mount_table)
        })
        .await?;
        self.cache.flush_prefix(name);
        Ok(())
    }

    /// Fans `Unmount` out the same way `mount` fans `Mount` out.
    pub async fn unmount(&self, name: &str, server: &str) -> NsResult<()> {
        let (parent_suffix, leaf) = split_parent_leaf(name);
        let mt = self.resolve_to_mount_table(parent_suffix).await?;
        self.fan_out_mutation(&mt, leaf, |client, leaf| client.unmount(leaf, server))
            .await?;
        self.cache.flush_prefix(name);
        Ok(())
    }

    async fn fan_out_mutation<F>(&self, mt: &MountEntry, leaf: &str, op: F) -> NsResult<()>
    where
        F: Fn(Arc<dyn MountTableClient>, &str) -> BoxFut<'_, ()>,
    {
        let mut any_ok = false;
        let mut last_err = None;
        for server in &mt.servers {
            let client = (self.client_factory)(&server.server);
            match op(client, leaf).await {
                Ok(()) => any_ok = true,
                Err(e) => last_err = Some(e),
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(last_err
                .unwrap_or_else(|| CarrierError::aborted("no mount table servers to mutate"))
                .into())
        }
    }

    /// Bounded breadth-first glob (spec §4.7 `Glob`). `pattern`'s last
    /// segment of `...` requests unbounded recursion into child mount
    /// tables, capped at `max_glob_depth`.
    pub async fn glob(&self, pattern: &str) -> NsResult<Vec<GlobMatch>> {
        let recursive = pattern.trim_end_matches('/').ends_with("...");
        let mut out = Vec::new();
        let mut frontier: Vec<(String, MountEntry)> =
            vec![(String::new(), self.root_entry())];

        for _depth in 0..self.max_glob_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next_frontier = Vec::new();
            for (prefix, entry) in frontier {
                for server in &entry.servers {
                    let client = (self.client_factory)(&server.server);
                    let matches = match client.glob_step(pattern).await {
                        Ok(m) => m,
                        Err(_) => continue,
                    };
                    for m in matches {
                        let full_name = if prefix.is_empty() {
                            m.name.clone()
                        } else {
                            format!("{prefix}/{}", m.name)
                        };
                        let descends_further =
                            recursive && m.servers.iter().any(|s| s.serves_mount_table);
                        if descends_further {
                            next_frontier.push((
                                full_name.clone(),
                                MountEntry {
                                    servers: m.servers.clone(),
                                    suffix: String::new(),
                                    ttl: Duration::MAX,
                                },
                            ));
                        }
                        out.push(GlobMatch {
                            name: full_name,
                            servers: m.servers,
                        });
                    }
                }
            }
            frontier = next_frontier;
        }
        Ok(out)
    }

    pub fn flush_cache(&self) {
        self.cache.flush_all();
    }
}

fn split_parent_leaf(name: &str) -> (&str, &str) {
    let name = name.trim_end_matches('/');
    match name.rsplit_once('/') {
        Some((parent, leaf)) => (parent, leaf),
        None => ("", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory mount table keyed by server name, for exercising the
    /// resolver without a real RPC stack (see `carrier-testkit` for the
    /// version wired through actual Flows).
    #[derive(Default)]
    struct FakeMountTable {
        mounts: Mutex<HashMap<String, Vec<MountedServer>>>,
    }

    impl FakeMountTable {
        fn mount_sync(&self, name: &str, server: MountedServer) {
            self.mounts
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push(server);
        }
    }

    impl MountTableClient for FakeMountTable {
        fn resolve_step<'a>(&'a self, suffix: &'a str) -> BoxFut<'a, MountEntry> {
            Box::pin(async move {
                let (head, rest) = split_first(suffix);
                let mounts = self.mounts.lock().unwrap();
                match mounts.get(head) {
                    Some(servers) => Ok(MountEntry {
                        servers: servers.clone(),
                        suffix: rest.to_string(),
                        ttl: Duration::from_secs(60),
                    }),
                    None => Err(CarrierError::no_such_name(format!("no mount for {head:?}"))),
                }
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
                self.mount_sync(
                    name,
                    MountedServer {
                        server: server.to_string(),
                        serves_mount_table,
                    },
                );
                Ok(())
            })
        }

        fn unmount<'a>(&'a self, name: &'a str, server: &'a str) -> BoxFut<'a, ()> {
            Box::pin(async move {
                let mut mounts = self.mounts.lock().unwrap();
                if let Some(servers) = mounts.get_mut(name) {
                    servers.retain(|s| s.server != server);
                }
                Ok(())
            })
        }

        fn glob_step<'a>(&'a self, _pattern: &'a str) -> BoxFut<'a, Vec<GlobMatch>> {
            Box::pin(async move {
                let mounts = self.mounts.lock().unwrap();
                Ok(mounts
                    .iter()
                    .map(|(name, servers)| GlobMatch {
                        name: name.clone(),
                        servers: servers.clone(),
                    })
                    .collect())
            })
        }
    }

    fn leaf_server(addr: &str) -> MountedServer {
        MountedServer {
            server: addr.to_string(),
            serves_mount_table: false,
        }
    }

    fn mt_server(addr: &str) -> MountedServer {
        MountedServer {
            server: addr.to_string(),
            serves_mount_table: true,
        }
    }

    fn single_table_resolver(table: Arc<FakeMountTable>) -> NamespaceResolver {
        let factory: ClientFactory = Arc::new(move |_server: &str| table.clone() as Arc<dyn MountTableClient>);
        NamespaceResolver::new(vec!["root".to_string()], factory)
    }

    #[tokio::test]
    async fn resolve_single_hop_to_a_leaf_server() {
        let table = Arc::new(FakeMountTable::default());
        table.mount_sync("server", leaf_server("/ep/server:1234"));
        let ns = single_table_resolver(table);

        let entry = ns.resolve("server/suffix").await.unwrap();
        assert_eq!(entry.suffix, "suffix");
        assert_eq!(entry.servers, vec![leaf_server("/ep/server:1234")]);
    }

    #[tokio::test]
    async fn resolve_to_mount_table_returns_last_mount_table_entry() {
        let table = Arc::new(FakeMountTable::default());
        table.mount_sync("server", leaf_server("/ep/server:1234"));
        let ns = single_table_resolver(table);

        let mt = ns.resolve_to_mount_table("server/suffix").await.unwrap();
        assert!(mt.any_serves_mount_table());
        assert_eq!(mt.suffix, "server/suffix");
    }

    #[tokio::test]
    async fn deep_chain_resolves_through_every_mount_table() {
        let root = Arc::new(FakeMountTable::default());
        let b = Arc::new(FakeMountTable::default());
        let c = Arc::new(FakeMountTable::default());
        root.mount_sync("mt", mt_server("mt-b"));
        b.mount_sync("mt", mt_server("mt-c"));
        c.mount_sync("fortune", leaf_server("/ep/fortune:1"));

        let tables: HashMap<&str, Arc<FakeMountTable>> =
            [("root", root), ("mt-b", b), ("mt-c", c)].into_iter().collect();
        let factory: ClientFactory = Arc::new(move |server: &str| {
            tables.get(server).cloned().unwrap() as Arc<dyn MountTableClient>
        });
        let ns = NamespaceResolver::new(vec!["root".to_string()], factory);

        let entry = ns.resolve("mt/b/mt/c/fortune").await.unwrap();
        assert_eq!(entry.servers, vec![leaf_server("/ep/fortune:1")]);
        assert_eq!(entry.suffix, "fortune");

        let mt = ns.resolve_to_mount_table("mt/b/mt/c/fortune").await.unwrap();
        assert_eq!(mt.suffix, "fortune");
        assert!(mt.any_serves_mount_table());
    }

    #[tokio::test]
    async fn no_such_name_is_not_retried_against_other_servers() {
        let table = Arc::new(FakeMountTable::default());
        let ns = single_table_resolver(table);
        let err = ns.resolve("missing/suffix").await.unwrap_err();
        assert_eq!(err.0.kind(), ErrorKind::NoSuchName);
    }

    #[tokio::test]
    async fn mount_then_unmount_round_trips() {
        let table = Arc::new(FakeMountTable::default());
        let ns = single_table_resolver(table.clone());

        ns.mount("name", "/ep/s:1", Duration::from_secs(60), false)
            .await
            .unwrap();
        assert_eq!(
            table.mounts.lock().unwrap().get("name").cloned(),
            Some(vec![leaf_server("/ep/s:1")])
        );

        ns.unmount("name", "/ep/s:1").await.unwrap();
        assert_eq!(table.mounts.lock().unwrap().get("name"), Some(&vec![]));
    }

    #[tokio::test]
    async fn mount_flushes_the_cache_for_its_prefix() {
        let table = Arc::new(FakeMountTable::default());
        table.mount_sync("server", leaf_server("/ep/a:1"));
        let ns = single_table_resolver(table.clone());

        ns.resolve("server/x").await.unwrap();
        assert!(ns.cache.get("root", "server/x").is_some());

        ns.mount("server/x", "/ep/b:1", Duration::from_secs(5), false)
            .await
            .unwrap();
        assert!(ns.cache.get("root", "server/x").is_none());
    }

    #[tokio::test]
    async fn resolution_depth_exceeded_on_a_cycle() {
        let a = Arc::new(FakeMountTable::default());
        a.mount_sync("loop", mt_server("a"));
        let tables: HashMap<&str, Arc<FakeMountTable>> = [("root", a.clone()), ("a", a)].into_iter().collect();
        let factory: ClientFactory = Arc::new(move |server: &str| {
            tables.get(server).cloned().unwrap() as Arc<dyn MountTableClient>
        });
        let ns = NamespaceResolver::new(vec!["root".to_string()], factory).with_max_resolve_depth(4);

        let err = ns.resolve("loop/loop/loop/loop/loop").await.unwrap_err();
        assert_eq!(err.0.kind(), ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn glob_returns_direct_children() {
        let table = Arc::new(FakeMountTable::default());
        table.mount_sync("a", leaf_server("/ep/a:1"));
        table.mount_sync("b", leaf_server("/ep/b:1"));
        let ns = single_table_resolver(table);

        let mut matches = ns.glob("*").await.unwrap();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "a");
        assert_eq!(matches[1].name, "b");
    }
}
