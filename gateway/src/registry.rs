//! Identity, zone and route tables backed by the provisioning console's
//! JSON files.
//!
//! The console owns the files; this side only reads them. All three tables
//! are published together as one immutable [`Snapshot`] so that concurrent
//! handlers never observe a half-reloaded registry. Handlers clone the
//! current `Arc<Snapshot>` once and keep it for the lifetime of the request
//! they are serving.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::Deserialize;

pub const ENDPOINTS_FILE: &str = "endpoints.json";
pub const ZONES_FILE: &str = "zones.json";
pub const ROUTES_FILE: &str = "routes.json";

/// The kind of a provisioned identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Client,
    Service,
}

/// A principal in the overlay, keyed by its certificate Common Name.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    #[serde(rename = "type")]
    pub kind: IdentityKind,
    #[serde(default)]
    pub name: String,
}

/// Record types a private zone may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    A,
    Cname,
}

/// A single zone record, parsed from the `"<TYPE> <rdata>"` file form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRecord {
    pub kind: RecordKind,
    pub rdata: String,
}

/// A private zone: suffix, record map keyed by relative label (`@` for the
/// apex), the owning service and the set of CNs allowed to resolve in it.
#[derive(Debug, Clone)]
pub struct Zone {
    pub suffix: String,
    pub records: BTreeMap<String, ZoneRecord>,
    pub service_cn: Option<String>,
    pub allowed: HashSet<String>,
}

/// The backend a service identity is routed to.
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub name: String,
}

/// On-disk form of a zone entry in `zones.json`.
#[derive(Debug, Deserialize)]
pub(crate) struct ZoneFile {
    #[serde(default)]
    records: BTreeMap<String, String>,
    #[serde(default)]
    service_cn: Option<String>,
    #[serde(default)]
    allowed_endpoints: Vec<String>,
}

/// Outcome of a name resolution against the registry.
#[derive(Debug, PartialEq, Eq)]
pub enum NameLookup<'a> {
    /// The name falls inside a zone the caller may resolve.
    Match(ZoneMatch<'a>),
    /// The name falls inside a zone but the caller is not on its allow-list.
    Unauthorized,
    /// No zone is authoritative for the name.
    NotInAnyZone,
}

/// A successful zone match: the winning suffix, the label that selected the
/// record, and the record itself.
#[derive(Debug, PartialEq, Eq)]
pub struct ZoneMatch<'a> {
    pub suffix: &'a str,
    pub label: String,
    pub record: &'a ZoneRecord,
}

/// Outcome of a route lookup for the proxy.
#[derive(Debug)]
pub enum RouteLookup<'a> {
    Route(&'a Route),
    /// The host matched a zone but the caller is not on its allow-list.
    Denied,
    /// No zone matched, or the matched zone has no routable service.
    NoRoute,
}

/// One internally consistent view over the three registry tables.
#[derive(Debug)]
pub struct Snapshot {
    identities: HashMap<String, Identity>,
    zones: Vec<Zone>,
    routes: HashMap<String, Route>,
    stamps: [Option<SystemTime>; 3],
}

/// Lowercase a DNS name and strip its trailing dot, the canonical form all
/// suffix and label matching runs on.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl Snapshot {
    /// Look up an identity by certificate Common Name.
    pub fn identity(&self, cn: &str) -> Option<&Identity> {
        self.identities.get(cn)
    }

    /// Resolve `qname` on behalf of the identity `cn`.
    ///
    /// The zone whose suffix equals `qname` or is a `"." + suffix` tail of
    /// it wins; with several candidates the longest suffix wins. The label
    /// is `@` at the apex, otherwise the prefix left of the suffix. A label
    /// missing from the record map falls back to `@`; a miss after the
    /// fallback means the registry is not authoritative for the name.
    pub fn resolve_name(&self, cn: &str, qname: &str) -> NameLookup<'_> {
        let qname = normalize_name(qname);
        let zone = match self.match_zone(&qname) {
            Some(zone) => zone,
            None => return NameLookup::NotInAnyZone,
        };

        if !zone.allowed.contains(cn) {
            return NameLookup::Unauthorized;
        }

        let label = if qname == zone.suffix {
            "@".to_string()
        } else {
            qname[..qname.len() - zone.suffix.len()]
                .trim_end_matches('.')
                .to_string()
        };

        if let Some(record) = zone.records.get(&label) {
            return NameLookup::Match(ZoneMatch {
                suffix: &zone.suffix,
                label,
                record,
            });
        }

        match zone.records.get("@") {
            Some(record) => NameLookup::Match(ZoneMatch {
                suffix: &zone.suffix,
                label: "@".to_string(),
                record,
            }),
            None => NameLookup::NotInAnyZone,
        }
    }

    /// Find the backend route for the virtual host `host` on behalf of the
    /// identity `cn`. Host-to-zone matching follows [`Self::resolve_name`].
    pub fn route_for_host(&self, cn: &str, host: &str) -> RouteLookup<'_> {
        let host = normalize_name(host);
        let zone = match self.match_zone(&host) {
            Some(zone) => zone,
            None => return RouteLookup::NoRoute,
        };

        if !zone.allowed.contains(cn) {
            return RouteLookup::Denied;
        }

        zone.service_cn
            .as_deref()
            .and_then(|service_cn| self.routes.get(service_cn))
            .map(RouteLookup::Route)
            .unwrap_or(RouteLookup::NoRoute)
    }

    /// Longest-suffix zone match. Zone suffixes are unique, so ties cannot
    /// occur.
    fn match_zone(&self, name: &str) -> Option<&Zone> {
        self.zones
            .iter()
            .filter(|zone| {
                name == zone.suffix || name.ends_with(&format!(".{}", zone.suffix))
            })
            .max_by_key(|zone| zone.suffix.len())
    }

    fn load(data_dir: &Path) -> crate::error::Result<Self> {
        let stamps = file_stamps(data_dir);
        let identities: HashMap<String, Identity> =
            load_table(&data_dir.join(ENDPOINTS_FILE), ENDPOINTS_FILE)?;
        let zone_files: HashMap<String, ZoneFile> =
            load_table(&data_dir.join(ZONES_FILE), ZONES_FILE)?;
        let routes: HashMap<String, Route> =
            load_table(&data_dir.join(ROUTES_FILE), ROUTES_FILE)?;

        Ok(Self::build(identities, zone_files, routes, stamps))
    }

    /// Assemble a snapshot from the parsed tables, enforcing the
    /// cross-table invariants so no reader can ever observe a dangling
    /// reference between them.
    fn build(
        identities: HashMap<String, Identity>,
        zone_files: HashMap<String, ZoneFile>,
        routes: HashMap<String, Route>,
        stamps: [Option<SystemTime>; 3],
    ) -> Self {
        let is_service = |cn: &str| {
            identities
                .get(cn)
                .map(|identity| identity.kind == IdentityKind::Service)
                .unwrap_or(false)
        };

        let mut zones: Vec<Zone> = Vec::with_capacity(zone_files.len());
        for (suffix, zone_file) in zone_files {
            let suffix = normalize_name(&suffix);

            if let Some(service_cn) = zone_file.service_cn.as_deref() {
                if !is_service(service_cn) {
                    log::warn!(
                        "Dropping zone {}: service {} is not a provisioned service identity",
                        suffix,
                        service_cn
                    );
                    continue;
                }
            }

            let mut records = BTreeMap::new();
            for (label, value) in zone_file.records {
                match parse_record(&value) {
                    Some(record) => {
                        records.insert(label, record);
                    }
                    None => log::warn!(
                        "Skipping unsupported record {:?} for label {} in zone {}",
                        value,
                        label,
                        suffix
                    ),
                }
            }

            let allowed = zone_file
                .allowed_endpoints
                .into_iter()
                .filter(|cn| {
                    let known = identities.contains_key(cn);
                    if !known {
                        log::warn!(
                            "Pruning unknown identity {} from allow-list of zone {}",
                            cn,
                            suffix
                        );
                    }
                    known
                })
                .collect();

            zones.push(Zone {
                suffix,
                records,
                service_cn: zone_file.service_cn,
                allowed,
            });
        }

        let routes = routes
            .into_iter()
            .filter(|(cn, _)| {
                let routable = is_service(cn);
                if !routable {
                    log::warn!(
                        "Dropping route for {}: not a provisioned service identity",
                        cn
                    );
                }
                routable
            })
            .collect();

        Self {
            identities,
            zones,
            routes,
            stamps,
        }
    }

    #[cfg(test)]
    pub(crate) fn build_for_tests(
        identities: HashMap<String, Identity>,
        zone_files: HashMap<String, ZoneFile>,
        routes: HashMap<String, Route>,
    ) -> Self {
        Self::build(identities, zone_files, routes, [None, None, None])
    }
}

/// Parse the literal `"<TYPE> <rdata>"` record value; only `A` and `CNAME`
/// are defined.
fn parse_record(value: &str) -> Option<ZoneRecord> {
    let (kind, rdata) = value.split_once(' ')?;
    let kind = match kind {
        "A" => RecordKind::A,
        "CNAME" => RecordKind::Cname,
        _ => return None,
    };

    Some(ZoneRecord {
        kind,
        rdata: rdata.to_string(),
    })
}

/// A missing table is an empty table: the provisioning console creates the
/// files lazily.
fn load_table<T: serde::de::DeserializeOwned>(
    path: &Path,
    file: &str,
) -> crate::error::Result<HashMap<String, T>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|err| crate::error::GatewayError::registry_error(file, err.to_string()))
}

fn file_stamps(data_dir: &Path) -> [Option<SystemTime>; 3] {
    [ENDPOINTS_FILE, ZONES_FILE, ROUTES_FILE].map(|file| {
        std::fs::metadata(data_dir.join(file))
            .and_then(|meta| meta.modified())
            .ok()
    })
}

/// Owner of the registry tables. Readers take cheap `Arc` snapshots;
/// reloads swap the pointer under a short-lived write lock.
pub struct Registry {
    data_dir: PathBuf,
    current: RwLock<Arc<Snapshot>>,
}

impl Registry {
    /// Load the registry from `data_dir`. A malformed table at startup is
    /// fatal; there is no previous snapshot to fall back to.
    pub fn load(data_dir: PathBuf) -> crate::error::Result<Self> {
        let snapshot = Snapshot::load(&data_dir)?;
        log::info!(
            "Registry loaded from {}: {} identities, {} zones, {} routes",
            data_dir.display(),
            snapshot.identities.len(),
            snapshot.zones.len(),
            snapshot.routes.len()
        );

        Ok(Self {
            data_dir,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The current snapshot. Callers keep the returned `Arc` for the
    /// lifetime of the request they are handling.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reload the tables when any backing file changed on disk. A parse
    /// failure logs the error and keeps the previous snapshot published.
    pub fn reload_if_changed(&self) -> bool {
        if file_stamps(&self.data_dir) == self.snapshot().stamps {
            return false;
        }

        match Snapshot::load(&self.data_dir) {
            Ok(snapshot) => {
                log::info!(
                    "Registry reloaded: {} identities, {} zones, {} routes",
                    snapshot.identities.len(),
                    snapshot.zones.len(),
                    snapshot.routes.len()
                );
                let mut current = self
                    .current
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *current = Arc::new(snapshot);
                true
            }
            Err(err) => {
                log::error!("Registry reload failed, keeping previous snapshot: {}", err);
                false
            }
        }
    }
}

/// Poll the registry files and republish on change until the shutdown
/// signal fires.
pub async fn run_reloader(
    registry: Arc<Registry>,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.reload_if_changed();
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(identities: &str, zones: &str, routes: &str) -> Snapshot {
        Snapshot::build(
            serde_json::from_str(identities).unwrap(),
            serde_json::from_str(zones).unwrap(),
            serde_json::from_str(routes).unwrap(),
            [None, None, None],
        )
    }

    fn sample_snapshot() -> Snapshot {
        snapshot(
            r#"{
                "c0001": {"type": "client", "name": "laptop"},
                "c0002": {"type": "client", "name": "other laptop"},
                "s0001": {"type": "service", "name": "acme web"}
            }"#,
            r#"{
                "acme.internal": {
                    "records": {"@": "A 203.0.113.10", "web": "CNAME backend.corp"},
                    "service_cn": "s0001",
                    "allowed_endpoints": ["c0001", "s0001"]
                },
                "corp.acme.internal": {
                    "records": {"@": "A 203.0.113.10"},
                    "service_cn": "s0001",
                    "allowed_endpoints": ["c0002"]
                }
            }"#,
            r#"{
                "s0001": {"host": "10.0.0.5", "port": 8080, "domains": ["acme.internal"], "name": "acme web"}
            }"#,
        )
    }

    #[test]
    fn resolves_apex_label() {
        let snapshot = sample_snapshot();
        match snapshot.resolve_name("c0001", "acme.internal") {
            NameLookup::Match(zone_match) => {
                assert_eq!(zone_match.suffix, "acme.internal");
                assert_eq!(zone_match.label, "@");
                assert_eq!(zone_match.record.kind, RecordKind::A);
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn resolves_subdomain_with_apex_fallback() {
        let snapshot = sample_snapshot();
        match snapshot.resolve_name("c0001", "api.acme.internal.") {
            NameLookup::Match(zone_match) => {
                assert_eq!(zone_match.label, "@");
                assert_eq!(zone_match.record.rdata, "203.0.113.10");
            }
            other => panic!("expected fallback match, got {:?}", other),
        }
    }

    #[test]
    fn resolves_defined_label_over_apex() {
        let snapshot = sample_snapshot();
        match snapshot.resolve_name("c0001", "WEB.Acme.Internal") {
            NameLookup::Match(zone_match) => {
                assert_eq!(zone_match.label, "web");
                assert_eq!(zone_match.record.kind, RecordKind::Cname);
                assert_eq!(zone_match.record.rdata, "backend.corp");
            }
            other => panic!("expected cname match, got {:?}", other),
        }
    }

    #[test]
    fn longest_suffix_wins() {
        let snapshot = sample_snapshot();
        // c0002 is allowed in corp.acme.internal but not acme.internal, so
        // a match against the longer suffix must win for this to resolve.
        match snapshot.resolve_name("c0002", "db.corp.acme.internal") {
            NameLookup::Match(zone_match) => {
                assert_eq!(zone_match.suffix, "corp.acme.internal");
                assert_eq!(zone_match.label, "@");
            }
            other => panic!("expected match in nested zone, got {:?}", other),
        }
    }

    #[test]
    fn unauthorized_identity_is_rejected() {
        let snapshot = sample_snapshot();
        assert_eq!(
            snapshot.resolve_name("c0002", "acme.internal"),
            NameLookup::Unauthorized
        );
    }

    #[test]
    fn unknown_zone_is_not_authoritative() {
        let snapshot = sample_snapshot();
        assert_eq!(
            snapshot.resolve_name("c0001", "example.com"),
            NameLookup::NotInAnyZone
        );
        // A suffix must match on a label boundary.
        assert_eq!(
            snapshot.resolve_name("c0001", "notacme.internal"),
            NameLookup::NotInAnyZone
        );
    }

    #[test]
    fn routes_by_host_for_allowed_identity() {
        let snapshot = sample_snapshot();
        match snapshot.route_for_host("c0001", "web.acme.internal") {
            RouteLookup::Route(route) => {
                assert_eq!(route.host, "10.0.0.5");
                assert_eq!(route.port, 8080);
            }
            other => panic!("expected route, got {:?}", other),
        }
    }

    #[test]
    fn route_lookup_denies_identities_off_the_allow_list() {
        let snapshot = sample_snapshot();
        assert!(matches!(
            snapshot.route_for_host("c0002", "web.acme.internal"),
            RouteLookup::Denied
        ));
    }

    #[test]
    fn route_lookup_misses_outside_all_zones() {
        let snapshot = sample_snapshot();
        assert!(matches!(
            snapshot.route_for_host("c0001", "other.example"),
            RouteLookup::NoRoute
        ));
    }

    #[test]
    fn deleted_service_takes_its_zone_and_route_along() {
        // Same files as the sample, but s0001 no longer exists: its zones
        // must be dropped and c0001 must lose all authoritative answers.
        let snapshot = snapshot(
            r#"{"c0001": {"type": "client", "name": "laptop"}}"#,
            r#"{
                "acme.internal": {
                    "records": {"@": "A 203.0.113.10"},
                    "service_cn": "s0001",
                    "allowed_endpoints": ["c0001"]
                }
            }"#,
            r#"{"s0001": {"host": "10.0.0.5", "port": 8080}}"#,
        );

        assert_eq!(
            snapshot.resolve_name("c0001", "acme.internal"),
            NameLookup::NotInAnyZone
        );
        assert!(snapshot.routes.is_empty());
        assert!(snapshot.zones.is_empty());
    }

    #[test]
    fn dangling_allow_list_entries_are_pruned() {
        let snapshot = snapshot(
            r#"{
                "c0001": {"type": "client", "name": "laptop"},
                "s0001": {"type": "service", "name": "svc"}
            }"#,
            r#"{
                "acme.internal": {
                    "records": {"@": "A 203.0.113.10"},
                    "service_cn": "s0001",
                    "allowed_endpoints": ["c0001", "ghost"]
                }
            }"#,
            r#"{}"#,
        );

        assert_eq!(snapshot.zones[0].allowed.len(), 1);
        assert!(snapshot.zones[0].allowed.contains("c0001"));
    }

    #[test]
    fn routes_for_client_identities_are_dropped() {
        let snapshot = snapshot(
            r#"{"c0001": {"type": "client", "name": "laptop"}}"#,
            r#"{}"#,
            r#"{"c0001": {"host": "10.0.0.5", "port": 8080}}"#,
        );

        assert!(snapshot.routes.is_empty());
    }

    #[test]
    fn unsupported_record_types_are_skipped() {
        assert_eq!(parse_record("TXT hello"), None);
        assert_eq!(parse_record("A"), None);
        assert_eq!(
            parse_record("CNAME backend.corp"),
            Some(ZoneRecord {
                kind: RecordKind::Cname,
                rdata: "backend.corp".to_string(),
            })
        );
    }

    #[test]
    fn reload_keeps_previous_snapshot_on_malformed_json() {
        let data_dir = std::env::temp_dir().join(format!(
            "gateway-registry-test-{}-{}",
            std::process::id(),
            line!()
        ));
        std::fs::create_dir_all(&data_dir).unwrap();

        std::fs::write(
            data_dir.join(ENDPOINTS_FILE),
            r#"{"c0001": {"type": "client", "name": "laptop"}}"#,
        )
        .unwrap();
        let registry = Registry::load(data_dir.clone()).unwrap();
        assert!(registry.snapshot().identity("c0001").is_some());

        // Corrupt the file; the reload must fail and keep the old tables.
        std::fs::write(data_dir.join(ENDPOINTS_FILE), "{not json").unwrap();
        // Force a stamp mismatch regardless of filesystem mtime granularity.
        let stale = Registry {
            data_dir: data_dir.clone(),
            current: RwLock::new(Arc::new(Snapshot::build(
                HashMap::from([(
                    "c0001".to_string(),
                    Identity {
                        kind: IdentityKind::Client,
                        name: "laptop".to_string(),
                    },
                )]),
                HashMap::new(),
                HashMap::new(),
                [None, None, None],
            ))),
        };

        assert!(!stale.reload_if_changed());
        assert!(stale.snapshot().identity("c0001").is_some());

        std::fs::remove_dir_all(&data_dir).unwrap();
    }

    #[test]
    fn missing_files_load_as_empty_tables() {
        let data_dir = std::env::temp_dir().join(format!(
            "gateway-registry-test-{}-{}",
            std::process::id(),
            line!()
        ));
        std::fs::create_dir_all(&data_dir).unwrap();

        let registry = Registry::load(data_dir.clone()).unwrap();
        assert!(registry.snapshot().identity("anyone").is_none());

        std::fs::remove_dir_all(&data_dir).unwrap();
    }
}
