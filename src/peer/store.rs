//! Durable peer registry backed by SQLite in WAL mode.
//!
//! Every call opens a short-lived connection scoped by the store-wide
//! lock rather than sharing one stateful connection across threads —
//! the same tradeoff the reference peer store makes, favoring
//! simplicity and crash-safety over connection-pool throughput that
//! this workload doesn't need.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{P2pError, Result};
use crate::peer::state::{Peer, PeerRole, PeerStatus, ScoreParams};
use crate::sync_lock::RwLock;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS peers (
    peer_id          TEXT PRIMARY KEY,
    address          TEXT NOT NULL,
    roles            INTEGER NOT NULL DEFAULT 0,
    chain_id         INTEGER NOT NULL DEFAULT 0,
    alg_policy_root  BLOB,
    head_height      INTEGER NOT NULL DEFAULT 0,
    caps             TEXT NOT NULL DEFAULT '[]',
    status           TEXT NOT NULL,
    first_seen       REAL NOT NULL,
    last_seen        REAL NOT NULL,
    connected_at     REAL,
    last_disconnect  REAL,
    rtt_ms           REAL NOT NULL DEFAULT 0.0,
    score            REAL NOT NULL DEFAULT 0.0,
    snapshot         TEXT
);

CREATE TABLE IF NOT EXISTS addresses (
    peer_id   TEXT NOT NULL REFERENCES peers(peer_id) ON DELETE CASCADE,
    address   TEXT NOT NULL,
    last_seen REAL NOT NULL,
    PRIMARY KEY (peer_id, address)
);

CREATE INDEX IF NOT EXISTS idx_peers_last_seen ON peers(last_seen);
CREATE INDEX IF NOT EXISTS idx_peers_score ON peers(score);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Score,
    LastSeen,
    RttMs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSnapshot {
    roles: u32,
    status: PeerStatus,
    chain_id: u64,
    head_height: u64,
    caps: Vec<String>,
    first_seen_s: f64,
    last_seen_s: f64,
    connected_at_s: f64,
    last_disconnect_s: Option<f64>,
    bytes_in: u64,
    bytes_out: u64,
    msgs_in: u64,
    msgs_out: u64,
    rtt_ms_ewma: f64,
    topic_scores: std::collections::HashMap<String, crate::peer::state::TopicScore>,
    penalties: std::collections::HashMap<String, f64>,
}

impl From<&Peer> for PersistedSnapshot {
    fn from(p: &Peer) -> Self {
        Self {
            roles: p.roles.bits(),
            status: p.status,
            chain_id: p.chain_id,
            head_height: p.head_height,
            caps: p.caps.clone(),
            first_seen_s: p.first_seen_s,
            last_seen_s: p.last_seen_s,
            connected_at_s: p.connected_at_s,
            last_disconnect_s: p.last_disconnect_s,
            bytes_in: p.bytes_in,
            bytes_out: p.bytes_out,
            msgs_in: p.msgs_in,
            msgs_out: p.msgs_out,
            rtt_ms_ewma: p.rtt_ms_ewma,
            topic_scores: p.topic_scores.clone(),
            penalties: p.penalties.iter().map(|(k, v)| (k.clone(), v.magnitude)).collect(),
        }
    }
}

pub struct PeerStore {
    path: PathBuf,
    /// Set for `in_memory()` stores: the path is a `cache=shared` URI, so
    /// every short-lived connection must be opened with `SQLITE_OPEN_URI`
    /// to land on the same backing memory rather than a fresh private one.
    uri: bool,
    /// SQLite drops a shared-cache memory db once its last connection
    /// closes; an in-memory store holds one open for its own lifetime to
    /// keep the backing database alive between calls. Unused for on-disk
    /// stores, where the file itself is the persistent state.
    _memdb_keepalive: Option<Connection>,
    lock: RwLock<()>,
}

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

impl PeerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self { path, uri: false, _memdb_keepalive: None, lock: RwLock::new(()) };
        let conn = store.connect()?;
        conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    /// An in-memory peer store for tests and demos. Every call in this
    /// type opens its own short-lived connection, so a bare `:memory:`
    /// path would hand each call an unrelated empty database — instead
    /// this uses a uniquely-named `cache=shared` URI so all connections
    /// opened against this store see the same data.
    pub fn in_memory() -> Result<Self> {
        let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = PathBuf::from(format!("file:animica_p2p_memdb_{id}?mode=memory&cache=shared"));
        let mut store = Self { path, uri: true, _memdb_keepalive: None, lock: RwLock::new(()) };
        let keepalive = store.connect()?;
        keepalive.execute_batch(SCHEMA)?;
        store._memdb_keepalive = Some(keepalive);
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = if self.uri {
            Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(&self.path)?
        };
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Recomputes score, writes the peer row and its current address
    /// row in one transaction.
    pub fn upsert(&self, peer: &mut Peer, now_s: f64, params: &ScoreParams) -> Result<()> {
        let _guard = self.lock.write();
        let score = peer.compute_score(now_s, params);
        let snapshot = PersistedSnapshot::from(&*peer);
        let snapshot_json = serde_json::to_string(&snapshot)?;
        let caps_json = serde_json::to_string(&peer.caps)?;

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO peers (peer_id, address, roles, chain_id, alg_policy_root, head_height, caps,
                status, first_seen, last_seen, connected_at, last_disconnect, rtt_ms, score, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(peer_id) DO UPDATE SET
                address=excluded.address, roles=excluded.roles, chain_id=excluded.chain_id,
                alg_policy_root=excluded.alg_policy_root, head_height=excluded.head_height,
                caps=excluded.caps, status=excluded.status, last_seen=excluded.last_seen,
                connected_at=excluded.connected_at, last_disconnect=excluded.last_disconnect,
                rtt_ms=excluded.rtt_ms, score=excluded.score, snapshot=excluded.snapshot",
            params![
                peer.peer_id,
                peer.address,
                peer.roles.bits(),
                peer.chain_id as i64,
                peer.alg_policy_root.to_vec(),
                peer.head_height as i64,
                caps_json,
                status_str(peer.status),
                peer.first_seen_s,
                peer.last_seen_s,
                peer.connected_at_s,
                peer.last_disconnect_s,
                peer.rtt_ms_ewma,
                score,
                snapshot_json,
            ],
        )?;
        tx.execute(
            "INSERT INTO addresses (peer_id, address, last_seen) VALUES (?1, ?2, ?3)
             ON CONFLICT(peer_id, address) DO UPDATE SET last_seen=excluded.last_seen",
            params![peer.peer_id, peer.address, peer.last_seen_s],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn record_seen(&self, peer_id: &str, address: Option<&str>, now_s: f64) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute("UPDATE peers SET last_seen = ?1 WHERE peer_id = ?2", params![now_s, peer_id])?;
        if let Some(addr) = address {
            conn.execute(
                "INSERT INTO addresses (peer_id, address, last_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT(peer_id, address) DO UPDATE SET last_seen=excluded.last_seen",
                params![peer_id, addr, now_s],
            )?;
        }
        Ok(())
    }

    pub fn record_connection(&self, peer_id: &str, now_s: f64) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE peers SET status = ?1, connected_at = ?2, last_seen = ?2 WHERE peer_id = ?3",
            params![status_str(PeerStatus::Connected), now_s, peer_id],
        )?;
        Ok(())
    }

    pub fn record_disconnection(&self, peer_id: &str, now_s: f64) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE peers SET status = ?1, last_disconnect = ?2, last_seen = ?2 WHERE peer_id = ?3",
            params![status_str(PeerStatus::Disconnected), now_s, peer_id],
        )?;
        Ok(())
    }

    pub fn note_rtt_sample(&self, peer_id: &str, sample_ms: f64, alpha: f64) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        let current: Option<f64> = conn
            .query_row("SELECT rtt_ms FROM peers WHERE peer_id = ?1", params![peer_id], |r| r.get(0))
            .optional()?;
        let updated = match current {
            Some(c) if c > 0.0 => alpha * sample_ms + (1.0 - alpha) * c,
            _ => sample_ms,
        };
        conn.execute("UPDATE peers SET rtt_ms = ?1 WHERE peer_id = ?2", params![updated, peer_id])?;
        Ok(())
    }

    pub fn update_score_snapshot(&self, peer_id: &str, score: f64) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute("UPDATE peers SET score = ?1 WHERE peer_id = ?2", params![score, peer_id])?;
        Ok(())
    }

    pub fn update_head_height(&self, peer_id: &str, height: u64) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute("UPDATE peers SET head_height = ?1 WHERE peer_id = ?2", params![height as i64, peer_id])?;
        Ok(())
    }

    pub fn ban(&self, peer_id: &str) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute(
            "UPDATE peers SET status = ?1 WHERE peer_id = ?2",
            params![status_str(PeerStatus::Banned), peer_id],
        )?;
        Ok(())
    }

    pub fn forget(&self, peer_id: &str) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute("DELETE FROM peers WHERE peer_id = ?1", params![peer_id])?;
        Ok(())
    }

    pub fn get(&self, peer_id: &str) -> Result<Option<Peer>> {
        let _guard = self.lock.read();
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT peer_id, address, roles, chain_id, alg_policy_root, head_height, caps,
                        status, first_seen, last_seen, connected_at, last_disconnect, rtt_ms, score, snapshot
                 FROM peers WHERE peer_id = ?1",
                params![peer_id],
                row_to_peer,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_by_address(&self, address: &str) -> Result<Vec<String>> {
        let _guard = self.lock.read();
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT peer_id FROM addresses WHERE address = ?1 ORDER BY last_seen DESC")?;
        let ids = stmt
            .query_map(params![address], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn list_known(
        &self,
        limit: u32,
        min_score: Option<f64>,
        status_in: Option<&[PeerStatus]>,
        order_by: OrderBy,
    ) -> Result<Vec<Peer>> {
        let _guard = self.lock.read();
        let conn = self.connect()?;

        let mut sql = String::from(
            "SELECT peer_id, address, roles, chain_id, alg_policy_root, head_height, caps,
                    status, first_seen, last_seen, connected_at, last_disconnect, rtt_ms, score, snapshot
             FROM peers WHERE 1=1",
        );
        if min_score.is_some() {
            sql.push_str(" AND score >= ?1");
        }
        if let Some(statuses) = status_in {
            if !statuses.is_empty() {
                let list = statuses.iter().map(|s| format!("'{}'", status_str(*s))).collect::<Vec<_>>().join(",");
                sql.push_str(&format!(" AND status IN ({list})"));
            }
        }
        sql.push_str(match order_by {
            OrderBy::Score => " ORDER BY score DESC",
            OrderBy::LastSeen => " ORDER BY last_seen DESC",
            OrderBy::RttMs => " ORDER BY rtt_ms ASC, score DESC",
        });
        sql.push_str(" LIMIT ?2");

        let mut stmt = conn.prepare(&sql)?;
        let rows = if let Some(ms) = min_score {
            stmt.query_map(params![ms, limit], row_to_peer)?
        } else {
            stmt.query_map(params![0i64, limit], row_to_peer)?
        };
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn list_addresses(&self, limit: u32, since: Option<f64>) -> Result<Vec<(String, String, f64)>> {
        let _guard = self.lock.read();
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT peer_id, address, last_seen FROM addresses WHERE last_seen >= ?1 ORDER BY last_seen DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since.unwrap_or(0.0), limit], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes records whose `last_seen` is older than `older_than_s`
    /// seconds as of `now_s`, in any of `statuses`. Returns the number
    /// removed. Primarily used to reap `Banned` records after a TTL.
    pub fn prune(&self, now_s: f64, older_than_s: f64, statuses: &[PeerStatus]) -> Result<usize> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        let cutoff = now_s - older_than_s;
        let list = statuses.iter().map(|s| format!("'{}'", status_str(*s))).collect::<Vec<_>>().join(",");
        let sql = format!("DELETE FROM peers WHERE last_seen < ?1 AND status IN ({list})");
        let removed = conn.execute(&sql, params![cutoff])?;
        Ok(removed)
    }

    pub fn vacuum(&self) -> Result<()> {
        let _guard = self.lock.write();
        let conn = self.connect()?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

fn status_str(status: PeerStatus) -> &'static str {
    match status {
        PeerStatus::Dialing => "dialing",
        PeerStatus::Connected => "connected",
        PeerStatus::Disconnected => "disconnected",
        PeerStatus::Banned => "banned",
    }
}

fn status_from_str(s: &str) -> PeerStatus {
    match s {
        "connected" => PeerStatus::Connected,
        "disconnected" => PeerStatus::Disconnected,
        "banned" => PeerStatus::Banned,
        _ => PeerStatus::Dialing,
    }
}

/// Prefers the JSON snapshot for rehydration; falls back to columns if
/// the snapshot is absent or fails to parse.
fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Peer> {
    let peer_id: String = row.get(0)?;
    let address: String = row.get(1)?;
    let roles_bits: u32 = row.get(2)?;
    let chain_id: i64 = row.get(3)?;
    let alg_policy_root: Option<Vec<u8>> = row.get(4)?;
    let head_height: i64 = row.get(5)?;
    let caps_json: String = row.get(6)?;
    let status_col: String = row.get(7)?;
    let first_seen: f64 = row.get(8)?;
    let last_seen: f64 = row.get(9)?;
    let connected_at: Option<f64> = row.get(10)?;
    let last_disconnect: Option<f64> = row.get(11)?;
    let rtt_ms: f64 = row.get(12)?;
    let snapshot_json: Option<String> = row.get(14)?;

    let mut peer = Peer::new(peer_id.clone(), address.clone(), chain_id as u64, first_seen);
    peer.roles = PeerRole::from_bits_truncate(roles_bits);
    peer.head_height = head_height as u64;
    peer.caps = serde_json::from_str(&caps_json).unwrap_or_default();
    peer.status = status_from_str(&status_col);
    peer.last_seen_s = last_seen;
    peer.connected_at_s = connected_at.unwrap_or(first_seen);
    peer.last_disconnect_s = last_disconnect;
    peer.rtt_ms_ewma = rtt_ms;
    if let Some(root) = alg_policy_root {
        if root.len() == 32 {
            peer.alg_policy_root.copy_from_slice(&root);
        }
    }

    if let Some(json) = snapshot_json {
        if let Ok(snap) = serde_json::from_str::<PersistedSnapshot>(&json) {
            peer.roles = PeerRole::from_bits_truncate(snap.roles);
            peer.status = snap.status;
            peer.chain_id = snap.chain_id;
            peer.head_height = snap.head_height;
            peer.caps = snap.caps;
            peer.first_seen_s = snap.first_seen_s;
            peer.last_seen_s = snap.last_seen_s;
            peer.connected_at_s = snap.connected_at_s;
            peer.last_disconnect_s = snap.last_disconnect_s;
            peer.bytes_in = snap.bytes_in;
            peer.bytes_out = snap.bytes_out;
            peer.msgs_in = snap.msgs_in;
            peer.msgs_out = snap.msgs_out;
            peer.rtt_ms_ewma = snap.rtt_ms_ewma;
            peer.topic_scores = snap.topic_scores;
            peer.penalties = snap
                .penalties
                .into_iter()
                .map(|(k, v)| (k, crate::peer::state::Penalty { magnitude: v, applied_at_s: snap.connected_at_s }))
                .collect();
        }
    }

    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::state::Peer;

    #[test]
    fn upsert_and_get_roundtrip() {
        let store = PeerStore::in_memory().unwrap();
        let mut peer = Peer::new("peer1".into(), "tcp/1.2.3.4:9000".into(), 7, 1000.0);
        peer.status = PeerStatus::Connected;
        peer.roles = PeerRole::FULL | PeerRole::RELAY;
        let params = ScoreParams::default();
        store.upsert(&mut peer, 1000.0, &params).unwrap();

        let fetched = store.get("peer1").unwrap().unwrap();
        assert_eq!(fetched.peer_id, "peer1");
        assert_eq!(fetched.address, "tcp/1.2.3.4:9000");
        assert_eq!(fetched.chain_id, 7);
        assert_eq!(fetched.roles, PeerRole::FULL | PeerRole::RELAY);
    }

    #[test]
    fn ban_then_prune_removes_record() {
        let store = PeerStore::in_memory().unwrap();
        let mut peer = Peer::new("peer1".into(), "addr".into(), 1, 0.0);
        let params = ScoreParams::default();
        store.upsert(&mut peer, 0.0, &params).unwrap();
        store.ban("peer1").unwrap();
        let removed = store.prune(1.0, 0.0, &[PeerStatus::Banned]).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("peer1").unwrap().is_none());
    }

    #[test]
    fn find_by_address_orders_by_recency() {
        let store = PeerStore::in_memory().unwrap();
        let mut p1 = Peer::new("peer1".into(), "addr1".into(), 1, 0.0);
        let mut p2 = Peer::new("peer2".into(), "addr1".into(), 1, 10.0);
        let params = ScoreParams::default();
        store.upsert(&mut p1, 0.0, &params).unwrap();
        store.upsert(&mut p2, 10.0, &params).unwrap();
        let ids = store.find_by_address("addr1").unwrap();
        assert_eq!(ids, vec!["peer2".to_string(), "peer1".to_string()]);
    }

    #[test]
    fn list_known_respects_min_score_and_limit() {
        let store = PeerStore::in_memory().unwrap();
        let params = ScoreParams::default();
        for i in 0..3 {
            let mut p = Peer::new(format!("peer{i}"), "addr".into(), 1, 0.0);
            store.upsert(&mut p, 0.0, &params).unwrap();
        }
        let known = store.list_known(10, Some(0.0), None, OrderBy::Score).unwrap();
        assert_eq!(known.len(), 3);
    }
}
