//! Presence and sync-progress registry.
//!
//! Tracks one session row per (collection, document, client): connection
//! state, last-acknowledged seq, reported state vector, and presence payload
//! (user, profile, cursor). A joined session carries a scheduled disconnect
//! that each heartbeat renews; compaction uses the rows to decide which
//! peers still gate delta deletion.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::prelude::*;
use driftsync_types::api::{PresenceUpdate, SessionInfo};
use driftsync_types::log_store::{LogStore, SessionRow};

/// Disconnect fires at `2.5 * interval` unless a heartbeat renews it.
const DISCONNECT_FACTOR_TENTHS: i64 = 25;

type SessionKey = (Box<str>, Box<str>, Box<str>);

pub struct SessionRegistry {
	store: Arc<dyn LogStore>,
	default_interval_secs: u32,
	timers: DashMap<SessionKey, JoinHandle<()>>,
}

impl SessionRegistry {
	pub fn new(store: Arc<dyn LogStore>, default_interval_secs: u32) -> Self {
		Self { store, default_interval_secs, timers: DashMap::new() }
	}

	fn key(collection: &str, document: &str, client: &str) -> SessionKey {
		(collection.into(), document.into(), client.into())
	}

	fn cancel_timer(&self, key: &SessionKey) {
		if let Some((_, handle)) = self.timers.remove(key) {
			handle.abort();
		}
	}

	/// Upsert the session as connected and schedule its disconnect. Sync
	/// progress (`seq`) survives from any previous row; presence fields are
	/// replaced when the update carries them.
	pub async fn join(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		update: PresenceUpdate,
	) -> DsResult<()> {
		let now = Timestamp::now();
		let interval = i64::from(update.interval_secs.unwrap_or(self.default_interval_secs));
		let deadline = Timestamp(now.0 + interval * DISCONNECT_FACTOR_TENTHS / 10);

		let previous = self.store.session(collection, document, client).await?;
		let row = SessionRow {
			collection: collection.into(),
			document: document.into(),
			client: client.into(),
			connected: true,
			seq: previous.as_ref().map_or(0, |p| p.seq),
			seen: now,
			vector: update.vector.or_else(|| previous.as_ref().and_then(|p| p.vector.clone())),
			user: update.user.or_else(|| previous.as_ref().and_then(|p| p.user.clone())),
			profile: update
				.profile
				.or_else(|| previous.as_ref().and_then(|p| p.profile.clone())),
			cursor: update.cursor,
			deadline: Some(deadline),
		};
		self.store.upsert_session(&row).await?;
		debug!("session join {}/{} client={} deadline={}", collection, document, client, deadline);

		let key = Self::key(collection, document, client);
		self.cancel_timer(&key);
		let store = Arc::clone(&self.store);
		let (c, d, cl) = (key.0.clone(), key.1.clone(), key.2.clone());
		let wait = u64::try_from(deadline.0 - now.0).unwrap_or(0);
		let handle = tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
			if let Err(e) = store.set_disconnected(&c, &d, &cl).await {
				warn!("scheduled disconnect failed for {}/{} {}: {}", c, d, cl, e);
			}
		});
		self.timers.insert(key, handle);
		Ok(())
	}

	/// Cancel the scheduled disconnect and mark the session disconnected.
	pub async fn leave(&self, collection: &str, document: &str, client: &str) -> DsResult<()> {
		let key = Self::key(collection, document, client);
		self.cancel_timer(&key);
		self.store.set_disconnected(collection, document, client).await?;
		debug!("session leave {}/{} client={}", collection, document, client);
		Ok(())
	}

	/// Refresh last-seen and optionally advance the peer's acknowledged seq
	/// and state vector. The stored seq never regresses, so a stale reply
	/// cannot rewind compaction eligibility.
	pub async fn mark(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		seq: Option<u64>,
		vector: Option<Vec<u8>>,
	) -> DsResult<()> {
		self.store
			.mark_session(collection, document, client, seq, vector, Timestamp::now())
			.await
	}

	/// Presence feed: one row per user (`user ?? client`), the most recently
	/// seen one, optionally filtered by connection state and excluding the
	/// asking client.
	pub async fn sessions(
		&self,
		collection: &str,
		document: &str,
		connected: Option<bool>,
		exclude: Option<&str>,
	) -> DsResult<Vec<SessionInfo>> {
		let rows = self.store.sessions(collection, document).await?;
		let mut latest: HashMap<Box<str>, SessionRow> = HashMap::new();
		for row in rows {
			if let Some(want) = connected {
				if row.connected != want {
					continue;
				}
			}
			if exclude == Some(row.client.as_ref()) {
				continue;
			}
			let identity = row.user.clone().unwrap_or_else(|| row.client.clone());
			match latest.get(&identity) {
				Some(existing) if existing.seen >= row.seen => {}
				_ => {
					latest.insert(identity, row);
				}
			}
		}
		let mut out: Vec<SessionInfo> = latest
			.into_values()
			.map(|row| SessionInfo {
				client: row.client,
				user: row.user,
				profile: row.profile,
				cursor: row.cursor,
				connected: row.connected,
				seq: row.seq,
				seen: row.seen,
			})
			.collect();
		out.sort_by(|a, b| b.seen.cmp(&a.seen).then_with(|| a.client.cmp(&b.client)));
		Ok(out)
	}

	/// GC disconnected sessions not seen for `timeout_secs`.
	pub async fn sweep(
		&self,
		collection: &str,
		document: &str,
		timeout_secs: i64,
	) -> DsResult<u64> {
		let cutoff = Timestamp(Timestamp::now().0 - timeout_secs);
		self.store.delete_stale_sessions(collection, document, cutoff).await
	}
}

/// A session gates compaction while it is connected or was seen within the
/// timeout window.
pub fn is_active(row: &SessionRow, timeout_secs: i64, now: Timestamp) -> bool {
	row.connected || now.0 - row.seen.0 < timeout_secs
}

impl Drop for SessionRegistry {
	fn drop(&mut self) {
		for entry in self.timers.iter() {
			entry.value().abort();
		}
	}
}

impl std::fmt::Debug for SessionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionRegistry").field("timers", &self.timers.len()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn row(client: &str, connected: bool, seen: i64) -> SessionRow {
		SessionRow {
			collection: "tasks".into(),
			document: "a".into(),
			client: client.into(),
			connected,
			seq: 0,
			seen: Timestamp(seen),
			vector: None,
			user: None,
			profile: None,
			cursor: None,
			deadline: None,
		}
	}

	#[test]
	fn activity_window() {
		let now = Timestamp(1_000);
		assert!(is_active(&row("a", true, 0), 60, now));
		assert!(is_active(&row("b", false, 950), 60, now));
		assert!(!is_active(&row("c", false, 900), 60, now));
	}
}

// vim: ts=4
