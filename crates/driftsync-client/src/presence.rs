//! Presence coordinator.
//!
//! Maintains this peer's awareness state (user, profile, cursor) for one
//! document and keeps the server-side session alive with heartbeats.
//!
//! State machine: `idle → joining → active → leaving → idle`, with a
//! terminal `destroyed`. Only one presence call is in flight at a time;
//! requests issued meanwhile coalesce into a single pending payload that
//! dispatches after the current call completes. Visibility loss issues a
//! leave and remembers the session for re-join; destruction sets the
//! terminal state first, cancels the heartbeat, then sends a best-effort
//! leave.

use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use crate::prelude::*;
use driftsync_types::api::{PresenceAction, PresenceUpdate, SyncApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
	Idle,
	Joining,
	Active,
	Leaving,
	Destroyed,
}

struct Inner {
	state: PresenceState,
	in_flight: bool,
	pending: Option<(PresenceAction, PresenceUpdate)>,
	/// Last join payload; replayed when visibility returns
	last_join: Option<PresenceUpdate>,
	visible: bool,
	/// Active (or joining) when the tab went hidden
	resume_on_visible: bool,
	heartbeat: Option<JoinHandle<()>>,
}

pub struct PresenceCoordinator {
	/// Self-handle for the heartbeat task
	weak: Weak<PresenceCoordinator>,
	api: Arc<dyn SyncApi>,
	collection: Box<str>,
	document: Box<str>,
	client: Box<str>,
	interval_secs: u32,
	inner: tokio::sync::Mutex<Inner>,
}

impl PresenceCoordinator {
	pub fn new(
		api: Arc<dyn SyncApi>,
		collection: impl Into<Box<str>>,
		document: impl Into<Box<str>>,
		client: impl Into<Box<str>>,
		interval_secs: u32,
	) -> Arc<Self> {
		Arc::new_cyclic(|weak| Self {
			weak: weak.clone(),
			api,
			collection: collection.into(),
			document: document.into(),
			client: client.into(),
			interval_secs,
			inner: tokio::sync::Mutex::new(Inner {
				state: PresenceState::Idle,
				in_flight: false,
				pending: None,
				last_join: None,
				visible: true,
				resume_on_visible: false,
				heartbeat: None,
			}),
		})
	}

	pub async fn state(&self) -> PresenceState {
		self.inner.lock().await.state
	}

	pub async fn join(&self, mut update: PresenceUpdate) -> DsResult<()> {
		if update.interval_secs.is_none() {
			update.interval_secs = Some(self.interval_secs);
		}
		{
			let mut inner = self.inner.lock().await;
			inner.last_join = Some(update.clone());
		}
		self.request(PresenceAction::Join, update).await
	}

	pub async fn leave(&self) -> DsResult<()> {
		self.request(PresenceAction::Leave, PresenceUpdate::default()).await
	}

	/// Host visibility signal. Hidden peers leave; returning visible re-joins
	/// if the peer was active before.
	pub async fn set_visible(&self, visible: bool) -> DsResult<()> {
		let (action, update) = {
			let mut inner = self.inner.lock().await;
			if inner.state == PresenceState::Destroyed || inner.visible == visible {
				inner.visible = visible;
				return Ok(());
			}
			inner.visible = visible;
			if visible {
				if !inner.resume_on_visible {
					return Ok(());
				}
				inner.resume_on_visible = false;
				let update = inner.last_join.clone().unwrap_or_default();
				(PresenceAction::Join, update)
			} else {
				let was_active = matches!(
					inner.state,
					PresenceState::Active | PresenceState::Joining
				);
				inner.resume_on_visible = was_active;
				if !was_active {
					return Ok(());
				}
				(PresenceAction::Leave, PresenceUpdate::default())
			}
		};
		self.request(action, update).await
	}

	/// Terminal: no further calls go out after this. The leave is
	/// best-effort; failures only log.
	pub async fn destroy(&self) {
		let heartbeat = {
			let mut inner = self.inner.lock().await;
			inner.state = PresenceState::Destroyed;
			inner.pending = None;
			inner.heartbeat.take()
		};
		if let Some(task) = heartbeat {
			task.abort();
		}
		if let Err(e) = self
			.api
			.presence(
				&self.collection,
				&self.document,
				&self.client,
				PresenceAction::Leave,
				PresenceUpdate::default(),
			)
			.await
		{
			debug!("presence leave on destroy failed: {}", e);
		}
	}

	/// Single-flight dispatcher. While a call runs, later requests collapse
	/// into `pending`; the loop drains it afterwards.
	async fn request(
		&self,
		action: PresenceAction,
		update: PresenceUpdate,
	) -> DsResult<()> {
		{
			let mut inner = self.inner.lock().await;
			if inner.state == PresenceState::Destroyed {
				return Ok(());
			}
			if inner.in_flight {
				inner.pending = Some((action, update));
				return Ok(());
			}
			inner.in_flight = true;
			inner.state = match action {
				PresenceAction::Join => PresenceState::Joining,
				PresenceAction::Leave => PresenceState::Leaving,
			};
		}

		let mut next = Some((action, update));
		while let Some((action, update)) = next.take() {
			let result = self
				.api
				.presence(&self.collection, &self.document, &self.client, action, update)
				.await;

			let mut inner = self.inner.lock().await;
			if inner.state == PresenceState::Destroyed {
				inner.in_flight = false;
				return Ok(());
			}
			match &result {
				Ok(()) => {
					inner.state = match action {
						PresenceAction::Join => PresenceState::Active,
						PresenceAction::Leave => PresenceState::Idle,
					};
					if action == PresenceAction::Join && inner.heartbeat.is_none() {
						inner.heartbeat = Some(self.spawn_heartbeat());
					}
					if action == PresenceAction::Leave {
						if let Some(task) = inner.heartbeat.take() {
							task.abort();
						}
					}
				}
				Err(e) => {
					// Heartbeat-class transient failures are swallowed
					warn!(
						"presence {:?} for {}/{} failed: {}",
						action, self.collection, self.document, e
					);
					inner.state = PresenceState::Idle;
				}
			}
			next = inner.pending.take();
			if next.is_none() {
				inner.in_flight = false;
			}
		}
		Ok(())
	}

	fn spawn_heartbeat(&self) -> JoinHandle<()> {
		let weak = self.weak.clone();
		let interval = u64::from(self.interval_secs.max(1));
		tokio::spawn(async move {
			let mut ticker =
				tokio::time::interval(std::time::Duration::from_secs(interval));
			ticker.tick().await; // first tick fires immediately
			loop {
				ticker.tick().await;
				let Some(coordinator) = weak.upgrade() else { return };
				let update = {
					let inner = coordinator.inner.lock().await;
					if inner.state != PresenceState::Active || !inner.visible {
						continue;
					}
					inner.last_join.clone().unwrap_or_default()
				};
				// Renewing join refreshes the scheduled disconnect
				if let Err(e) = coordinator.request(PresenceAction::Join, update).await {
					debug!("heartbeat failed: {}", e);
				}
			}
		})
	}
}

impl std::fmt::Debug for PresenceCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PresenceCoordinator")
			.field("collection", &self.collection)
			.field("document", &self.document)
			.field("client", &self.client)
			.finish()
	}
}

// vim: ts=4
