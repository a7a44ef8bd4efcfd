//! Per-document compaction engine.
//!
//! Merges a document's delta chain into a single snapshot once the chain
//! exceeds the collection threshold, without breaking any peer still
//! catching up. Runs as a persisted multi-step job:
//!
//! ```text
//! pending --run--> running (phase=merge) --paged merge--> running (phase=finalize)
//!               \--prune + session GC--> done
//! On error: running -> pending (retries++) until MAX_RETRIES, then failed
//! ```
//!
//! The sequence counter is frozen as `boundary_seq` when the job leaves
//! pending; every later step only touches deltas at or below it, fencing the
//! job against writes that land while it runs. Work per step is bounded
//! (`page_size`/`max_pages`/`max_deltas`) and the partially merged state is
//! persisted in `scratch` between steps, so a step fits a host work limit
//! and a crashed job resumes where it stopped.

use std::sync::Arc;

use crate::prelude::*;
use crate::sessions::is_active;
use driftsync_types::crdt;
use driftsync_types::log_store::{
	CompactionRow, JobPhase, JobStatus, LogStore, SnapshotRow,
};

/// Retry budget; after this many failed runs the job parks as `failed`.
pub const MAX_RETRIES: u32 = 5;

/// Result of driving one bounded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
	/// More work remains; run another step
	Continue,
	/// Job transitioned to done
	Done,
	/// No pending or running job for the document
	Idle,
}

pub struct Compactor {
	store: Arc<dyn LogStore>,
	/// Base unit for the `2^retries` failure backoff. Tests shrink it.
	backoff_base_ms: u64,
}

impl Compactor {
	pub fn new(store: Arc<dyn LogStore>) -> Self {
		Self { store, backoff_base_ms: 1_000 }
	}

	pub fn with_backoff_base(mut self, base_ms: u64) -> Self {
		self.backoff_base_ms = base_ms;
		self
	}

	/// Enqueue a job unless one is already pending or running. Returns
	/// whether a new job was scheduled.
	pub async fn schedule(
		&self,
		collection: &str,
		document: &str,
		timeout_secs: i64,
		retain: u32,
	) -> DsResult<bool> {
		let row = CompactionRow::pending(collection, document, timeout_secs, retain);
		let scheduled = self.store.try_schedule_job(&row).await?;
		if scheduled {
			info!("compaction scheduled for {}/{}", collection, document);
		} else {
			trace!("compaction already queued for {}/{}", collection, document);
		}
		Ok(scheduled)
	}

	/// Drive the document's job to completion, honoring the retry budget.
	pub async fn run(&self, collection: &str, document: &str) -> DsResult<()> {
		loop {
			match self.step(collection, document).await {
				Ok(StepOutcome::Continue) => tokio::task::yield_now().await,
				Ok(StepOutcome::Done | StepOutcome::Idle) => return Ok(()),
				Err(e) => {
					let retries = self.record_failure(collection, document, &e).await?;
					match retries {
						Some(retries) => {
							let wait = self.backoff_base_ms << retries;
							warn!(
								"compaction of {}/{} failed (retry {}/{} in {}ms): {}",
								collection, document, retries, MAX_RETRIES, wait, e
							);
							tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
						}
						None => {
							error!(
								"compaction of {}/{} failed permanently: {}",
								collection, document, e
							);
							return Err(e);
						}
					}
				}
			}
		}
	}

	/// Move the job back to pending with an incremented retry counter, or
	/// park it as failed once the budget is spent. Returns the new retry
	/// count while the job stays retryable.
	async fn record_failure(
		&self,
		collection: &str,
		document: &str,
		error: &Error,
	) -> DsResult<Option<u32>> {
		let Some(mut job) = self.store.job(collection, document).await? else {
			return Ok(None);
		};
		job.retries += 1;
		job.error = Some(error.to_string().into());
		if job.retries > MAX_RETRIES {
			job.status = JobStatus::Failed;
			job.completed = Some(Timestamp::now());
			self.store.update_job(&job).await?;
			return Ok(None);
		}
		job.status = JobStatus::Pending;
		let retries = job.retries;
		self.store.update_job(&job).await?;
		Ok(Some(retries))
	}

	/// One bounded step of the job state machine.
	pub async fn step(&self, collection: &str, document: &str) -> DsResult<StepOutcome> {
		let Some(mut job) = self.store.job(collection, document).await? else {
			return Ok(StepOutcome::Idle);
		};
		match job.status {
			JobStatus::Done | JobStatus::Failed => Ok(StepOutcome::Idle),
			JobStatus::Pending => {
				// Freeze the boundary exactly once, at first entry
				if job.boundary_seq.is_none() {
					job.boundary_seq = Some(self.store.current_seq(collection).await?);
				}
				job.status = JobStatus::Running;
				self.store.update_job(&job).await?;
				Ok(StepOutcome::Continue)
			}
			JobStatus::Running => match job.phase {
				JobPhase::Merge => self.merge_step(&mut job).await,
				JobPhase::Finalize => self.finalize_step(&mut job).await,
			},
		}
	}

	/// Paged merge: fold ascending-seq deltas (at or below the boundary)
	/// into the scratch state, bounded per step.
	async fn merge_step(&self, job: &mut CompactionRow) -> DsResult<StepOutcome> {
		let boundary = job
			.boundary_seq
			.ok_or_else(|| Error::Internal("running job without boundary".into()))?;

		let mut state = job.scratch.take();
		let mut cursor = match job.cursor {
			Some(cursor) => cursor,
			None => {
				// First merge step seeds from the existing snapshot; deltas it
				// already absorbed are skipped by starting at its boundary
				match self.store.snapshot(&job.collection, &job.document).await? {
					Some(snap) => {
						let seq = snap.seq;
						state = Some(snap.bytes);
						seq
					}
					None => 0,
				}
			}
		};

		let mut pages = 0;
		let mut applied: u32 = 0;
		let exhausted = loop {
			if pages >= job.max_pages || applied >= job.max_deltas {
				break false;
			}
			let rows = self
				.store
				.document_deltas(&job.collection, &job.document, cursor, Some(boundary), job.page_size)
				.await?;
			if rows.is_empty() {
				break true;
			}
			cursor = rows.last().map_or(cursor, |row| row.seq);
			applied += rows.len() as u32;
			pages += 1;

			let mut blobs: Vec<&[u8]> = Vec::with_capacity(rows.len() + 1);
			if let Some(prev) = state.as_deref() {
				blobs.push(prev);
			}
			blobs.extend(rows.iter().map(|row| row.bytes.as_slice()));
			state = Some(crdt::merge_updates(blobs)?);
		};

		job.cursor = Some(cursor);
		job.scratch = state;
		job.processed += applied;
		if exhausted {
			job.phase = JobPhase::Finalize;
		}
		self.store.update_job(job).await?;
		trace!(
			"merge step {}/{}: cursor={} applied={} phase={}",
			job.collection,
			job.document,
			cursor,
			applied,
			job.phase.as_str()
		);
		Ok(StepOutcome::Continue)
	}

	/// Finalize: check peer eligibility, upsert the snapshot, prune deltas if
	/// every active peer is already covered, GC stale sessions.
	async fn finalize_step(&self, job: &mut CompactionRow) -> DsResult<StepOutcome> {
		let boundary = job
			.boundary_seq
			.ok_or_else(|| Error::Internal("running job without boundary".into()))?;
		let merged = match job.scratch.take() {
			Some(bytes) => bytes,
			None => crdt::empty_state(),
		};
		let now = Timestamp::now();

		// A peer still missing bytes the snapshot carries would lose its
		// catch-up path if the deltas vanished under it
		let mut can_delete_all = true;
		for session in self.store.sessions(&job.collection, &job.document).await? {
			if !is_active(&session, job.timeout_secs, now) {
				continue;
			}
			let missing = crdt::diff_update(&merged, session.vector.as_deref())?;
			if missing.len() > crdt::EMPTY_UPDATE_LEN {
				debug!(
					"peer {} gates pruning of {}/{} ({} missing bytes)",
					session.client,
					job.collection,
					job.document,
					missing.len()
				);
				can_delete_all = false;
			}
		}

		let vector = crdt::state_vector(&merged)?;
		self.store
			.upsert_snapshot(&SnapshotRow {
				collection: job.collection.clone(),
				document: job.document.clone(),
				bytes: merged,
				vector,
				seq: boundary,
				created: now,
			})
			.await?;

		if can_delete_all {
			let deleted = self
				.store
				.prune_deltas(&job.collection, &job.document, boundary, job.retain)
				.await?;
			info!(
				"compacted {}/{} at seq {}: pruned {} deltas (retain {})",
				job.collection, job.document, boundary, deleted, job.retain
			);
		} else {
			info!(
				"compacted {}/{} at seq {}: deltas kept for lagging peers",
				job.collection, job.document, boundary
			);
		}

		let cutoff = Timestamp(now.0 - job.timeout_secs);
		self.store.delete_stale_sessions(&job.collection, &job.document, cutoff).await?;

		job.status = JobStatus::Done;
		job.completed = Some(now);
		job.error = None;
		self.store.update_job(job).await?;
		Ok(StepOutcome::Done)
	}
}

impl std::fmt::Debug for Compactor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Compactor").field("backoff_base_ms", &self.backoff_base_ms).finish()
	}
}

// vim: ts=4
