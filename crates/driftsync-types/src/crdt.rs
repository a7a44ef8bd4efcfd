//! CRDT codec facade.
//!
//! The engine is format-agnostic over opaque update blobs; this module is the
//! single place that touches the yrs encoding. Payloads use the Yjs v1 update
//! and state-vector encodings throughout. Merging works by integrating
//! updates into a scratch document in the order given, so ascending-seq input
//! preserves the causal information visible to peers.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{DsResult, Error};

/// Byte length of an update that carries no operations. A diff at or below
/// this length means the target already has everything.
pub const EMPTY_UPDATE_LEN: usize = 2;

pub fn is_empty_update(bytes: &[u8]) -> bool {
	bytes.len() <= EMPTY_UPDATE_LEN
}

fn decode_update(bytes: &[u8]) -> DsResult<Update> {
	Update::decode_v1(bytes)
		.map_err(|e| Error::Reconciliation(format!("undecodable update: {}", e)))
}

fn decode_vector(bytes: &[u8]) -> DsResult<StateVector> {
	StateVector::decode_v1(bytes)
		.map_err(|e| Error::Reconciliation(format!("undecodable state vector: {}", e)))
}

/// Apply an opaque update blob to a document. Idempotent; applying an empty
/// update is a no-op.
pub fn apply_to(doc: &Doc, bytes: &[u8]) -> DsResult<()> {
	let update = decode_update(bytes)?;
	let mut txn = doc.transact_mut();
	txn.apply_update(update)
		.map_err(|e| Error::Reconciliation(format!("update apply failed: {}", e)))?;
	Ok(())
}

/// Merge a sequence of update blobs into a single state blob. The inputs are
/// integrated in iteration order; callers feed snapshot first, then deltas in
/// ascending seq order.
pub fn merge_updates<'a, I>(updates: I) -> DsResult<Vec<u8>>
where
	I: IntoIterator<Item = &'a [u8]>,
{
	let doc = Doc::new();
	for bytes in updates {
		apply_to(&doc, bytes)?;
	}
	let txn = doc.transact();
	Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

/// State vector summarizing a state blob.
pub fn state_vector(state: &[u8]) -> DsResult<Vec<u8>> {
	let doc = Doc::new();
	apply_to(&doc, state)?;
	let txn = doc.transact();
	Ok(txn.state_vector().encode_v1())
}

/// Minimal update that brings a peer at `vector` up to `state`. A missing
/// vector means the peer has nothing, so the full state comes back.
pub fn diff_update(state: &[u8], vector: Option<&[u8]>) -> DsResult<Vec<u8>> {
	let doc = Doc::new();
	apply_to(&doc, state)?;
	let sv = match vector {
		Some(bytes) => decode_vector(bytes)?,
		None => StateVector::default(),
	};
	let txn = doc.transact();
	Ok(txn.encode_state_as_update_v1(&sv))
}

/// State blob of a document that has seen nothing.
pub fn empty_state() -> Vec<u8> {
	let doc = Doc::new();
	let txn = doc.transact();
	txn.encode_state_as_update_v1(&StateVector::default())
}


// vim: ts=4
