//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use driftsync_log_adapter_sqlite::LogAdapterSqlite;
use driftsync_server::Engine;
use driftsync_types::types::CollectionConfig;

pub async fn engine() -> (Arc<Engine>, TempDir) {
	engine_with(CollectionConfig::default()).await
}

pub async fn engine_with(config: CollectionConfig) -> (Arc<Engine>, TempDir) {
	let temp = TempDir::new().expect("temp dir");
	let store = Arc::new(LogAdapterSqlite::new(temp.path()).await.expect("log adapter"));
	(Engine::with_compactor_backoff(store, config, 1), temp)
}

/// A writing peer: one yrs document that emits sequential text deltas.
pub struct TextSource {
	doc: Doc,
	text: TextRef,
}

impl TextSource {
	pub fn new() -> Self {
		let doc = Doc::new();
		let text = doc.get_or_insert_text("content");
		Self { doc, text }
	}

	/// Append `insert` to the text and return the delta for just that edit.
	pub fn edit(&self, insert: &str) -> Vec<u8> {
		let before = {
			let txn = self.doc.transact();
			txn.state_vector()
		};
		{
			let mut txn = self.doc.transact_mut();
			let len = self.text.get_string(&txn).len() as u32;
			self.text.insert(&mut txn, len, insert);
		}
		let txn = self.doc.transact();
		txn.encode_state_as_update_v1(&before)
	}

	pub fn state(&self) -> Vec<u8> {
		let txn = self.doc.transact();
		txn.encode_state_as_update_v1(&StateVector::default())
	}

	pub fn text(&self) -> String {
		let txn = self.doc.transact();
		self.text.get_string(&txn)
	}
}

/// Materialize the text content of a state/update blob sequence.
pub fn text_of(blobs: &[Vec<u8>]) -> String {
	let doc = Doc::new();
	let text = doc.get_or_insert_text("content");
	for blob in blobs {
		let update = Update::decode_v1(blob).expect("decodable update");
		let mut txn = doc.transact_mut();
		txn.apply_update(update).expect("applicable update");
	}
	let txn = doc.transact();
	text.get_string(&txn)
}

/// State vector of a peer that has applied exactly `blobs`.
pub fn vector_after(blobs: &[Vec<u8>]) -> Vec<u8> {
	let doc = Doc::new();
	for blob in blobs {
		let update = Update::decode_v1(blob).expect("decodable update");
		let mut txn = doc.transact_mut();
		txn.apply_update(update).expect("applicable update");
	}
	let txn = doc.transact();
	txn.state_vector().encode_v1()
}

// vim: ts=4
