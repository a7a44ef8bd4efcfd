//! Versioned collection schema.
//!
//! An explicit descriptor of the collection's field shape: a sum type over
//! field kinds plus per-field records, with the full shape history so two
//! versions can be structurally diffed. The migration engine turns a diff
//! into SQL against the local cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
	String,
	Number,
	Boolean,
	Null,
	Array,
	Object,
	Prose,
}

impl FieldKind {
	/// SQLite column type for the materialized cache table.
	pub fn sql_type(self) -> &'static str {
		match self {
			FieldKind::String | FieldKind::Null => "TEXT",
			FieldKind::Number => "REAL",
			FieldKind::Boolean => "INTEGER",
			// Arrays and objects are stored JSON-encoded
			FieldKind::Array | FieldKind::Object => "TEXT",
			FieldKind::Prose => "BLOB",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
	pub name: Box<str>,
	pub kind: FieldKind,
	pub optional: bool,
	pub default_value: Option<Value>,
}

impl FieldDescriptor {
	pub fn new(name: impl Into<Box<str>>, kind: FieldKind) -> Self {
		Self { name: name.into(), kind, optional: false, default_value: None }
	}

	pub fn optional(mut self) -> Self {
		self.optional = true;
		self
	}

	pub fn with_default(mut self, value: Value) -> Self {
		self.default_value = Some(value);
		self
	}
}

/// One structural difference between two schema versions.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
	AddColumn { column: Box<str>, kind: FieldKind, default_value: Option<Value> },
	RemoveColumn { column: Box<str> },
	ChangeType { column: Box<str>, from: FieldKind, to: FieldKind },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedSchema {
	/// Collection id; doubles as the cache table name
	pub collection: Box<str>,
	pub version: u32,
	pub fields: Vec<FieldDescriptor>,
	/// Shape of every past version, keyed by version number
	pub history: BTreeMap<u32, Vec<FieldDescriptor>>,
}

impl VersionedSchema {
	pub fn new(collection: impl Into<Box<str>>, version: u32, fields: Vec<FieldDescriptor>) -> Self {
		let mut history = BTreeMap::new();
		history.insert(version, fields.clone());
		Self { collection: collection.into(), version, fields, history }
	}

	pub fn with_history(mut self, version: u32, fields: Vec<FieldDescriptor>) -> Self {
		self.history.insert(version, fields);
		self
	}

	pub fn shape(&self, version: u32) -> Option<&[FieldDescriptor]> {
		self.history.get(&version).map(Vec::as_slice)
	}

	pub fn field_names(&self) -> Vec<Box<str>> {
		self.fields.iter().map(|f| f.name.clone()).collect()
	}

	pub fn prose_fields(&self) -> HashSet<Box<str>> {
		self.fields
			.iter()
			.filter(|f| f.kind == FieldKind::Prose)
			.map(|f| f.name.clone())
			.collect()
	}

	/// Structural diff between two shapes: additions, removals, and type
	/// changes, in that order.
	pub fn diff(from: &[FieldDescriptor], to: &[FieldDescriptor]) -> Vec<SchemaChange> {
		let mut changes = Vec::new();
		for field in to {
			match from.iter().find(|f| f.name == field.name) {
				None => changes.push(SchemaChange::AddColumn {
					column: field.name.clone(),
					kind: field.kind,
					default_value: field.default_value.clone(),
				}),
				Some(old) if old.kind != field.kind => changes.push(SchemaChange::ChangeType {
					column: field.name.clone(),
					from: old.kind,
					to: field.kind,
				}),
				Some(_) => {}
			}
		}
		for field in from {
			if !to.iter().any(|f| f.name == field.name) {
				changes.push(SchemaChange::RemoveColumn { column: field.name.clone() });
			}
		}
		changes
	}
}


// vim: ts=4
