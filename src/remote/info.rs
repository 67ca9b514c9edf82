//! Remote descriptors
//!
//! Value objects built from the JSON the repository returns. Construction
//! fails with [`RemoteError::MissingField`] naming the first mandatory
//! attribute that is absent.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::constants::UNACCESSIBLE_HASH;
use crate::error::RemoteError;
use crate::integrity::DigestAlgorithm;
use crate::remote::RemoteResult;

fn field<'a>(value: &'a Value, name: &str) -> RemoteResult<&'a Value> {
	match value.get(name) {
		Some(v) => Ok(v),
		None => Err(RemoteError::MissingField { field: name.to_string() }),
	}
}

fn str_field(value: &Value, name: &str) -> RemoteResult<String> {
	let v = field(value, name)?;
	match v {
		Value::String(s) => Ok(s.clone()),
		Value::Null => Err(RemoteError::MissingField { field: name.to_string() }),
		other => Ok(other.to_string()),
	}
}

fn bool_field(value: &Value, name: &str) -> RemoteResult<bool> {
	Ok(field(value, name)?.as_bool().unwrap_or(false))
}

fn opt_str(value: &Value, name: &str) -> Option<String> {
	value.get(name).and_then(Value::as_str).map(str::to_string)
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
	Utc.timestamp_millis_opt(millis).single()
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
	match value {
		Value::Number(n) => n.as_i64().and_then(from_millis),
		Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc)),
		_ => None,
	}
}

/// Normalize "SHA-256" style names to "sha256"
fn normalize_algorithm(name: &str) -> String {
	name.to_lowercase().replace('-', "")
}

/// File system item as exposed by the Drive API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteFileInfo {
	pub uid: String,
	pub parent_uid: String,
	pub name: String,
	pub path: String,
	pub folderish: bool,
	pub last_modification_time: Option<DateTime<Utc>>,
	pub creation_time: Option<DateTime<Utc>>,
	pub last_contributor: Option<String>,
	pub digest: Option<String>,
	pub digest_algorithm: Option<String>,
	pub download_url: Option<String>,
	pub can_rename: bool,
	pub can_delete: bool,
	pub can_update: bool,
	pub can_create_child: bool,
	pub can_scroll_descendants: bool,
	pub lock_owner: Option<String>,
	pub lock_created: Option<DateTime<Utc>>,
}

impl RemoteFileInfo {
	pub fn from_value(item: &Value) -> RemoteResult<Self> {
		let folderish = bool_field(item, "folder")?;
		let last_modification_time = parse_date(field(item, "lastModificationDate")?);
		let (digest, digest_algorithm, download_url, can_update, can_create_child, can_scroll) =
			if folderish {
				let can_create_child = bool_field(item, "canCreateChild")?;
				let can_scroll =
					item.get("canScrollDescendants").and_then(Value::as_bool).unwrap_or(false);
				(None, None, None, false, can_create_child, can_scroll)
			} else {
				let digest = field(item, "digest")?.as_str().map(str::to_string);
				let algorithm =
					field(item, "digestAlgorithm")?.as_str().map(normalize_algorithm);
				let url = field(item, "downloadURL")?.as_str().map(str::to_string);
				let can_update = bool_field(item, "canUpdate")?;
				(digest, algorithm, url, can_update, false, false)
			};

		let lock_info = item.get("lockInfo").filter(|v| !v.is_null());
		let lock_owner = lock_info.and_then(|l| opt_str(l, "owner"));
		let lock_created = lock_info.and_then(|l| l.get("created")).and_then(parse_date);

		Ok(RemoteFileInfo {
			uid: str_field(item, "id")?,
			parent_uid: str_field(item, "parentId")?,
			name: str_field(item, "name")?,
			path: opt_str(item, "path").unwrap_or_default(),
			folderish,
			last_modification_time,
			creation_time: item.get("creationDate").and_then(parse_date),
			last_contributor: opt_str(item, "lastContributor"),
			digest,
			digest_algorithm,
			download_url,
			can_rename: bool_field(item, "canRename")?,
			can_delete: bool_field(item, "canDelete")?,
			can_update,
			can_create_child,
			can_scroll_descendants: can_scroll,
			lock_owner,
			lock_created,
		})
	}

	/// The server cannot hand out the content of this item
	pub fn is_unaccessible(&self) -> bool {
		self.digest.as_deref() == Some(UNACCESSIBLE_HASH)
	}
}

/// A blob inside a document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlobInfo {
	pub name: String,
	pub digest: Option<String>,
	pub digest_algorithm: Option<String>,
	pub size: u64,
	pub mimetype: Option<String>,
	/// Download URL, absent for inlined note contents
	pub data: Option<String>,
}

impl BlobInfo {
	fn from_value(blob: &Value) -> Option<Self> {
		let obj = blob.as_object()?;
		let size = match obj.get("length") {
			Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
			Some(Value::String(s)) => s.parse().unwrap_or(0),
			_ => 0,
		};
		Some(BlobInfo {
			name: obj.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
			digest: obj.get("digest").and_then(Value::as_str).map(str::to_string),
			digest_algorithm: obj
				.get("digestAlgorithm")
				.and_then(Value::as_str)
				.map(normalize_algorithm),
			size,
			mimetype: obj.get("mime-type").and_then(Value::as_str).map(str::to_string),
			data: obj.get("data").and_then(Value::as_str).map(str::to_string),
		})
	}
}

/// A document as returned by the REST API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NuxeoDocumentInfo {
	pub uid: String,
	pub parent_uid: Option<String>,
	pub path: String,
	pub name: String,
	pub doc_type: String,
	pub folderish: bool,
	pub is_version: bool,
	pub is_proxy: bool,
	pub is_trashed: bool,
	pub version: Option<String>,
	pub last_modified: Option<DateTime<Utc>>,
	pub lock_owner: Option<String>,
	pub lock_created: Option<DateTime<Utc>>,
	pub permissions: Vec<String>,
	pub properties: Map<String, Value>,
}

impl NuxeoDocumentInfo {
	pub fn from_value(doc: &Value) -> RemoteResult<Self> {
		let properties = match field(doc, "properties")? {
			Value::Object(map) => map.clone(),
			_ => return Err(RemoteError::MissingField { field: "properties".to_string() }),
		};
		let name = properties
			.get("dc:title")
			.and_then(Value::as_str)
			.map(str::to_string)
			.or_else(|| opt_str(doc, "title"))
			.unwrap_or_default();
		let folderish = doc
			.get("facets")
			.and_then(Value::as_array)
			.map_or(false, |facets| facets.iter().any(|f| f == "Folderish"));
		let version = match (properties.get("uid:major_version"), properties.get("uid:minor_version")) {
			(Some(major), Some(minor)) if !major.is_null() && !minor.is_null() => {
				Some(format!("{}.{}", major, minor))
			}
			_ => None,
		};
		let permissions = doc
			.get("contextParameters")
			.and_then(|c| c.get("permissions"))
			.and_then(Value::as_array)
			.map(|perms| perms.iter().filter_map(Value::as_str).map(str::to_string).collect())
			.unwrap_or_default();
		let is_trashed = doc.get("isTrashed").and_then(Value::as_bool).unwrap_or(false)
			|| doc.get("state").and_then(Value::as_str) == Some("deleted");

		Ok(NuxeoDocumentInfo {
			uid: str_field(doc, "uid")?,
			parent_uid: opt_str(doc, "parentRef"),
			path: str_field(doc, "path")?,
			name,
			doc_type: str_field(doc, "type")?,
			folderish,
			is_version: doc.get("isVersion").and_then(Value::as_bool).unwrap_or(false),
			is_proxy: doc.get("isProxy").and_then(Value::as_bool).unwrap_or(false),
			is_trashed,
			version,
			last_modified: doc.get("lastModified").and_then(parse_date),
			lock_owner: opt_str(doc, "lockOwner"),
			lock_created: doc.get("lockCreated").and_then(parse_date),
			permissions,
			properties,
		})
	}

	pub fn note_text(&self) -> Option<&str> {
		self.properties.get("note:note").and_then(Value::as_str)
	}

	/// Resolve the blob at `xpath`
	///
	/// `note:note` yields a synthetic blob whose digest is the md5 of the
	/// note text. List xpaths such as `files:files/0/file` walk into arrays.
	pub fn get_blob(&self, xpath: &str) -> Option<BlobInfo> {
		if xpath == "note:note" {
			return self.note_blob();
		}
		let mut parts = xpath.split('/');
		let mut current = self.properties.get(parts.next()?)?;
		for part in parts {
			current = match part.parse::<usize>() {
				Ok(idx) => current.get(idx)?,
				Err(_) => current.get(part)?,
			};
		}
		BlobInfo::from_value(current)
	}

	fn note_blob(&self) -> Option<BlobInfo> {
		let text = self.note_text()?;
		let mimetype = self
			.properties
			.get("note:mime_type")
			.and_then(Value::as_str)
			.unwrap_or("text/plain")
			.to_string();
		let ext = match mimetype.as_str() {
			"text/html" => ".html",
			"text/xml" => ".xml",
			"text/x-web-markdown" => ".md",
			_ => ".txt",
		};
		let name = if self.name.ends_with(ext) { self.name.clone() } else { format!("{}{}", self.name, ext) };
		let mut hasher = DigestAlgorithm::Md5.hasher();
		hasher.update(text.as_bytes());
		Some(BlobInfo {
			name,
			digest: Some(hasher.finalize_hex()),
			digest_algorithm: Some("md5".to_string()),
			size: text.len() as u64,
			mimetype: Some(mimetype),
			data: None,
		})
	}
}

/// Result of `NuxeoDrive.GetChangeSummary`
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSummary {
	pub has_too_many_changes: bool,
	pub sync_date: Option<i64>,
	pub upper_bound: Option<i64>,
	pub active_roots: String,
	pub changes: Vec<Value>,
}

impl ChangeSummary {
	pub fn from_value(summary: &Value) -> RemoteResult<Self> {
		Ok(ChangeSummary {
			has_too_many_changes: bool_field(summary, "hasTooManyChanges")?,
			sync_date: summary.get("syncDate").and_then(Value::as_i64),
			upper_bound: summary.get("upperBound").and_then(Value::as_i64),
			active_roots: opt_str(summary, "activeSynchronizationRootDefinitions")
				.unwrap_or_default(),
			changes: summary
				.get("fileSystemChanges")
				.and_then(Value::as_array)
				.cloned()
				.unwrap_or_default(),
		})
	}

	/// Incremental changes cannot be trusted, rescan everything
	pub fn needs_full_rescan(&self) -> bool {
		self.has_too_many_changes
	}
}


// vim: ts=4
