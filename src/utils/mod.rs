//! Small filesystem and URL helpers shared by the pipelines

pub mod lock;

pub use lock::PathLock;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::io;
use std::path::Path;
use url::Url;

use crate::constants::DOWNLOAD_TMP_SUFFIX;

/// Characters escaped in download URL paths (everything but `/` and `:`)
const URL_PATH: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'%')
	.add(b'<')
	.add(b'>')
	.add(b'?')
	.add(b'[')
	.add(b']')
	.add(b'\\')
	.add(b'^')
	.add(b'`')
	.add(b'{')
	.add(b'|')
	.add(b'}');

/// Replace characters forbidden in file names by `-`
pub fn safe_filename(name: &str) -> String {
	name.chars()
		.map(|c| match c {
			'/' | '\\' | '*' | ':' | '|' | '"' | '<' | '>' | '?' => '-',
			c => c,
		})
		.collect()
}

/// Drop default ports and trailing slashes so equivalent server URLs compare equal
pub fn simplify_url(raw: &str) -> String {
	// Parsing normalizes the scheme's default port away
	match Url::parse(raw) {
		Ok(url) => url.to_string().trim_end_matches('/').to_string(),
		Err(_) => raw.trim_end_matches('/').to_string(),
	}
}

/// Percent-encode a URL path, keeping `/` and `:`
pub fn quote_url(path: &str) -> String {
	utf8_percent_encode(path, URL_PATH).to_string()
}

/// Rename `src` onto `dst`, replacing an existing file
pub fn safe_rename(src: &Path, dst: &Path) -> io::Result<()> {
	match std::fs::rename(src, dst) {
		Ok(()) => Ok(()),
		Err(e) if dst.is_file() => {
			// Some platforms refuse to replace; retry once without the target
			std::fs::remove_file(dst)?;
			std::fs::rename(src, dst).map_err(|_| e)
		}
		Err(e) => Err(e),
	}
}

/// Office lock files: `~$name.docx` (MS Office), `.~lock.name.odt#` (LibreOffice)
pub fn is_lock_file(name: &str) -> bool {
	name.starts_with("~$") || name.starts_with(".~lock.")
}

/// The real document name behind an office lock file
pub fn lock_file_target(name: &str) -> Option<String> {
	if let Some(rest) = name.strip_prefix(".~lock.") {
		return Some(rest.trim_end_matches('#').to_string());
	}
	// MS Office keeps the last characters of the name only
	name.strip_prefix("~$").map(str::to_string)
}

/// Temporary download file of the pipelines
pub fn is_temp_file(name: &str) -> bool {
	name.ends_with(DOWNLOAD_TMP_SUFFIX)
}

/// Guess a MIME type from a file extension
pub fn guess_mime_type(name: &str) -> &'static str {
	let ext = match name.rsplit_once('.') {
		Some((_, ext)) => ext.to_ascii_lowercase(),
		None => return "application/octet-stream",
	};
	match ext.as_str() {
		"txt" | "log" => "text/plain",
		"html" | "htm" => "text/html",
		"css" => "text/css",
		"csv" => "text/csv",
		"xml" => "text/xml",
		"md" => "text/markdown",
		"json" => "application/json",
		"pdf" => "application/pdf",
		"zip" => "application/zip",
		"doc" => "application/msword",
		"docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
		"xls" => "application/vnd.ms-excel",
		"xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
		"ppt" => "application/vnd.ms-powerpoint",
		"pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
		"odt" => "application/vnd.oasis.opendocument.text",
		"ods" => "application/vnd.oasis.opendocument.spreadsheet",
		"odp" => "application/vnd.oasis.opendocument.presentation",
		"png" => "image/png",
		"jpg" | "jpeg" => "image/jpeg",
		"gif" => "image/gif",
		"svg" => "image/svg+xml",
		"mp3" => "audio/mpeg",
		"mp4" => "video/mp4",
		_ => "application/octet-stream",
	}
}

/// Extension commonly used for a MIME type, with its leading dot
pub fn extension_for_mime_type(mime_type: &str) -> &'static str {
	match mime_type {
		"text/html" => ".html",
		"text/xml" => ".xml",
		"text/markdown" => ".md",
		"application/json" => ".json",
		_ => ".txt",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_safe_filename() {
		assert_eq!(safe_filename("a/b\\c*d:e|f\"g<h>i?j"), "a-b-c-d-e-f-g-h-i-j");
		assert_eq!(safe_filename("file:content"), "file-content");
		assert_eq!(safe_filename("plain.txt"), "plain.txt");
	}

	#[test]
	fn test_simplify_url() {
		assert_eq!(simplify_url("https://srv:443/nuxeo/"), "https://srv/nuxeo");
		assert_eq!(simplify_url("http://srv:80/nuxeo"), "http://srv/nuxeo");
		assert_eq!(simplify_url("http://srv:8080/nuxeo/"), "http://srv:8080/nuxeo");
		assert_eq!(simplify_url("not a url/"), "not a url");
	}

	#[test]
	fn test_quote_url() {
		assert_eq!(quote_url("nxfile/default/a b/file:content/é.txt"), "nxfile/default/a%20b/file:content/%C3%A9.txt");
	}

	#[test]
	fn test_lock_files() {
		assert!(is_lock_file("~$report.docx"));
		assert!(is_lock_file(".~lock.report.odt#"));
		assert!(!is_lock_file("report.docx"));
		assert_eq!(lock_file_target(".~lock.report.odt#").as_deref(), Some("report.odt"));
		assert!(is_temp_file("abc.nxpart"));
	}

	#[test]
	fn test_guess_mime_type() {
		assert_eq!(guess_mime_type("a.PDF"), "application/pdf");
		assert_eq!(guess_mime_type("noext"), "application/octet-stream");
		assert_eq!(extension_for_mime_type("text/html"), ".html");
	}

	#[test]
	fn test_safe_rename_replaces() {
		let dir = TempDir::new().unwrap();
		let src = dir.path().join("a");
		let dst = dir.path().join("b");
		std::fs::write(&src, b"new").unwrap();
		std::fs::write(&dst, b"old").unwrap();
		safe_rename(&src, &dst).unwrap();
		assert_eq!(std::fs::read(&dst).unwrap(), b"new");
		assert!(!src.exists());
	}
}

// vim: ts=4
