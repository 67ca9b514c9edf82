//! Download Pipeline Tests
//!
//! Streams bodies from the in-memory repository and checks:
//! - digest verification and publication
//! - resuming from a temporary file left by a previous attempt
//! - pausing between buffers

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use nxtransfer::remote::RemoteRepository;
use nxtransfer::{
	ActionSnapshot, DownloadRequest, Downloader, Nature, Options, TransferError, TransferStatus,
};

const URL: &str = "https://srv/nuxeo/nxfile/default/0ab1/file:content/a.bin";

fn downloader(fx: &Fixture, remote: &Arc<MockRemote>) -> Downloader {
	Downloader::new(
		Arc::clone(remote) as Arc<dyn RemoteRepository>,
		Arc::clone(&fx.store),
		Arc::clone(&fx.actions),
		Arc::clone(&fx.options),
	)
}

fn request(fx: &Fixture, digest: &str) -> DownloadRequest {
	DownloadRequest::new(
		URL,
		&fx.path().join("a.bin"),
		&fx.path().join(".a.bin.nxpart"),
		digest,
	)
}

/// Small buffers and no in-memory downloads so checkpoints happen often
fn streaming_options() -> Options {
	Options { tmp_file_limit: 0, file_buffer_size: 64 * 1024, ..Options::default() }
}

// ===================================================================
// VERIFIED DOWNLOADS
// ===================================================================

#[tokio::test]
async fn test_empty_file_download() {
	let fx = Fixture::new(Options::default());
	let remote = Arc::new(MockRemote::new("alice"));
	remote.add_body(URL, b"");
	let req = request(&fx, "d41d8cd98f00b204e9800998ecf8427e");
	let downloader = downloader(&fx, &remote);

	let tmp = downloader.download(&req, None).await.unwrap();
	assert_eq!(tmp, req.file_out);
	let row = fx.store.get_download(&req.file_path).unwrap().unwrap();
	assert_eq!(row.status, TransferStatus::Done);

	downloader.publish(&req).unwrap();
	assert_eq!(std::fs::read(&req.file_path).unwrap(), b"");
	assert!(!req.file_out.exists());
	assert!(fx.store.get_download(&req.file_path).unwrap().is_none());
}

#[tokio::test]
async fn test_corrupted_download_is_rejected() {
	let fx = Fixture::new(Options::default());
	let remote = Arc::new(MockRemote::new("alice"));
	remote.add_body(URL, b"tampered");
	let req = request(&fx, &md5_hex(b"original"));

	let result = downloader(&fx, &remote).download(&req, None).await;
	match result {
		Err(TransferError::CorruptedFile { expected, computed, .. }) => {
			assert_eq!(expected, md5_hex(b"original"));
			assert_eq!(computed, md5_hex(b"tampered"));
		}
		other => panic!("expected a corrupted file, got {:?}", other),
	}
	let row = fx.store.get_download(&req.file_path).unwrap().unwrap();
	assert_ne!(row.status, TransferStatus::Done);
}

#[tokio::test]
async fn test_sha256_digest() {
	let fx = Fixture::new(streaming_options());
	let remote = Arc::new(MockRemote::new("alice"));
	let data = content(300 * 1024);
	remote.add_body(URL, &data);
	let mut hasher = nxtransfer::DigestAlgorithm::Sha256.hasher();
	hasher.update(&data);
	let req = request(&fx, &hasher.finalize_hex()).algorithm("SHA-256");

	let downloader = downloader(&fx, &remote);
	downloader.download(&req, None).await.unwrap();
	downloader.publish(&req).unwrap();
	assert_eq!(std::fs::read(&req.file_path).unwrap(), data);
}

#[tokio::test]
async fn test_unknown_remote_digest_is_accepted() {
	let fx = Fixture::new(Options::default());
	let remote = Arc::new(MockRemote::new("alice"));
	remote.add_body(URL, b"whatever");
	let req = request(&fx, "not-a-digest");

	downloader(&fx, &remote).download(&req, None).await.unwrap();
	assert_eq!(std::fs::read(&req.file_out).unwrap(), b"whatever");
}

// ===================================================================
// RESUME
// ===================================================================

#[tokio::test]
async fn test_resume_from_partial_file() {
	let fx = Fixture::new(streaming_options());
	let remote = Arc::new(MockRemote::new("alice"));
	let data = content(512 * 1024);
	remote.add_body(URL, &data);
	let req = request(&fx, &md5_hex(&data));
	std::fs::write(&req.file_out, &data[..200 * 1024]).unwrap();

	let downloader = downloader(&fx, &remote);
	downloader.download(&req, None).await.unwrap();
	downloader.publish(&req).unwrap();
	assert_eq!(std::fs::read(&req.file_path).unwrap(), data);
}

#[tokio::test]
async fn test_resume_with_complete_temporary_file() {
	let fx = Fixture::new(streaming_options());
	let remote = Arc::new(MockRemote::new("alice"));
	let data = content(256 * 1024);
	remote.add_body(URL, &data);
	let req = request(&fx, &md5_hex(&data));
	std::fs::write(&req.file_out, &data).unwrap();

	// Nothing left past the offset: the body is empty
	let downloader = downloader(&fx, &remote);
	downloader.download(&req, None).await.unwrap();
	assert_eq!(std::fs::read(&req.file_out).unwrap(), data);
	let row = fx.store.get_download(&req.file_path).unwrap().unwrap();
	assert_eq!(row.status, TransferStatus::Done);

	downloader.publish(&req).unwrap();
	assert_eq!(std::fs::read(&req.file_path).unwrap(), data);
}

#[tokio::test]
async fn test_concurrent_downloads_of_one_file() {
	let fx = Fixture::new(streaming_options());
	let remote = Arc::new(MockRemote::new("alice"));
	let data = content(300 * 1024);
	remote.add_body(URL, &data);
	let req = request(&fx, &md5_hex(&data));
	let downloader = downloader(&fx, &remote);

	// Both tasks share the test's single runtime thread
	let (first, second) = tokio::time::timeout(Duration::from_secs(10), async {
		tokio::join!(downloader.download(&req, None), downloader.download(&req, None))
	})
	.await
	.expect("the second download waits for the first one instead of hanging");
	assert_eq!(first.unwrap(), req.file_out);
	assert_eq!(second.unwrap(), req.file_out);

	assert_eq!(std::fs::read(&req.file_out).unwrap(), data);
	let row = fx.store.get_download(&req.file_path).unwrap().unwrap();
	assert_eq!(row.status, TransferStatus::Done);
}

#[tokio::test]
async fn test_range_ignored_restarts_from_scratch() {
	let fx = Fixture::new(streaming_options());
	let remote = Arc::new(MockRemote::new("alice"));
	let data = content(256 * 1024);
	remote.add_body(URL, &data);
	remote.state().ignore_ranges = true;
	let req = request(&fx, &md5_hex(&data));
	std::fs::write(&req.file_out, b"stale bytes from another version").unwrap();

	downloader(&fx, &remote).download(&req, None).await.unwrap();
	assert_eq!(std::fs::read(&req.file_out).unwrap(), data);
}

#[tokio::test]
async fn test_pause_and_resume_download() {
	let fx = Fixture::new(streaming_options());
	let remote = Arc::new(MockRemote::new("alice"));
	let data = content(640 * 1024);
	remote.add_body(URL, &data);
	let req = request(&fx, &md5_hex(&data));
	let downloader = downloader(&fx, &remote);

	let store = Arc::clone(&fx.store);
	let file_path = req.file_path.clone();
	let pause = move |snapshot: &ActionSnapshot| -> Result<(), TransferError> {
		if snapshot.transferred_chunks == 3 {
			let row = store.get_download(&file_path)?.unwrap();
			store.pause_transfer(Nature::Download, row.uid.unwrap(), row.progress, false);
		}
		Ok(())
	};
	let uid = match downloader.download(&req, Some(&pause)).await {
		Err(TransferError::DownloadPaused(uid)) => uid,
		other => panic!("expected a paused download, got {:?}", other),
	};

	// Paused at the next checkpoint after the third buffer
	let row = fx.store.get_download_by_uid(uid).unwrap().unwrap();
	assert_eq!(row.status, TransferStatus::Paused);
	assert_eq!(row.filesize, data.len() as u64);
	let partial = std::fs::metadata(&req.file_out).unwrap().len();
	assert_eq!(partial, 4 * 64 * 1024);
	assert!((row.progress - 40.0).abs() < 0.01, "progress: {}", row.progress);

	fx.store.resume_transfer(Nature::Download, uid, false);
	let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
	let seen = Arc::clone(&progress);
	let record = move |snapshot: &ActionSnapshot| -> Result<(), TransferError> {
		seen.lock().unwrap().push(snapshot.progress);
		Ok(())
	};
	downloader.download(&req, Some(&record)).await.unwrap();
	assert_eq!(std::fs::read(&req.file_out).unwrap(), data);

	// Progress starts from the bytes already on disk
	let progress = progress.lock().unwrap();
	assert_eq!(progress.first().copied(), Some((5 * 64 * 1024) as f64));
	assert_eq!(fx.store.get_download_by_uid(uid).unwrap().unwrap().status, TransferStatus::Done);
}

#[tokio::test]
async fn test_missing_body_is_not_found() {
	let fx = Fixture::new(Options::default());
	let remote = Arc::new(MockRemote::new("alice"));
	let req = request(&fx, "d41d8cd98f00b204e9800998ecf8427e");

	let result = downloader(&fx, &remote).download(&req, None).await;
	assert!(matches!(result, Err(TransferError::NotFound { .. })), "{:?}", result);
	assert!(fx.store.get_download(&req.file_path).unwrap().is_none());
}

// vim: ts=4
