//! Wire names shared by the pipelines and the remote client

/// Bounds long server-side operations (value in seconds)
pub const TX_TIMEOUT_HEADER: &str = "Nuxeo-Transaction-Timeout";

/// Keep the batch after its first use so a failed link can be retried
pub const BATCH_NO_DROP_HEADER: &str = "X-Batch-No-Drop";

/// Request UID marker for idempotent operations
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Telemetry passthrough headers
pub const METRIC_REQUEST_HEADER: &str = "NX-metric-drive-request";
pub const METRIC_GLOBAL_HEADER: &str = "NX-metric-drive-global";

/// Digest value of blobs that are not stored in the binary store
pub const UNACCESSIBLE_HASH: &str = "notInBinaryStore";

/// Upload handler requested for the object-store provider
pub const S3_HANDLER: &str = "s3";

/// Provider tag of the in-repository upload handler
pub const DEFAULT_PROVIDER: &str = "default";

/// Operations that accept a request UID
pub const IDEMPOTENT_COMMANDS: &[&str] = &["FileManager.Import", "NuxeoDrive.CreateFile"];

/// Direct-Edit metadata names
pub const DOC_UID_META: &str = "ndrive";
pub const SERVER_URL_META: &str = "nxdirectedit";
pub const USER_META: &str = "nxdirectedituser";
pub const XPATH_META: &str = "nxdirecteditxpath";
pub const DIGEST_META: &str = "nxdirecteditdigest";
pub const DIGEST_ALGO_META: &str = "nxdirecteditdigestalgorithm";
pub const LOCK_META: &str = "nxdirecteditlock";
pub const FILENAME_META: &str = "nxdirecteditname";

/// Suffix of the staging folder holding in-flight Direct-Edit downloads
pub const DOWNLOAD_FOLDER_SUFFIX: &str = ".dl";

/// Suffix of temporary download files
pub const DOWNLOAD_TMP_SUFFIX: &str = ".nxpart";

// vim: ts=4
