/// Shared constants for the volback daemon, runner and client

/// Address of the control server.
///
/// NOTE: Not "localhost", that would resolve to IPv6 on some hosts.
pub const CONTROL_ADDR: &str = "127.0.0.1:6000";

/// Entrypoint signature of our own image, used by the healthcheck to
/// recognize control and runner containers among everything else.
pub const ENTRYPOINT_SIGNATURE: [&str; 3] = ["/sbin/tini", "--", "/usr/local/bin/volback"];

/// Command word of the control role, as seen in a container's Cmd.
pub const CONTROL_COMMAND: &str = "control";

/// Runner entry-point command words.
pub const BACKUP_STAGE2_COMMAND: &str = "backup-stage2";
pub const RESTORE_STAGE2_COMMAND: &str = "restore-stage2";

/// Every volume handed to the runner is mounted below this directory.
pub const SOURCE_MOUNT_PREFIX: &str = "/source";

/// Local metadata/backup target directory (also the default engine target).
pub const DEFAULT_TARGET_DIR: &str = "/target";

/// Suffix of metadata keys/files in the metadata store.
pub const METADATA_SUFFIX: &str = ".metadata";

/// Per-volume retention override labels.
pub const LABEL_REMOVE_OLDER_THAN: &str = "volback.remove_older_than";
pub const LABEL_REMOVE_ALL_BUT_N_FULL: &str = "volback.remove_all_but_n_full";
pub const LABEL_REMOVE_ALL_INC_OF_BUT_N_FULL: &str = "volback.remove_all_inc_of_but_n_full";

/// Literal line the healthcheck client scans for in the streamed logs.
pub const HEALTHCHECK_PASS_MARKER: &str = "Healthcheck passed";

/// Volumes whose name matches this pattern are never backed up unless
/// the operator overrides IGNORE_REGEX. Skips scratch volumes and the
/// anonymous 64-hex-digit volumes Docker creates on its own.
pub const DEFAULT_IGNORE_REGEX: &str = "^(.*(tmp|cache).*)|[0-9a-f]{64}$";

/// A runner container older than this is reported as a stuck operation.
pub const RUNNER_STALENESS_HOURS: i64 = 3;

/// Restore only selects volumes whose last backup is within this window
/// of the most recent backup across all volumes.
pub const RESTORE_WINDOW_HOURS: i64 = 6;
