// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Directory-backed durable queue of crash reports.
//!
//! Layout under the storage root:
//!
//! ```text
//! reports/<seq>-<report id>.json   one record per entry
//! reports/<...>.json.corrupt       quarantined records
//! delivered.json                   ledger of recently delivered report ids
//! ```
//!
//! Every record is `{format_version, checksum, entry}` where `checksum` is the
//! SHA-256 of the exact bytes of `entry`. Records are written to a temp file,
//! fsynced and renamed into place, so a reader never observes a partial write.
//!
//! The fault path only appends new files and the uploader only rewrites or
//! removes existing ones; neither takes a lock on the other.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use loom_crash_core::{CrashReport, DeliveryState, QueueEntry, QueueError, ReportId};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub const RECORD_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_MAX_ENTRIES: usize = 20;
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024;

const REPORTS_DIR: &str = "reports";
const LEDGER_FILE: &str = "delivered.json";
const LEDGER_CAPACITY: usize = 256;
const RECORD_EXT: &str = "json";
const CORRUPT_SUFFIX: &str = ".corrupt";

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
	pub max_entries: usize,
	/// Budget for the sum of all record sizes.
	pub max_bytes: u64,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_entries: DEFAULT_MAX_ENTRIES,
			max_bytes: DEFAULT_MAX_BYTES,
		}
	}
}

#[derive(Serialize)]
struct RecordOut<'a> {
	format_version: u32,
	checksum: String,
	entry: &'a RawValue,
}

#[derive(Deserialize)]
struct RecordHeader {
	format_version: u32,
}

#[derive(Deserialize)]
struct RecordIn {
	checksum: String,
	entry: Box<RawValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeliveredLedger {
	ids: VecDeque<ReportId>,
}

impl DeliveredLedger {
	fn contains(&self, id: &ReportId) -> bool {
		self.ids.contains(id)
	}

	fn insert(&mut self, id: ReportId) {
		if self.contains(&id) {
			return;
		}
		self.ids.push_back(id);
		while self.ids.len() > LEDGER_CAPACITY {
			self.ids.pop_front();
		}
	}
}

/// A record on disk, as seen when making room for a new one.
struct StoredRecord {
	path: PathBuf,
	sequence: u64,
	size: u64,
	critical: bool,
}

pub struct DurableQueue {
	reports_dir: PathBuf,
	ledger_path: PathBuf,
	config: QueueConfig,
	next_sequence: AtomicU64,
	ledger: Mutex<DeliveredLedger>,
}

impl DurableQueue {
	/// Open (creating if needed) the queue under `root`.
	pub fn open(root: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
		let root = root.as_ref();
		let reports_dir = root.join(REPORTS_DIR);
		fs::create_dir_all(&reports_dir)?;

		let mut max_sequence = None;
		for dir_entry in fs::read_dir(&reports_dir)? {
			let path = dir_entry?.path();
			let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
				continue;
			};
			if name.starts_with('.') && name.ends_with(".tmp") {
				// Left behind by a write that never reached its rename.
				debug!(path = %path.display(), "removing stale temp file");
				let _ = fs::remove_file(&path);
				continue;
			}
			if let Some(sequence) = parse_sequence(name) {
				max_sequence = max_sequence.max(Some(sequence));
			}
		}

		let ledger_path = root.join(LEDGER_FILE);
		let ledger = match fs::read(&ledger_path) {
			Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
				warn!(path = %ledger_path.display(), error = %e, "delivered ledger unreadable, starting empty");
				DeliveredLedger::default()
			}),
			Err(e) if e.kind() == ErrorKind::NotFound => DeliveredLedger::default(),
			Err(e) => return Err(e.into()),
		};

		debug!(dir = %reports_dir.display(), next_sequence = max_sequence.map_or(0, |s| s + 1), "durable queue opened");

		Ok(Self {
			reports_dir,
			ledger_path,
			config,
			next_sequence: AtomicU64::new(max_sequence.map_or(0, |s| s + 1)),
			ledger: Mutex::new(ledger),
		})
	}

	pub fn reports_dir(&self) -> &Path {
		&self.reports_dir
	}

	pub fn config(&self) -> &QueueConfig {
		&self.config
	}

	/// Durably store a new report as a pending entry.
	///
	/// Makes room by evicting the oldest non-critical entries first, then the
	/// oldest critical ones. The entry being stored is never evicted.
	pub fn enqueue(&self, report: CrashReport) -> Result<()> {
		let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
		let entry = QueueEntry::new(sequence, report);
		let bytes = encode_record(&entry)?;
		let size = bytes.len() as u64;

		if size > self.config.max_bytes {
			warn!(
				report_id = %entry.id(),
				size,
				max_bytes = self.config.max_bytes,
				"report larger than queue budget, dropping"
			);
			return Err(QueueError::StorageFull {
				needed: size,
				budget: self.config.max_bytes,
			});
		}

		self.make_room(size)?;
		write_atomic(&self.entry_path(&entry), &bytes)?;

		info!(
			report_id = %entry.id(),
			sequence,
			critical = entry.is_critical(),
			"report queued"
		);
		Ok(())
	}

	/// All deliverable entries, oldest first.
	///
	/// Corrupt records are quarantined and skipped, records of a newer format
	/// are left in place and skipped. Entries left in flight by a process that
	/// died mid-upload come back as pending.
	pub fn drain(&self) -> Result<Vec<QueueEntry>> {
		let mut entries = Vec::new();

		for path in self.record_paths()? {
			match read_record(&path) {
				Ok(mut entry) => {
					if entry.state.is_terminal() {
						// Completed but not yet removed when the process stopped.
						debug!(report_id = %entry.id(), state = %entry.state, "removing completed entry");
						remove_if_exists(&path)?;
						continue;
					}
					if entry.state == DeliveryState::InFlight {
						entry.state = DeliveryState::Pending;
					}
					entries.push(entry);
				}
				Err(QueueError::Io(e)) if e.kind() == ErrorKind::NotFound => continue,
				Err(err @ QueueError::CorruptEntry { .. }) => {
					warn!(error = %err, "quarantining corrupt queue entry");
					self.quarantine(&path);
				}
				Err(err @ QueueError::UnsupportedVersion { .. }) => {
					warn!(path = %path.display(), error = %err, "skipping queue entry from newer SDK");
				}
				Err(err) => return Err(err),
			}
		}

		Ok(entries)
	}

	/// Number of records currently stored, including unreadable ones.
	pub fn pending_count(&self) -> Result<usize> {
		Ok(self.record_paths()?.len())
	}

	pub fn mark_in_flight(&self, entry: &mut QueueEntry) -> Result<()> {
		entry.state = DeliveryState::InFlight;
		entry.last_attempt_at = Some(Utc::now());
		self.rewrite(entry)
	}

	/// Count a failed delivery and put the entry back to pending.
	pub fn record_failed_attempt(&self, entry: &mut QueueEntry, error: &str) -> Result<()> {
		entry.attempts += 1;
		entry.state = DeliveryState::Pending;
		entry.last_attempt_at = Some(Utc::now());
		entry.last_error = Some(error.to_string());
		self.rewrite(entry)
	}

	/// Move an entry to a terminal state and remove it from the queue.
	///
	/// Delivered ids are recorded in the ledger before the file is removed.
	pub fn complete(&self, entry: &mut QueueEntry, state: DeliveryState) -> Result<()> {
		entry.state = state;
		match state {
			DeliveryState::Delivered => {
				self.record_delivered(entry.id())?;
				debug!(report_id = %entry.id(), "entry delivered");
			}
			DeliveryState::FailedPermanent => {
				warn!(
					report_id = %entry.id(),
					attempts = entry.attempts,
					last_error = entry.last_error.as_deref().unwrap_or(""),
					"dropping undeliverable report"
				);
			}
			DeliveryState::Pending | DeliveryState::InFlight => return self.rewrite(entry),
		}
		remove_if_exists(&self.entry_path(entry))
	}

	/// Whether `id` was delivered recently (bounded history).
	pub fn is_delivered(&self, id: &ReportId) -> bool {
		self.ledger
			.lock()
			.map(|ledger| ledger.contains(id))
			.unwrap_or_else(|poisoned| poisoned.into_inner().contains(id))
	}

	fn record_delivered(&self, id: ReportId) -> Result<()> {
		let mut ledger = self
			.ledger
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		ledger.insert(id);
		let bytes = serde_json::to_vec(&*ledger)?;
		write_atomic(&self.ledger_path, &bytes)
	}

	/// Replace the stored record. An entry evicted by a concurrent enqueue
	/// stays evicted.
	fn rewrite(&self, entry: &QueueEntry) -> Result<()> {
		let path = self.entry_path(entry);
		replace_atomic(&path, &encode_record(entry)?)
			.map_err(|e| match e {
				QueueError::NotFound(_) => QueueError::NotFound(entry.id().to_string()),
				other => other,
			})
	}

	fn make_room(&self, incoming: u64) -> Result<()> {
		let mut stored = self.stored_records()?;
		let mut total: u64 = stored.iter().map(|r| r.size).sum();

		while !stored.is_empty()
			&& (stored.len() + 1 > self.config.max_entries || total + incoming > self.config.max_bytes)
		{
			let victim = stored
				.iter()
				.position(|r| !r.critical)
				.unwrap_or(0);
			let record = stored.remove(victim);
			total = total.saturating_sub(record.size);

			warn!(
				path = %record.path.display(),
				sequence = record.sequence,
				critical = record.critical,
				"queue full, evicting oldest entry"
			);
			remove_if_exists(&record.path)?;
		}

		Ok(())
	}

	/// Records sorted by sequence. Unreadable records count as non-critical so
	/// they go first.
	fn stored_records(&self) -> Result<Vec<StoredRecord>> {
		let mut records = Vec::new();
		for path in self.record_paths()? {
			let size = match fs::metadata(&path) {
				Ok(meta) => meta.len(),
				Err(e) if e.kind() == ErrorKind::NotFound => continue,
				Err(e) => return Err(e.into()),
			};
			let sequence = path
				.file_name()
				.and_then(|n| n.to_str())
				.and_then(parse_sequence)
				.unwrap_or(0);
			let critical = read_record(&path).map(|e| e.is_critical()).unwrap_or(false);
			records.push(StoredRecord {
				path,
				sequence,
				size,
				critical,
			});
		}
		Ok(records)
	}

	fn record_paths(&self) -> Result<Vec<PathBuf>> {
		let mut paths: Vec<(u64, PathBuf)> = Vec::new();
		for dir_entry in fs::read_dir(&self.reports_dir)? {
			let path = dir_entry?.path();
			if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
				continue;
			}
			let Some(sequence) = path
				.file_name()
				.and_then(|n| n.to_str())
				.and_then(parse_sequence)
			else {
				continue;
			};
			paths.push((sequence, path));
		}
		paths.sort_by_key(|(sequence, _)| *sequence);
		Ok(paths.into_iter().map(|(_, path)| path).collect())
	}

	fn quarantine(&self, path: &Path) {
		let mut target = path.as_os_str().to_owned();
		target.push(CORRUPT_SUFFIX);
		if let Err(e) = fs::rename(path, &target) {
			warn!(path = %path.display(), error = %e, "failed to quarantine corrupt entry");
		}
	}

	fn entry_path(&self, entry: &QueueEntry) -> PathBuf {
		self.reports_dir.join(file_name(entry.sequence, &entry.id()))
	}
}

fn file_name(sequence: u64, id: &ReportId) -> String {
	format!("{sequence:020}-{id}.{RECORD_EXT}")
}

fn parse_sequence(name: &str) -> Option<u64> {
	name.split_once('-')?.0.parse().ok()
}

fn encode_record(entry: &QueueEntry) -> Result<Vec<u8>> {
	let raw = serde_json::value::to_raw_value(entry)?;
	let record = RecordOut {
		format_version: RECORD_FORMAT_VERSION,
		checksum: checksum(raw.get().as_bytes()),
		entry: &raw,
	};
	Ok(serde_json::to_vec(&record)?)
}

fn read_record(path: &Path) -> Result<QueueEntry> {
	let bytes = fs::read(path)?;
	decode_record(path, &bytes)
}

fn decode_record(path: &Path, bytes: &[u8]) -> Result<QueueEntry> {
	let corrupt = |reason: String| QueueError::CorruptEntry {
		path: path.to_path_buf(),
		reason,
	};

	let header: RecordHeader =
		serde_json::from_slice(bytes).map_err(|e| corrupt(format!("unreadable record: {e}")))?;
	if header.format_version > RECORD_FORMAT_VERSION {
		return Err(QueueError::UnsupportedVersion {
			found: header.format_version,
			supported: RECORD_FORMAT_VERSION,
		});
	}

	let record: RecordIn =
		serde_json::from_slice(bytes).map_err(|e| corrupt(format!("unreadable record: {e}")))?;
	if checksum(record.entry.get().as_bytes()) != record.checksum {
		return Err(corrupt("checksum mismatch".to_string()));
	}

	serde_json::from_str(record.entry.get()).map_err(|e| corrupt(format!("invalid entry: {e}")))
}

fn checksum(bytes: &[u8]) -> String {
	hex::encode(Sha256::digest(bytes))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
	let temp_path = write_temp(path, bytes)?;
	if let Err(e) = fs::rename(&temp_path, path) {
		let _ = fs::remove_file(&temp_path);
		return Err(e.into());
	}
	sync_parent(path);
	Ok(())
}

/// Like [`write_atomic`], but only if `path` still exists.
///
/// Where the platform can swap two names atomically the existence check and
/// the replacement are one step; elsewhere a record removed between them
/// comes back until the next enqueue trims the queue again.
fn replace_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
	let temp_path = write_temp(path, bytes)?;
	let missing = || QueueError::NotFound(path.display().to_string());

	let result = match exchange(&temp_path, path) {
		// The temp name now holds the previous record.
		Some(Ok(())) => remove_if_exists(&temp_path),
		Some(Err(e)) if e.kind() == ErrorKind::NotFound => Err(missing()),
		Some(Err(e)) => Err(e.into()),
		None if !path.exists() => Err(missing()),
		None => fs::rename(&temp_path, path).map_err(Into::into),
	};

	match result {
		Ok(()) => {
			sync_parent(path);
			Ok(())
		}
		Err(e) => {
			let _ = fs::remove_file(&temp_path);
			Err(e)
		}
	}
}

/// Write `bytes` next to `path` under a temp name and fsync it.
fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
	let parent = path
		.parent()
		.ok_or_else(|| QueueError::NotFound(path.display().to_string()))?;
	let name = path
		.file_name()
		.and_then(|n| n.to_str())
		.ok_or_else(|| QueueError::NotFound(path.display().to_string()))?;
	let temp_path = parent.join(format!(".{name}.tmp"));

	let mut opts = OpenOptions::new();
	opts.write(true).create(true).truncate(true);
	#[cfg(unix)]
	opts.mode(0o600);
	let mut file = opts.open(&temp_path)?;
	file.write_all(bytes)?;
	file.sync_all()?;
	Ok(temp_path)
}

/// Persist a rename in `path`'s directory.
fn sync_parent(path: &Path) {
	#[cfg(unix)]
	if let Some(parent) = path.parent() {
		if let Ok(dir) = File::open(parent) {
			let _ = dir.sync_all();
		}
	}
	#[cfg(not(unix))]
	let _ = path;
}

/// Atomically swap `a` and `b`; both must exist. `None` when the platform or
/// filesystem cannot.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn exchange(a: &Path, b: &Path) -> Option<std::io::Result<()>> {
	use std::ffi::CString;
	use std::os::unix::ffi::OsStrExt;

	let a = CString::new(a.as_os_str().as_bytes()).ok()?;
	let b = CString::new(b.as_os_str().as_bytes()).ok()?;
	// SAFETY: both are valid NUL-terminated paths that outlive the call.
	let rc = unsafe {
		libc::renameat2(
			libc::AT_FDCWD,
			a.as_ptr(),
			libc::AT_FDCWD,
			b.as_ptr(),
			libc::RENAME_EXCHANGE,
		)
	};
	if rc == 0 {
		return Some(Ok(()));
	}
	let err = std::io::Error::last_os_error();
	match err.raw_os_error() {
		Some(libc::EINVAL) | Some(libc::ENOSYS) => None,
		_ => Some(Err(err)),
	}
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn exchange(_a: &Path, _b: &Path) -> Option<std::io::Result<()>> {
	None
}

fn remove_if_exists(path: &Path) -> Result<()> {
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e.into()),
	}
}
