pub mod watcher;

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use walkdir::WalkDir;

use crate::codec::{self, CardCodec, CardData};
use crate::debounce::Debouncer;
use crate::paths;
use crate::store::{CardRecord, CardStore, ScanState};

/// Modification times within this window of the stored value count as
/// unchanged; filesystems round mtimes differently than they report them.
const MTIME_EPSILON: f64 = 0.01;

/// Files at or below this size never get a token backfill pass.
const TOKEN_BACKFILL_MIN_SIZE: i64 = 100;

pub enum ScanTask {
    /// Reconcile the library, scheduling a debounced reload on changes.
    Scan { reason: String },
    /// Same, but report the result back to a waiting caller.
    ScanSync {
        reason: String,
        done: Sender<Result<bool, String>>,
    },
    Stop,
}

/// Everything a scan cycle needs, cloneable into the worker thread.
#[derive(Clone)]
pub struct ScanContext {
    pub root: PathBuf,
    pub store: Arc<CardStore>,
    pub codec: Arc<dyn CardCodec>,
}

/// Handle for requesting scans: signals travel through a debouncer so a
/// burst of filesystem events collapses into a single queued scan.
#[derive(Clone)]
pub struct ScanScheduler {
    debounce: Arc<Debouncer>,
}

impl ScanScheduler {
    pub(crate) fn new(debounce: Arc<Debouncer>) -> Self {
        Self { debounce }
    }

    pub fn request(&self, reason: &str) {
        self.debounce.signal(reason);
    }
}

/// The single scan worker. Tasks are drained sequentially, so two scans
/// never run concurrently; a cycle failure is logged and the worker keeps
/// looping.
pub fn spawn_worker(
    rx: Receiver<ScanTask>,
    ctx: ScanContext,
    reload: Arc<Debouncer>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        log::info!("[Scanner] background worker started");
        while let Ok(task) = rx.recv() {
            match task {
                ScanTask::Stop => break,
                ScanTask::Scan { reason } => match run_scan(&ctx) {
                    Ok(true) => {
                        log::info!("[Scanner] changes detected ({}), scheduling reload", reason);
                        reload.signal(&format!("scan:{}", reason));
                    }
                    Ok(false) => log::debug!("[Scanner] no changes ({})", reason),
                    Err(e) => log::error!("[Scanner] scan cycle failed ({}): {}", reason, e),
                },
                ScanTask::ScanSync { reason, done } => {
                    let result = run_scan(&ctx);
                    if let Ok(true) = result {
                        reload.signal(&format!("scan:{}", reason));
                    }
                    let _ = done.send(result);
                }
            }
        }
        log::info!("[Scanner] background worker stopped");
    })
}

fn entry_visible(entry: &walkdir::DirEntry) -> bool {
    entry.depth() == 0 || !paths::is_hidden_name(&entry.file_name().to_string_lossy())
}

/// One reconciliation cycle: diff the store against the filesystem and
/// apply minimal corrective writes. Returns whether anything changed.
///
/// Classification per file (one stat each): new records get a full
/// extraction; content changes get a re-extraction with the hash cleared
/// (hashing is deferred until someone needs it); unchanged files with a
/// missing token count get a backfill that keeps the old hash; everything
/// else is skipped. Records whose file vanished are pruned afterwards.
pub fn run_scan(ctx: &ScanContext) -> Result<bool, String> {
    let snapshot = ctx.store.scan_snapshot()?;
    let mut seen: HashSet<String> = HashSet::with_capacity(snapshot.len());
    let mut changed = false;

    let walker = WalkDir::new(&ctx.root).into_iter().filter_entry(entry_visible);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("[Scanner] walk: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = match entry.file_name().to_str() {
            Some(name) => name,
            None => continue,
        };
        if !paths::is_card_file(name) {
            continue;
        }
        let id = match paths::relative_id(&ctx.root, entry.path()) {
            Some(id) => id,
            None => continue,
        };
        seen.insert(id.clone());

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(paths::system_time_seconds)
            .unwrap_or(0.0);
        let size = meta.len() as i64;

        let previous = snapshot.get(&id);
        let (needs_update, file_changed) = classify(previous, mtime, size);
        if !needs_update {
            continue;
        }

        let data = match ctx.codec.extract(entry.path()) {
            Ok(data) => data,
            Err(e) => {
                log::debug!("[Scanner] skipping {} (not a card): {}", id, e);
                continue;
            }
        };

        let record = build_record(&id, &data, mtime, size, file_changed, previous);
        ctx.store.upsert(&record)?;
        changed = true;
    }

    let mut pruned = 0usize;
    for id in snapshot.keys() {
        if !seen.contains(id) {
            ctx.store.delete_by_id(id)?;
            changed = true;
            pruned += 1;
        }
    }
    if pruned > 0 {
        log::info!("[Scanner] pruned {} records with no backing file", pruned);
    }

    Ok(changed)
}

fn classify(previous: Option<&ScanState>, mtime: f64, size: i64) -> (bool, bool) {
    match previous {
        None => (true, true),
        Some(state) => {
            if mtime > state.last_modified + MTIME_EPSILON || size != state.file_size {
                (true, true)
            } else if state.token_count <= 0 && size > TOKEN_BACKFILL_MIN_SIZE {
                (true, false)
            } else {
                (false, false)
            }
        }
    }
}

fn build_record(
    id: &str,
    data: &CardData,
    mtime: f64,
    size: i64,
    file_changed: bool,
    previous: Option<&ScanState>,
) -> CardRecord {
    CardRecord {
        id: id.to_string(),
        name: data.name.clone(),
        description: data.description.clone(),
        first_mes: data.first_mes.clone(),
        mes_example: data.mes_example.clone(),
        tags: data.tags.clone(),
        category: paths::parent_category(id).to_string(),
        creator: data.creator.clone(),
        version: data.version.clone(),
        last_modified: mtime,
        // Hashing is the expensive step; a cleared hash marks the record
        // stale for on-demand recomputation.
        file_hash: if file_changed {
            String::new()
        } else {
            previous.map(|p| p.file_hash.clone()).unwrap_or_default()
        },
        file_size: size,
        token_count: codec::estimate_tokens(data),
        has_lore_book: data.has_lore_book,
        lore_book_name: data.lore_book_name.clone(),
        favorite: previous.map(|p| p.favorite).unwrap_or(false),
    }
}

/// First-run population of a fresh store: extract every card file in
/// parallel with eager hashing, then insert everything in one
/// transaction. Returns (indexed, skipped).
pub fn import_library(ctx: &ScanContext) -> Result<(usize, usize), String> {
    let mut files: Vec<PathBuf> = Vec::new();
    let walker = WalkDir::new(&ctx.root).into_iter().filter_entry(entry_visible);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("[Scanner] import walk: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_card = paths::is_card_file(&entry.file_name().to_string_lossy());
        if is_card {
            files.push(entry.into_path());
        }
    }

    if files.is_empty() {
        log::info!("[Scanner] no card files found, skipping import");
        return Ok((0, 0));
    }

    log::info!("[Scanner] importing {} card files...", files.len());
    let records: Vec<CardRecord> = files
        .par_iter()
        .filter_map(|path| import_one(ctx, path))
        .collect();
    let skipped = files.len() - records.len();

    ctx.store.upsert_many(&records)?;
    log::info!(
        "[Scanner] import complete: {} indexed, {} skipped",
        records.len(),
        skipped
    );
    Ok((records.len(), skipped))
}

fn import_one(ctx: &ScanContext, path: &Path) -> Option<CardRecord> {
    let id = paths::relative_id(&ctx.root, path)?;
    let data = match ctx.codec.extract(path) {
        Ok(data) => data,
        Err(e) => {
            log::debug!("[Scanner] skipping {}: {}", id, e);
            return None;
        }
    };
    let mtime = paths::mtime_seconds(path).unwrap_or(0.0);
    let (file_hash, file_size) = hash_file(path).unwrap_or_default();

    let mut record = build_record(&id, &data, mtime, file_size, true, None);
    record.file_hash = file_hash;
    Some(record)
}

/// SHA-256 and size in one read.
pub fn hash_file(path: &Path) -> Option<(String, i64)> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some((format!("{:x}", hasher.finalize()), bytes.len() as i64))
}
