//! Bloom and midx maintenance over a pack directory, and consistency checks.
//!
//! Problems that should not stop a pass (a missing idx, a bad entry) are
//! logged and collected in a [`Report`]; only I/O failures on the files
//! being written abort it.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::bloom::{max_bloom_bits, ShaBloom, BLOOM_FILE_NAME};
use crate::config::MaintenanceConfig;
use crate::error::IndexResult;
use crate::idx::{basename, PackIdx};
use crate::list::{mtime, remove_index_file};
use crate::merge::{merge_into, midx_file_name, MidxSummary};
use crate::midx::PackMidx;
use crate::source::{list_index_files, IndexSource};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What a maintenance pass did and what it found wrong.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub problems: Vec<String>,
    pub created: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a problem and log it.
    pub fn problem(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!("{msg}");
        self.problems.push(msg);
    }

    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    fn delete(&mut self, path: &Path) {
        remove_index_file(path);
        self.removed.push(path.to_path_buf());
    }
}

// ---------------------------------------------------------------------------
// Bloom
// ---------------------------------------------------------------------------

/// Options for [`run_bloom`].
#[derive(Clone, Debug, Default)]
pub struct BloomRequest {
    /// Filter to maintain; defaults to [`BLOOM_FILE_NAME`] in the directory.
    pub output: Option<PathBuf>,
    /// Rebuild even if the existing filter could be topped up.
    pub force: bool,
    /// Hash count; overrides the configured one.
    pub k: Option<u32>,
}

impl BloomRequest {
    fn output(&self, dir: &Path) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| dir.join(BLOOM_FILE_NAME))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BloomOutcome {
    NothingToDo,
    Created { path: PathBuf, idxs: usize, objects: u64 },
    Updated { path: PathBuf, idxs: usize, objects: u64 },
}

/// Bring the bloom filter up to date with the `*.idx` files in `dir`.
///
/// New indexes are added in place unless the filter has to be rebuilt: its
/// entry count disagrees with the indexes it claims, a different `k` was
/// asked for, or the additions would push the false-positive estimate over
/// the configured ceiling while the table can still grow.
pub fn run_bloom(
    dir: &Path,
    req: &BloomRequest,
    config: &MaintenanceConfig,
    report: &mut Report,
) -> IndexResult<BloomOutcome> {
    let output = req.output(dir);
    let k = req.k.or(config.bloom_k);

    let mut existing = None;
    if output.exists() && !req.force {
        match ShaBloom::open(&output) {
            Ok(b) if b.valid() => existing = Some(b),
            Ok(_) => debug!("bloom: existing filter is invalid, regenerating"),
            Err(e) => debug!(error = %e, "bloom: existing filter unreadable, regenerating"),
        }
    }

    let (idx_paths, _) = list_index_files(dir)?;
    let mut add = Vec::new();
    let mut rest = Vec::new();
    let mut add_count = 0u64;
    let mut rest_count = 0u64;
    for path in idx_paths {
        let idx = match PackIdx::open(&path) {
            Ok(idx) => idx,
            Err(e) => {
                report.problem(format!("bloom: skipping {e}"));
                continue;
            }
        };
        let known = existing
            .as_ref()
            .is_some_and(|b| b.idx_names().iter().any(|n| n == idx.name()));
        if known {
            rest_count += idx.len() as u64;
            rest.push(idx);
        } else {
            add_count += idx.len() as u64;
            add.push(idx);
        }
    }

    if add.is_empty() {
        debug!("bloom: nothing to do");
        return Ok(BloomOutcome::NothingToDo);
    }

    let mut bloom = None;
    if let Some(b) = existing.take() {
        let at_max = max_bloom_bits(b.k()).is_some_and(|max| b.bits() >= max);
        if b.len() != rest_count {
            debug!(entries = b.len(), rest_count, "bloom: size differs from idx total, regenerating");
        } else if k.is_some_and(|k| k != b.k()) {
            debug!(existing = b.k(), "bloom: k changed, regenerating");
        } else if !at_max && b.pfalse_positive(add_count) > config.max_pfalse_positive {
            debug!(
                add_count,
                pfalse = b.pfalse_positive(add_count),
                "bloom: additions would exceed false-positive ceiling, regenerating"
            );
        } else {
            drop(b);
            bloom = Some(ShaBloom::open_rw(&output, add_count)?);
        }
    }

    let created = bloom.is_none();
    let mut bloom = match bloom {
        Some(b) => b,
        None => {
            add.append(&mut rest);
            add_count += rest_count;
            ShaBloom::create(&output, add_count, k)?
        }
    };
    info!(
        files = add.len(),
        objects = add_count,
        "bloom: {} index files",
        if created { "creating from" } else { "adding" }
    );
    for idx in &add {
        bloom.add_idx(idx)?;
    }
    let path = bloom.close()?;
    let outcome = if created {
        report.created.push(path.clone());
        BloomOutcome::Created {
            path,
            idxs: add.len(),
            objects: add_count,
        }
    } else {
        BloomOutcome::Updated {
            path,
            idxs: add.len(),
            objects: add_count,
        }
    };
    Ok(outcome)
}

/// Zero the table of an existing filter so every lookup misses.
pub fn ruin_bloom(path: &Path) -> IndexResult<()> {
    let mut b = ShaBloom::open_rw(path, 1)?;
    b.ruin()?;
    b.close()?;
    Ok(())
}

/// Verify that every id of `idx` is in the bloom filter at `bloom_path`.
/// A bare idx name is looked up in the pack directory `dir`.
pub fn check_bloom(
    dir: &Path,
    bloom_path: &Path,
    idx: &Path,
    report: &mut Report,
) -> IndexResult<()> {
    if !bloom_path.exists() {
        info!(path = %bloom_path.display(), "bloom: does not exist");
        return Ok(());
    }
    let b = match ShaBloom::open(bloom_path) {
        Ok(b) if b.valid() => b,
        Ok(_) => {
            report.problem(format!("bloom: {} is invalid", bloom_path.display()));
            return Ok(());
        }
        Err(e) => {
            report.problem(format!("bloom: {e}"));
            return Ok(());
        }
    };
    let base = basename(idx);
    if !b.idx_names().iter().any(|n| *n == base) {
        info!(path = %bloom_path.display(), idx = %base, "bloom: does not contain the idx");
        return Ok(());
    }
    let idx_path = if idx.parent().map_or(true, |p| p.as_os_str().is_empty()) {
        dir.join(idx)
    } else {
        idx.to_path_buf()
    };
    info!(idx = %idx_path.display(), "bloom: checking");
    let ix = PackIdx::open(&idx_path)?;
    for oid in ix.iter() {
        if !b.exists(&oid) {
            report.problem(format!("bloom: object {oid} missing"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Midx
// ---------------------------------------------------------------------------

/// Options for [`do_midx`] and [`midx_dir`].
#[derive(Clone, Debug, Default)]
pub struct MidxRequest {
    /// Output file for an explicit merge; generated from the inputs otherwise.
    pub output: Option<PathBuf>,
    /// Only merge when it is worth it, and delete broken midx inputs.
    pub auto: bool,
    /// Merge everything into one file.
    pub force: bool,
}

/// Open a midx for maintenance. Files listing missing idx are reported and,
/// when `rm_broken`, deleted; old-format files are deleted; anything else
/// unreadable is reported and left alone.
fn open_midx(path: &Path, rm_broken: bool, report: &mut Report) -> Option<PackMidx> {
    match PackMidx::open(path) {
        Ok(m) => {
            let missing: Vec<String> = m.missing_idxs().into_iter().map(String::from).collect();
            if missing.is_empty() {
                return Some(m);
            }
            drop(m);
            for idx in &missing {
                report.problem(format!(
                    "midx {} refers to missing idx {idx}",
                    path.display()
                ));
            }
            if rm_broken {
                info!(midx = %path.display(), "removing incomplete midx");
                report.delete(path);
            }
            None
        }
        Err(e) if e.is_too_old() => {
            info!(error = %e, "removing old-style midx");
            report.delete(path);
            None
        }
        Err(e) => {
            report.problem(format!("midx: {e}"));
            None
        }
    }
}

fn open_input(path: &Path, rm_broken: bool, report: &mut Report) -> Option<IndexSource> {
    if path.extension().is_some_and(|e| e == "midx") {
        return open_midx(path, rm_broken, report).map(IndexSource::Midx);
    }
    match IndexSource::open(path) {
        Ok(src) => Some(src),
        Err(e) => {
            report.problem(format!("midx: {e}"));
            None
        }
    }
}

/// Merge `inputs` into one midx in `dir`. Returns `None` when there is
/// nothing worth merging.
pub fn do_midx(
    dir: &Path,
    inputs: &[PathBuf],
    req: &MidxRequest,
    report: &mut Report,
) -> IndexResult<Option<MidxSummary>> {
    let rm_broken = req.auto || req.force;
    let sources: Vec<IndexSource> = inputs
        .iter()
        .filter_map(|p| open_input(p, rm_broken, report))
        .collect();
    let total: u64 = sources.iter().map(|s| s.len() as u64).sum();
    debug!(files = inputs.len(), objects = total, "midx: creating");

    if (req.auto && total < 1024 && inputs.len() < 3)
        || ((req.auto || req.force) && inputs.len() < 2)
        || (req.force && total == 0)
    {
        debug!("midx: nothing to do");
        return Ok(None);
    }

    let output = match &req.output {
        Some(o) => o.clone(),
        None => dir.join(midx_file_name(inputs)),
    };
    let refs: Vec<&IndexSource> = sources.iter().collect();
    let summary = merge_into(&output, &refs)?;
    report.created.push(summary.path.clone());
    Ok(Some(summary))
}

/// Merge the smallest indexes of `dir` until at most the high-water mark
/// remain, after deleting midx files made redundant by larger ones.
///
/// Returns the files created.
pub fn midx_dir(
    dir: &Path,
    req: &MidxRequest,
    config: &MaintenanceConfig,
    report: &mut Report,
) -> IndexResult<Vec<PathBuf>> {
    let (idx_paths, midx_paths) = list_index_files(dir)?;
    let mut already: HashSet<PathBuf> = HashSet::new();
    let mut sizes: HashMap<PathBuf, usize> = HashMap::new();
    let mut midxs = Vec::new();

    if req.auto || !req.force {
        let mut contents = HashMap::new();
        for path in midx_paths {
            let Some(m) = open_midx(&path, req.auto || req.force, report) else {
                continue;
            };
            let covered: Vec<PathBuf> = m.idx_names().iter().map(|n| dir.join(n)).collect();
            sizes.insert(path.clone(), m.len());
            contents.insert(path.clone(), covered);
            midxs.push(path);
        }
        midxs.sort_by_cached_key(|p| (Reverse(sizes[p]), Reverse(mtime(p))));
        for path in &midxs {
            let mut adds = false;
            for idx in &contents[path] {
                adds |= already.insert(idx.clone());
            }
            if !adds {
                debug!(midx = %path.display(), "midx: redundant");
                report.delete(path);
                already.insert(path.clone());
            }
        }
    }

    midxs.retain(|p| !already.contains(p));
    let mut all: Vec<(usize, PathBuf)> = midxs
        .into_iter()
        .map(|p| (sizes[&p], p))
        .collect();
    for path in idx_paths {
        if already.contains(&path) {
            continue;
        }
        match PackIdx::open(&path) {
            Ok(idx) => all.push((idx.len(), path)),
            Err(e) => report.problem(format!("midx: skipping {e}")),
        }
    }

    let (hwm, lwm) = config.water_marks(req.force);
    let max_files = config.max_files.max(crate::config::MIN_MAX_FILES);
    let existed: HashSet<PathBuf> = all.iter().map(|(_, p)| p.clone()).collect();
    debug!(indexes = all.len(), wanted = hwm, "midx: scanning");
    if all.len() <= hwm {
        debug!("midx: nothing to do");
    }
    let group_req = MidxRequest {
        output: None,
        ..req.clone()
    };
    while all.len() > hwm {
        all.sort();
        let part2 = all.split_off(all.len() - lwm + 1);
        let part1: Vec<PathBuf> = all.drain(..).map(|(_, p)| p).collect();
        for group in part1.chunks(max_files) {
            if let Some(summary) = do_midx(dir, group, &group_req, report)? {
                all.push((summary.objects as usize, summary.path));
            }
        }
        all.extend(part2);
        if all.len() > hwm {
            debug!(indexes = all.len(), wanted = hwm, "midx: still too many indexes, merging again");
        }
    }

    Ok(all
        .into_iter()
        .map(|(_, p)| p)
        .filter(|p| !existed.contains(p))
        .collect())
}

/// Check that a midx agrees with the indexes it covers and is sorted.
pub fn check_midx(path: &Path, report: &mut Report) -> IndexResult<()> {
    info!(midx = %path.display(), "checking");
    let m = match PackMidx::open(path) {
        Ok(m) => m,
        Err(e) => {
            report.problem(format!("{e}"));
            return Ok(());
        }
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut subs = HashMap::new();
    for name in m.idx_names() {
        let sub = match PackIdx::open(&dir.join(name)) {
            Ok(sub) => sub,
            Err(e) => {
                report.problem(format!("{}: {e}", path.display()));
                continue;
            }
        };
        for oid in sub.iter() {
            if !sub.exists(&oid) {
                report.problem(format!("{}: {name}: {oid} missing from idx", path.display()));
            }
            if !m.exists(&oid) {
                report.problem(format!("{}: {name}: {oid} missing from midx", path.display()));
            }
        }
        subs.insert(name.as_str(), sub);
    }

    let mut prev = None;
    for (pos, oid) in m.iter().enumerate() {
        if let Some(p) = prev {
            if oid <= p {
                report.problem(format!("{}: ordering error: {oid} <= {p}", path.display()));
            }
        }
        prev = Some(oid);
        match m.idx_name_at(pos) {
            Some(name) => {
                if subs.get(name).is_some_and(|sub| !sub.exists(&oid)) {
                    report.problem(format!(
                        "{}: {oid} attributed to {name}, which lacks it",
                        path.display()
                    ));
                }
            }
            None => report.problem(format!(
                "{}: entry {pos} names index {} of {}",
                path.display(),
                m.which_at(pos),
                m.idx_names().len()
            )),
        }
    }
    Ok(())
}

/// Routine upkeep after packs are written: merge indexes if there are too
/// many, then bring the bloom filter up to date.
pub fn auto_maintain(
    dir: &Path,
    config: &MaintenanceConfig,
    report: &mut Report,
) -> IndexResult<()> {
    let midx_req = MidxRequest {
        auto: true,
        ..Default::default()
    };
    let created = midx_dir(dir, &midx_req, config, report)?;
    for path in &created {
        debug!(midx = %path.display(), "auto: created midx");
    }
    run_bloom(dir, &BloomRequest::default(), config, report)?;
    Ok(())
}
