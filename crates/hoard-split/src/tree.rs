//! Shaping chunks into blobs and a shallow tree of blobs.
//!
//! Groupings are kept on an explicit stack indexed by level. A boundary at
//! level `L` closes every grouping below `L`: a grouping holding a single
//! entry is promoted as-is, a larger one is written as a tree and the tree
//! becomes one entry of the grouping above. Tree entries are named by their
//! zero-padded hex byte offset within the grouping.

use std::io::Read;

use hoard_store::{EntryMode, ObjectWriter, Tree, TreeEntry};
use hoard_types::{ObjectKind, Oid};
use tracing::debug;

use crate::error::SplitResult;
use crate::splitter::HashSplitter;

/// A blob or subtree produced by splitting, with the byte count it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitEntry {
    pub mode: EntryMode,
    pub id: Oid,
    pub size: u64,
}

impl SplitEntry {
    pub fn is_tree(&self) -> bool {
        self.mode.is_tree()
    }
}

/// Iterator writing each chunk as a blob; see [`split_to_blobs`].
pub struct SplitBlobs<'w, W: ?Sized, I, R> {
    writer: &'w mut W,
    splitter: HashSplitter<I, R>,
}

impl<W, I, R> Iterator for SplitBlobs<'_, W, I, R>
where
    W: ObjectWriter + ?Sized,
    I: Iterator<Item = R>,
    R: Read,
{
    /// `(blob id, chunk size, level)`
    type Item = SplitResult<(Oid, u64, u32)>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = match self.splitter.next()? {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e.into())),
        };
        let size = chunk.data.len() as u64;
        Some(
            self.writer
                .write(ObjectKind::Blob, &chunk.data)
                .map(|id| (id, size, chunk.level))
                .map_err(Into::into),
        )
    }
}

/// Write every chunk of `splitter` as a blob, yielding ids as they are written.
pub fn split_to_blobs<W, I, R>(
    writer: &mut W,
    splitter: HashSplitter<I, R>,
) -> SplitBlobs<'_, W, I, R>
where
    W: ObjectWriter + ?Sized,
    I: Iterator<Item = R>,
    R: Read,
{
    SplitBlobs { writer, splitter }
}

struct ShalistBuilder<'w, W: ?Sized> {
    writer: &'w mut W,
    stacks: Vec<Vec<SplitEntry>>,
    max_per_tree: usize,
    trees: usize,
}

impl<'w, W: ObjectWriter + ?Sized> ShalistBuilder<'w, W> {
    fn new(writer: &'w mut W, max_per_tree: usize) -> Self {
        Self {
            writer,
            stacks: vec![Vec::new()],
            max_per_tree,
            trees: 0,
        }
    }

    fn push(&mut self, entry: SplitEntry, level: usize) -> SplitResult<()> {
        self.stacks[0].push(entry);
        self.squish(level)
    }

    /// Close every grouping below `n`, and any grouping that is full.
    fn squish(&mut self, n: usize) -> SplitResult<()> {
        let mut i = 0;
        while i < n || self.stacks[i].len() >= self.max_per_tree {
            if self.stacks.len() == i + 1 {
                self.stacks.push(Vec::new());
            }
            let group = std::mem::take(&mut self.stacks[i]);
            if group.len() == 1 {
                self.stacks[i + 1].extend(group);
            } else if !group.is_empty() {
                let tree = self.write_tree(&group)?;
                self.stacks[i + 1].push(tree);
            }
            i += 1;
        }
        Ok(())
    }

    fn write_tree(&mut self, group: &[SplitEntry]) -> SplitResult<SplitEntry> {
        let total: u64 = group.iter().map(|e| e.size).sum();
        let width = format!("{total:x}").len();
        let mut ofs = 0u64;
        let entries = group
            .iter()
            .map(|e| {
                let name = format!("{ofs:0width$x}");
                ofs += e.size;
                TreeEntry::new(e.mode, name, e.id)
            })
            .collect();
        let id = self
            .writer
            .write(ObjectKind::Tree, &Tree::new(entries).encode())?;
        self.trees += 1;
        Ok(SplitEntry {
            mode: EntryMode::Directory,
            id,
            size: total,
        })
    }

    fn finish(mut self) -> SplitResult<Vec<SplitEntry>> {
        let top = self.stacks.len() - 1;
        self.squish(top)?;
        debug!(
            trees = self.trees,
            depth = self.stacks.len(),
            "split tree complete"
        );
        Ok(self.stacks.pop().unwrap_or_default())
    }
}

/// Split into blobs and group them by level, returning the top-level listing.
pub fn split_to_shalist<W, I, R>(
    writer: &mut W,
    splitter: HashSplitter<I, R>,
    max_per_tree: usize,
) -> SplitResult<Vec<SplitEntry>>
where
    W: ObjectWriter + ?Sized,
    I: Iterator<Item = R>,
    R: Read,
{
    let mut builder = ShalistBuilder::new(writer, max_per_tree);
    for chunk in splitter {
        let chunk = chunk?;
        let entry = SplitEntry {
            mode: EntryMode::Regular,
            id: builder.writer.write(ObjectKind::Blob, &chunk.data)?,
            size: chunk.data.len() as u64,
        };
        builder.push(entry, chunk.level as usize)?;
    }
    builder.finish()
}

/// Split and reduce to a single object: an empty blob for empty input, the
/// only entry when there is just one, otherwise a tree over the listing.
pub fn split_to_blob_or_tree<W, I, R>(
    writer: &mut W,
    splitter: HashSplitter<I, R>,
    max_per_tree: usize,
) -> SplitResult<SplitEntry>
where
    W: ObjectWriter + ?Sized,
    I: Iterator<Item = R>,
    R: Read,
{
    let shalist = split_to_shalist(&mut *writer, splitter, max_per_tree)?;
    match shalist.as_slice() {
        [] => Ok(SplitEntry {
            mode: EntryMode::Regular,
            id: writer.write(ObjectKind::Blob, b"")?,
            size: 0,
        }),
        [only] => Ok(*only),
        many => ShalistBuilder::new(writer, max_per_tree).write_tree(many),
    }
}
