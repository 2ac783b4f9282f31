use std::io::Write;

use hoard_store::{ObjectReader, Tree};
use hoard_types::{ObjectKind, Oid};
use tracing::debug;

use crate::error::{SplitError, SplitResult};

/// Write the bytes a blob or chunk tree covers to `out`, in order.
///
/// Trees are walked depth-first with an explicit stack. Returns the number of
/// bytes written.
pub fn join<R, W>(reader: &mut R, id: &Oid, out: &mut W) -> SplitResult<u64>
where
    R: ObjectReader + ?Sized,
    W: Write + ?Sized,
{
    let mut pending = vec![*id];
    let mut written = 0u64;
    while let Some(next) = pending.pop() {
        let obj = reader.read_required(&next)?;
        match obj.kind {
            ObjectKind::Blob => {
                out.write_all(&obj.data)?;
                written += obj.size();
            }
            ObjectKind::Tree => {
                let tree = Tree::decode(&next, &obj.data)?;
                pending.extend(tree.entries.iter().rev().map(|e| e.id));
            }
            kind => return Err(SplitError::UnexpectedKind { id: next, kind }),
        }
    }
    debug!(%id, bytes = written, "joined");
    Ok(written)
}
