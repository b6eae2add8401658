//! Depression filling over the watershed adjacency graph.
//!
//! Boundary edges arrive as `(u, v, h)` triples where `h` is the lowest
//! elevation on the shared boundary of watersheds `u` and `v`. Scanning
//! them in ascending `h` and merging watersheds Kruskal-style yields, for
//! every watershed, the elevation it must be raised to before its water
//! can reach the outside.

use log::warn;

use super::types::{Elev, LABEL_BOUNDARY, LABEL_UNDEF, Label, is_nodata};
use super::water::{Boundary, LabelElev};
use crate::config::Config;
use crate::error::VoxResult;
use crate::stream::{Stream, sort_stream};

/// Union-find over watershed labels with a parallel done bitmap.
struct WatershedForest {
    parent: Vec<Label>,
    rank: Vec<u8>,
    done: Vec<bool>,
}

impl WatershedForest {
    fn new(n_labels: Label) -> Self {
        Self {
            parent: (0..n_labels).collect(),
            rank: vec![0; n_labels as usize],
            done: vec![false; n_labels as usize],
        }
    }

    fn find(&mut self, label: Label) -> Label {
        let mut root = label;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cursor = label;
        while self.parent[cursor as usize] != root {
            let next = self.parent[cursor as usize];
            self.parent[cursor as usize] = root;
            cursor = next;
        }
        root
    }

    fn union(&mut self, a: Label, b: Label) -> Label {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        let (child, root) = if self.rank[ra as usize] > self.rank[rb as usize] {
            (rb, ra)
        } else {
            (ra, rb)
        };
        self.parent[child as usize] = root;
        if self.rank[ra as usize] == self.rank[rb as usize] {
            self.rank[root as usize] += 1;
        }
        root
    }
}

/// Computes the raise table from the boundary edges.
///
/// `n_labels` bounds the label space (the label factory's count). The
/// returned vector maps every label to the elevation its watershed must
/// be lifted to; watersheds already reaching the outside stay at their
/// own level. Island watersheds (no path to the outside at any height)
/// are warned about and left unraised.
pub fn fill_depressions(
    boundaries: Stream<Boundary>,
    n_labels: Label,
    config: &Config,
) -> VoxResult<Vec<Elev>> {
    let dir = config.stream_tmpdir()?.clone();
    // The forest, done bitmap and raise table are all label-indexed.
    let per_label = size_of::<Label>() * 2 + size_of::<Elev>() + 1;
    config.charge(n_labels as usize * per_label)?;

    // Keep the cheapest edge per watershed pair, then scan ascending by
    // elevation.
    let mut by_pair = sort_stream(boundaries, &dir, config.memory_limit, |a, b| {
        (a.label1, a.label2)
            .cmp(&(b.label1, b.label2))
            .then(a.el.total_cmp(&b.el))
    })?;
    let mut deduped = Stream::new(&dir)?;
    by_pair.rewind()?;
    let mut last: Option<(Label, Label)> = None;
    while let Some(edge) = by_pair.next()? {
        if last != Some((edge.label1, edge.label2)) {
            deduped.push(&edge)?;
            last = Some((edge.label1, edge.label2));
        }
    }
    let mut edges = sort_stream(deduped, &dir, config.memory_limit, |a, b| {
        a.el.total_cmp(&b.el).then((a.label1, a.label2).cmp(&(b.label1, b.label2)))
    })?;

    let mut forest = WatershedForest::new(n_labels);
    forest.done[LABEL_BOUNDARY as usize] = true;
    let mut raise: Vec<Elev> = vec![0.0; n_labels as usize];

    edges.rewind()?;
    while let Some(edge) = edges.next()? {
        let ur = if edge.label1 == LABEL_BOUNDARY {
            LABEL_BOUNDARY
        } else {
            forest.find(edge.label1)
        };
        let vr = if edge.label2 == LABEL_BOUNDARY {
            LABEL_BOUNDARY
        } else {
            forest.find(edge.label2)
        };
        if ur == vr || (forest.done[ur as usize] && forest.done[vr as usize]) {
            continue;
        }

        // An edge into finished territory finishes the other side at this
        // height; otherwise the two basins merge and keep rising together.
        if forest.done[ur as usize] || forest.done[vr as usize] {
            let open = if forest.done[ur as usize] { vr } else { ur };
            forest.done[open as usize] = true;
            raise[open as usize] = edge.el;
        } else {
            raise[ur as usize] = edge.el;
            raise[vr as usize] = edge.el;
            forest.union(ur, vr);
        }
    }

    // Label 1 is reserved for nodata and never labels a watershed.
    for label in (super::types::LABEL_NODATA + 1)..n_labels {
        let root = forest.find(label);
        if root == label && !forest.done[root as usize] {
            warn!("watershed {label} is an island with no drainage path");
        }
        raise[label as usize] = raise[root as usize];
    }
    raise[LABEL_BOUNDARY as usize] = 0.0;
    Ok(raise)
}

/// Reserved seam for label spaces that exceed the memory cap; callers
/// hitting [`VoxError`](crate::error::VoxError::MemoryLimit) from
/// [`fill_depressions`] would switch to this.
pub fn ext_fill_depressions(
    _boundaries: Stream<Boundary>,
    _n_labels: Label,
    _config: &Config,
) -> VoxResult<Vec<Elev>> {
    Err(crate::error::VoxError::Unimplemented("external-memory depression filling"))
}

/// Rewrites the labeled grid into the filled elevation stream:
/// `max(el, raise[label])` for data cells, nulls passing through. The
/// input must be sorted by `(i, j)` so the output lands row-major.
pub fn commit_fill(
    labeled: &mut Stream<LabelElev>,
    raise: &[Elev],
    config: &Config,
) -> VoxResult<Stream<Elev>> {
    let dir = config.stream_tmpdir()?.clone();
    let mut filled = Stream::new(&dir)?;
    labeled.rewind()?;
    while let Some(cell) = labeled.next()? {
        let h = if is_nodata(cell.el) || cell.label == LABEL_UNDEF {
            cell.el
        } else {
            cell.el.max(raise[cell.label as usize])
        };
        filled.push(&h)?;
    }
    Ok(filled)
}
