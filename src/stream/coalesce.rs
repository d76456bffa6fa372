//! Merges adjacent `Empty` runs and adjacent same-source `Copy` runs.

use super::{CopySource, StreamElement};
use crate::backend::Backend;
#[cfg(test)]
use crate::vhd::LayerDepth;

fn same_source<B: Backend>(a: &CopySource<B>, b: &CopySource<B>) -> bool {
    match (a, b) {
        (CopySource::Chain(x), CopySource::Chain(y)) => *x == *y,
        (CopySource::External(x), CopySource::External(y)) => std::rc::Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Merges adjacent `Empty` elements, and adjacent `Copy` elements that reference the
/// same source with contiguous sector ranges (forward or backward). `Sectors`
/// elements are left untouched and never merge with a neighbor.
pub fn coalesce<B: Backend>(elements: Vec<StreamElement<B>>) -> Vec<StreamElement<B>> {
    let mut out: Vec<StreamElement<B>> = Vec::with_capacity(elements.len());

    for element in elements {
        match (out.last_mut(), element) {
            (Some(StreamElement::Empty(prev_n)), StreamElement::Empty(n)) => {
                *prev_n += n;
            }
            (
                Some(StreamElement::Copy {
                    source: prev_source,
                    sector_offset: prev_offset,
                    sector_len: prev_len,
                }),
                StreamElement::Copy {
                    source,
                    sector_offset,
                    sector_len,
                },
            ) if same_source(prev_source, &source) => {
                if *prev_offset + *prev_len == sector_offset {
                    *prev_len += sector_len;
                } else if sector_offset + sector_len == *prev_offset {
                    *prev_offset = sector_offset;
                    *prev_len += sector_len;
                } else {
                    out.push(StreamElement::Copy {
                        source,
                        sector_offset,
                        sector_len,
                    });
                }
            }
            (_, element) => out.push(element),
        }
    }

    out
}
