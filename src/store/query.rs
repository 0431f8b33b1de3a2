//! Filter to index-range planning and execution.
//!
//! The planner picks the most selective index a filter can use, emits
//! half-open key ranges over it, and re-applies the whole predicate to
//! every hydrated candidate. Results are deduplicated by serial across
//! ranges and ordered newest first with serial as tie-breaker.

use std::collections::HashSet;
use std::ops::Bound;

use crate::event::filter::Filter;
use crate::event::{Event, Id};

use super::{keys, words, Serial, Store, StoreError};

/// One half-open `[lo, hi)` scan over a single index prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub lo: Vec<u8>,
    pub hi: Vec<u8>,
}

impl Scan {
    fn new((lo, hi): (Vec<u8>, Vec<u8>)) -> Self {
        Scan { lo, hi }
    }
}

/// The scans a filter resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Point lookups through the id index; no further planning.
    Ids(Vec<Id>),
    /// Union of range scans over one secondary index.
    Ranges(Vec<Scan>),
    /// One scan per search token; posting lists are intersected by serial.
    Words(Vec<Scan>),
    /// Provably empty, e.g. a search query with no indexable tokens.
    Empty,
}

/// Select the most selective index for a filter.
pub fn plan(filter: &Filter) -> Plan {
    if !filter.ids.is_empty() {
        return Plan::Ids(filter.ids.clone());
    }
    let since = filter.since;
    let until = filter.until;

    if !filter.authors.is_empty() && !filter.kinds.is_empty() {
        let mut scans = Vec::with_capacity(filter.authors.len() * filter.kinds.len());
        for author in &filter.authors {
            for kind in &filter.kinds {
                scans.push(Scan::new(keys::pubkey_kind_range(author, *kind, since, until)));
            }
        }
        return Plan::Ranges(scans);
    }
    if !filter.authors.is_empty() {
        return Plan::Ranges(
            filter
                .authors
                .iter()
                .map(|a| Scan::new(keys::pubkey_range(a, since, until)))
                .collect(),
        );
    }
    if !filter.kinds.is_empty() {
        return Plan::Ranges(
            filter
                .kinds
                .iter()
                .map(|k| Scan::new(keys::kind_range(*k, since, until)))
                .collect(),
        );
    }
    if let Some((tag, values)) = filter
        .tags
        .iter()
        .find(|(tag, values)| tag.is_ascii() && !values.is_empty())
    {
        return Plan::Ranges(
            values
                .iter()
                .map(|v| Scan::new(keys::tag_range(*tag as u8, v, since, until)))
                .collect(),
        );
    }
    if let Some(search) = &filter.search {
        let tokens = words::tokenize(search);
        if tokens.is_empty() {
            return Plan::Empty;
        }
        return Plan::Words(
            tokens
                .iter()
                .map(|t| Scan::new(keys::word_range(t, since, until)))
                .collect(),
        );
    }
    Plan::Ranges(vec![Scan::new(keys::created_range(since, until))])
}

/// Run a filter against the store.
///
/// Returns matching `(serial, event)` pairs ordered by
/// `(created_at desc, serial desc)`, truncated to the filter's limit.
pub fn execute(store: &Store, filter: &Filter) -> Result<Vec<(Serial, Event)>, StoreError> {
    if filter.limit == Some(0) {
        return Ok(Vec::new());
    }
    let limit = filter.limit.unwrap_or(usize::MAX);
    let rtxn = store.env.read_txn()?;
    let mut out: Vec<(Serial, Event)> = Vec::new();
    let mut seen: HashSet<Serial> = HashSet::new();

    match plan(filter) {
        Plan::Empty => {}
        Plan::Ids(ids) => {
            for id in ids {
                let Some((serial, event)) = store.fetch_by_id_txn(&rtxn, &id)? else {
                    continue;
                };
                if seen.insert(serial) && filter.matches(&event) {
                    out.push((serial, event));
                }
            }
        }
        Plan::Ranges(scans) => {
            for scan in scans {
                let range = (
                    Bound::Included(scan.lo.as_slice()),
                    Bound::Excluded(scan.hi.as_slice()),
                );
                let mut taken = 0usize;
                for item in store.db.rev_range(&rtxn, &range)? {
                    let (key, _) = item?;
                    let serial = keys::serial_from_suffix(key);
                    if !seen.insert(serial) {
                        continue;
                    }
                    let event = store.fetch_txn(&rtxn, serial)?;
                    if filter.matches(&event) {
                        out.push((serial, event));
                        taken += 1;
                        // Anything further down this range is older than
                        // what it already contributed.
                        if taken >= limit {
                            break;
                        }
                    }
                }
            }
        }
        Plan::Words(scans) => {
            let mut postings: Vec<HashSet<Serial>> = Vec::with_capacity(scans.len());
            for scan in &scans {
                let serials = store.collect_serials(&rtxn, &scan.lo, &scan.hi)?;
                postings.push(serials.into_iter().collect());
            }
            let Some((first, rest)) = postings.split_first() else {
                return Ok(Vec::new());
            };
            for serial in first {
                if rest.iter().all(|set| set.contains(serial)) {
                    let event = store.fetch_txn(&rtxn, *serial)?;
                    if filter.matches(&event) {
                        out.push((*serial, event));
                    }
                }
            }
        }
    }

    out.sort_by(|a, b| (b.1.created_at, b.0).cmp(&(a.1.created_at, a.0)));
    out.truncate(limit);
    Ok(out)
}
