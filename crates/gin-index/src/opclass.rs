//! Operator classes: the type-specific callbacks the index is parameterized by.
//!
//! An operator class splits heap values into keys, turns queries into key
//! lists plus a search mode, orders keys, and decides whether a combination
//! of matched keys satisfies the query.

use crate::tuple::NullCategory;
use bytes::Bytes;
use gin_common::{Datum, GinError, KeyType, Result};
use std::cmp::Ordering;

/// Above this many MAYBE inputs the synthesized tri-state check gives up and
/// answers MAYBE without enumerating combinations.
pub const MAX_MAYBE_ENTRIES: usize = 4;

/// How a scan key wants the index searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Only rows containing at least one query key can match.
    Default,
    /// Rows with no keys (empty items) may match too.
    IncludeEmpty,
    /// Every non-null row may match.
    All,
    /// Every row may match, including nulls.
    Everything,
}

/// Three-valued consistency result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriValue {
    False,
    True,
    Maybe,
}

impl From<bool> for TriValue {
    fn from(b: bool) -> Self {
        if b { TriValue::True } else { TriValue::False }
    }
}

/// One key extracted from a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEntry {
    pub key: Bytes,
    pub category: NullCategory,
    /// The key is a prefix-like pattern matched through `compare_partial`.
    pub partial_match: bool,
    /// Opaque data handed back to `compare_partial`.
    pub extra: Option<Bytes>,
}

impl QueryEntry {
    pub fn exact(key: Bytes) -> Self {
        Self {
            key,
            category: NullCategory::NormKey,
            partial_match: false,
            extra: None,
        }
    }

    pub fn partial(key: Bytes) -> Self {
        Self {
            key,
            category: NullCategory::NormKey,
            partial_match: true,
            extra: None,
        }
    }
}

/// Result of `extract_query`.
#[derive(Debug, Clone)]
pub struct ExtractedQuery {
    pub entries: Vec<QueryEntry>,
    pub search_mode: SearchMode,
}

/// Outcome of partial-match comparison of an index key against a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialMatch {
    /// Not a match; keep scanning.
    Skip,
    Match,
    /// No later key can match either.
    Stop,
}

/// Type-specific behaviour of one indexed column.
pub trait OpClass: Send + Sync {
    fn name(&self) -> &str;

    fn key_type(&self) -> KeyType {
        KeyType::VARLENA
    }

    /// Total order on normal keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    /// Keys of a non-null heap value. `None` entries are null elements.
    fn extract_value(&self, value: &Datum) -> Vec<Option<Bytes>>;

    /// Keys and search mode for a query.
    fn extract_query(&self, query: &Datum, strategy: u16) -> Result<ExtractedQuery>;

    /// Boolean consistency: `check[i]` tells whether the row contains query
    /// entry `i`. Returns whether the row may match and whether the heap
    /// value must be rechecked.
    fn consistent(
        &self,
        check: &[bool],
        strategy: u16,
        query: &Datum,
        entries: &[QueryEntry],
    ) -> (bool, bool);

    /// Native tri-state consistency, if the class provides one.
    fn native_tri_consistent(
        &self,
        _check: &[TriValue],
        _strategy: u16,
        _query: &Datum,
        _entries: &[QueryEntry],
    ) -> Option<TriValue> {
        None
    }

    /// Partial-match comparison of an index key against a query pattern.
    fn compare_partial(
        &self,
        _query_key: &[u8],
        _index_key: &[u8],
        _strategy: u16,
        _extra: Option<&Bytes>,
    ) -> PartialMatch {
        PartialMatch::Stop
    }
}

/// Tri-state consistency, using the class's native implementation when it
/// has one and otherwise enumerating the MAYBE inputs through the boolean
/// function.
pub fn tri_consistent(
    opclass: &dyn OpClass,
    check: &[TriValue],
    strategy: u16,
    query: &Datum,
    entries: &[QueryEntry],
) -> TriValue {
    if let Some(v) = opclass.native_tri_consistent(check, strategy, query, entries) {
        return v;
    }
    shim_tri_consistent(opclass, check, strategy, query, entries)
}

fn shim_tri_consistent(
    opclass: &dyn OpClass,
    check: &[TriValue],
    strategy: u16,
    query: &Datum,
    entries: &[QueryEntry],
) -> TriValue {
    let maybe: Vec<usize> = check
        .iter()
        .enumerate()
        .filter(|(_, v)| **v == TriValue::Maybe)
        .map(|(i, _)| i)
        .collect();

    let mut bools: Vec<bool> = check.iter().map(|v| *v == TriValue::True).collect();
    if maybe.is_empty() {
        let (res, recheck) = opclass.consistent(&bools, strategy, query, entries);
        return match (res, recheck) {
            (false, _) => TriValue::False,
            (true, false) => TriValue::True,
            (true, true) => TriValue::Maybe,
        };
    }
    if maybe.len() > MAX_MAYBE_ENTRIES {
        return TriValue::Maybe;
    }

    let mut first: Option<bool> = None;
    let mut any_recheck = false;
    for combo in 0u32..(1 << maybe.len()) {
        for (bit, &idx) in maybe.iter().enumerate() {
            bools[idx] = combo & (1 << bit) != 0;
        }
        let (res, recheck) = opclass.consistent(&bools, strategy, query, entries);
        match first {
            None => first = Some(res),
            Some(prev) if prev != res => return TriValue::Maybe,
            Some(_) => {}
        }
        any_recheck |= recheck;
    }
    match first {
        Some(true) if any_recheck => TriValue::Maybe,
        Some(true) => TriValue::True,
        _ => TriValue::False,
    }
}

// =============================================================================
// Array operator class
// =============================================================================

/// Array overlap: `a && b`.
pub const ARRAY_OVERLAP: u16 = 1;
/// Array containment: `a @> b`.
pub const ARRAY_CONTAINS: u16 = 2;
/// Array contained by: `a <@ b`.
pub const ARRAY_CONTAINED: u16 = 3;
/// Array equality.
pub const ARRAY_EQUAL: u16 = 4;

/// Operator class over arrays of scalars. Each distinct element is a key.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrayOps;

impl ArrayOps {
    /// Evaluates the operator directly on heap values, used to recheck
    /// candidate rows.
    pub fn evaluate(value: Option<&Datum>, query: &Datum, strategy: u16) -> bool {
        let (Some(Datum::Array(v)), Datum::Array(q)) = (value, query) else {
            return false;
        };
        let contains = |hay: &[Option<Datum>], needle: &Option<Datum>| {
            needle.is_some() && hay.iter().any(|e| e == needle)
        };
        match strategy {
            ARRAY_OVERLAP => q.iter().any(|e| contains(v, e)),
            ARRAY_CONTAINS => q.iter().all(|e| contains(v, e)),
            ARRAY_CONTAINED => v.iter().all(|e| contains(q, e)),
            ARRAY_EQUAL => {
                v.iter().all(|e| contains(q, e)) && q.iter().all(|e| contains(v, e))
            }
            _ => false,
        }
    }
}

impl OpClass for ArrayOps {
    fn name(&self) -> &str {
        "array_ops"
    }

    fn extract_value(&self, value: &Datum) -> Vec<Option<Bytes>> {
        match value {
            Datum::Array(elems) => elems
                .iter()
                .map(|e| e.as_ref().map(Datum::to_key_bytes))
                .collect(),
            scalar => vec![Some(scalar.to_key_bytes())],
        }
    }

    fn extract_query(&self, query: &Datum, strategy: u16) -> Result<ExtractedQuery> {
        let Datum::Array(elems) = query else {
            return Err(GinError::InvalidParameter {
                name: "query".to_string(),
                value: "array operators need an array argument".to_string(),
            });
        };
        let mut keys: Vec<Bytes> = elems
            .iter()
            .flatten()
            .map(Datum::to_key_bytes)
            .collect();
        keys.sort();
        keys.dedup();
        let search_mode = match strategy {
            ARRAY_OVERLAP => SearchMode::Default,
            ARRAY_CONTAINS if keys.is_empty() => SearchMode::All,
            ARRAY_CONTAINS => SearchMode::Default,
            ARRAY_CONTAINED => SearchMode::IncludeEmpty,
            ARRAY_EQUAL if keys.is_empty() => SearchMode::IncludeEmpty,
            ARRAY_EQUAL => SearchMode::Default,
            other => {
                return Err(GinError::InvalidParameter {
                    name: "strategy".to_string(),
                    value: other.to_string(),
                });
            }
        };
        Ok(ExtractedQuery {
            entries: keys.into_iter().map(QueryEntry::exact).collect(),
            search_mode,
        })
    }

    fn consistent(
        &self,
        check: &[bool],
        strategy: u16,
        _query: &Datum,
        _entries: &[QueryEntry],
    ) -> (bool, bool) {
        match strategy {
            ARRAY_OVERLAP => (check.iter().any(|c| *c), false),
            ARRAY_CONTAINS => (check.iter().all(|c| *c), false),
            // Only the heap value can tell whether every element is covered.
            ARRAY_CONTAINED => (true, true),
            ARRAY_EQUAL => (check.iter().all(|c| *c), true),
            _ => (false, false),
        }
    }

    fn native_tri_consistent(
        &self,
        check: &[TriValue],
        strategy: u16,
        _query: &Datum,
        _entries: &[QueryEntry],
    ) -> Option<TriValue> {
        let any = |v: TriValue| check.contains(&v);
        Some(match strategy {
            ARRAY_OVERLAP => {
                if any(TriValue::True) {
                    TriValue::True
                } else if any(TriValue::Maybe) {
                    TriValue::Maybe
                } else {
                    TriValue::False
                }
            }
            ARRAY_CONTAINS => {
                if any(TriValue::False) {
                    TriValue::False
                } else if any(TriValue::Maybe) {
                    TriValue::Maybe
                } else {
                    TriValue::True
                }
            }
            ARRAY_CONTAINED => TriValue::Maybe,
            ARRAY_EQUAL => {
                if any(TriValue::False) {
                    TriValue::False
                } else {
                    TriValue::Maybe
                }
            }
            _ => TriValue::False,
        })
    }
}

// =============================================================================
// Prefix operator class
// =============================================================================

/// Exact equality on a scalar text column.
pub const PREFIX_EQUAL: u16 = 1;
/// Prefix match on a scalar text column.
pub const PREFIX_MATCH: u16 = 2;

/// Operator class over scalar text supporting prefix search through partial
/// matching. It has no native tri-state function.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixOps;

impl PrefixOps {
    pub fn evaluate(value: Option<&Datum>, query: &Datum, strategy: u16) -> bool {
        let (Some(Datum::Text(v)), Datum::Text(q)) = (value, query) else {
            return false;
        };
        match strategy {
            PREFIX_EQUAL => v == q,
            PREFIX_MATCH => v.starts_with(q),
            _ => false,
        }
    }
}

impl OpClass for PrefixOps {
    fn name(&self) -> &str {
        "text_prefix_ops"
    }

    fn extract_value(&self, value: &Datum) -> Vec<Option<Bytes>> {
        vec![Some(value.to_key_bytes())]
    }

    fn extract_query(&self, query: &Datum, strategy: u16) -> Result<ExtractedQuery> {
        let key = query.to_key_bytes();
        let entry = match strategy {
            PREFIX_EQUAL => QueryEntry::exact(key),
            PREFIX_MATCH => QueryEntry::partial(key),
            other => {
                return Err(GinError::InvalidParameter {
                    name: "strategy".to_string(),
                    value: other.to_string(),
                });
            }
        };
        Ok(ExtractedQuery {
            entries: vec![entry],
            search_mode: SearchMode::Default,
        })
    }

    fn consistent(
        &self,
        check: &[bool],
        _strategy: u16,
        _query: &Datum,
        _entries: &[QueryEntry],
    ) -> (bool, bool) {
        (check.first().copied().unwrap_or(false), false)
    }

    fn compare_partial(
        &self,
        query_key: &[u8],
        index_key: &[u8],
        _strategy: u16,
        _extra: Option<&Bytes>,
    ) -> PartialMatch {
        if index_key.starts_with(query_key) {
            PartialMatch::Match
        } else if index_key > query_key {
            PartialMatch::Stop
        } else {
            PartialMatch::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(op: &dyn OpClass, q: &Datum, strategy: u16) -> Vec<QueryEntry> {
        op.extract_query(q, strategy).unwrap().entries
    }

    #[test]
    fn test_array_extract_value_keeps_nulls() {
        let v = Datum::Array(vec![Some(Datum::text("a")), None, Some(Datum::text("b"))]);
        let keys = ArrayOps.extract_value(&v);
        assert_eq!(keys.len(), 3);
        assert!(keys[1].is_none());
    }

    #[test]
    fn test_array_search_modes() {
        let empty = Datum::Array(vec![]);
        let q = Datum::text_array(&["x", "y", "x"]);
        assert_eq!(ArrayOps.extract_query(&q, ARRAY_OVERLAP).unwrap().entries.len(), 2);
        assert_eq!(
            ArrayOps.extract_query(&empty, ARRAY_CONTAINS).unwrap().search_mode,
            SearchMode::All
        );
        assert_eq!(
            ArrayOps.extract_query(&q, ARRAY_CONTAINED).unwrap().search_mode,
            SearchMode::IncludeEmpty
        );
        assert_eq!(
            ArrayOps.extract_query(&empty, ARRAY_EQUAL).unwrap().search_mode,
            SearchMode::IncludeEmpty
        );
        assert!(ArrayOps.extract_query(&q, 9).is_err());
        assert!(ArrayOps.extract_query(&Datum::text("x"), ARRAY_OVERLAP).is_err());
    }

    #[test]
    fn test_array_tri_consistent() {
        let q = Datum::text_array(&["x", "y"]);
        let e = entries(&ArrayOps, &q, ARRAY_CONTAINS);
        use TriValue::*;
        let t = |c: &[TriValue], s| tri_consistent(&ArrayOps, c, s, &q, &e);
        assert_eq!(t(&[True, Maybe], ARRAY_CONTAINS), Maybe);
        assert_eq!(t(&[False, Maybe], ARRAY_CONTAINS), False);
        assert_eq!(t(&[True, True], ARRAY_CONTAINS), True);
        assert_eq!(t(&[False, Maybe], ARRAY_OVERLAP), Maybe);
        assert_eq!(t(&[False, True], ARRAY_OVERLAP), True);
        assert_eq!(t(&[False, False], ARRAY_OVERLAP), False);
    }

    #[test]
    fn test_shim_matches_native() {
        // A class with only the boolean function.
        struct BoolOnly;
        impl OpClass for BoolOnly {
            fn name(&self) -> &str {
                "bool_only"
            }
            fn extract_value(&self, value: &Datum) -> Vec<Option<Bytes>> {
                ArrayOps.extract_value(value)
            }
            fn extract_query(&self, query: &Datum, strategy: u16) -> Result<ExtractedQuery> {
                ArrayOps.extract_query(query, strategy)
            }
            fn consistent(
                &self,
                check: &[bool],
                strategy: u16,
                query: &Datum,
                entries: &[QueryEntry],
            ) -> (bool, bool) {
                ArrayOps.consistent(check, strategy, query, entries)
            }
        }

        let q = Datum::text_array(&["a", "b", "c"]);
        let e = entries(&ArrayOps, &q, ARRAY_CONTAINS);
        use TriValue::*;
        let all = [False, True, Maybe];
        for s in [ARRAY_OVERLAP, ARRAY_CONTAINS, ARRAY_EQUAL] {
            for a in all {
                for b in all {
                    for c in all {
                        let check = [a, b, c];
                        assert_eq!(
                            tri_consistent(&BoolOnly, &check, s, &q, &e),
                            tri_consistent(&ArrayOps, &check, s, &q, &e),
                            "strategy {s} check {check:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_shim_gives_up_on_many_maybes() {
        let q = Datum::text_array(&["a", "b", "c", "d", "e"]);
        let e = entries(&PrefixOps, &Datum::text("a"), PREFIX_EQUAL);
        let check = [TriValue::Maybe; 5];
        assert_eq!(
            tri_consistent(&PrefixOps, &check, PREFIX_EQUAL, &q, &e),
            TriValue::Maybe
        );
    }

    #[test]
    fn test_array_evaluate() {
        let row = Datum::text_array(&["a", "b"]);
        let s = |q: &[&str], st| ArrayOps::evaluate(Some(&row), &Datum::text_array(q), st);
        assert!(s(&["b", "z"], ARRAY_OVERLAP));
        assert!(!s(&["z"], ARRAY_OVERLAP));
        assert!(s(&["a"], ARRAY_CONTAINS));
        assert!(s(&["a", "b", "c"], ARRAY_CONTAINED));
        assert!(!s(&["a"], ARRAY_CONTAINED));
        assert!(s(&["b", "a"], ARRAY_EQUAL));
        assert!(!ArrayOps::evaluate(None, &Datum::text_array(&["a"]), ARRAY_OVERLAP));
    }

    #[test]
    fn test_prefix_partial() {
        assert_eq!(PrefixOps.compare_partial(b"ab", b"abc", 2, None), PartialMatch::Match);
        assert_eq!(PrefixOps.compare_partial(b"ab", b"aa", 2, None), PartialMatch::Skip);
        assert_eq!(PrefixOps.compare_partial(b"ab", b"b", 2, None), PartialMatch::Stop);
        let q = PrefixOps.extract_query(&Datum::text("ab"), PREFIX_MATCH).unwrap();
        assert!(q.entries[0].partial_match);
        assert!(PrefixOps::evaluate(Some(&Datum::text("abc")), &Datum::text("ab"), PREFIX_MATCH));
    }
}
