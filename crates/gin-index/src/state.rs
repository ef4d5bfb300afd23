//! Per-index operator-class state and key ordering.

use crate::opclass::OpClass;
use crate::tuple::{EntryTuple, GIN_MAX_ITEM_SIZE, NullCategory};
use bytes::Bytes;
use gin_common::{Datum, GinError, IndexOptions, Result};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// An index key: attribute, key bytes and null category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub attno: u16,
    pub category: NullCategory,
    pub key: Bytes,
}

impl EntryKey {
    pub fn new(attno: u16, category: NullCategory, key: Bytes) -> Self {
        Self {
            attno,
            category,
            key,
        }
    }

    pub fn norm(attno: u16, key: impl Into<Bytes>) -> Self {
        Self::new(attno, NullCategory::NormKey, key.into())
    }

    /// Placeholder key with an empty payload.
    pub fn placeholder(attno: u16, category: NullCategory) -> Self {
        Self::new(attno, category, Bytes::new())
    }

    /// Key stored in an entry tuple.
    pub fn from_tuple(tuple: &EntryTuple<'_>) -> Self {
        Self::new(
            tuple.attno(),
            tuple.category(),
            Bytes::copy_from_slice(tuple.key()),
        )
    }
}

/// Opclass descriptors of one index, one per indexed column.
#[derive(Clone)]
pub struct GinState {
    opclasses: Vec<Arc<dyn OpClass>>,
    max_item_size: usize,
}

impl fmt::Debug for GinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.opclasses.iter().map(|o| o.name()).collect();
        f.debug_struct("GinState")
            .field("opclasses", &names)
            .field("max_item_size", &self.max_item_size)
            .finish()
    }
}

impl GinState {
    pub fn new(opclasses: Vec<Arc<dyn OpClass>>, options: &IndexOptions) -> Result<Self> {
        if opclasses.is_empty() {
            return Err(GinError::ConfigError(
                "an index needs at least one column".to_string(),
            ));
        }
        if opclasses.len() > u16::MAX as usize {
            return Err(GinError::ConfigError(format!(
                "too many columns: {}",
                opclasses.len()
            )));
        }
        let max_item_size = options
            .max_item_size
            .unwrap_or(GIN_MAX_ITEM_SIZE)
            .min(GIN_MAX_ITEM_SIZE);
        Ok(Self {
            opclasses,
            max_item_size,
        })
    }

    pub fn natts(&self) -> usize {
        self.opclasses.len()
    }

    /// Attribute numbers start at 1.
    pub fn opclass(&self, attno: u16) -> &dyn OpClass {
        let idx = (attno as usize).saturating_sub(1).min(self.opclasses.len() - 1);
        self.opclasses[idx].as_ref()
    }

    pub fn max_item_size(&self) -> usize {
        self.max_item_size
    }

    /// Orders two keys of the same attribute. Placeholders sort after all
    /// normal keys, in category order.
    pub fn compare_entries(
        &self,
        attno: u16,
        a: &[u8],
        acat: NullCategory,
        b: &[u8],
        bcat: NullCategory,
    ) -> Ordering {
        if acat != bcat {
            return acat.cmp(&bcat);
        }
        if acat != NullCategory::NormKey {
            return Ordering::Equal;
        }
        self.opclass(attno).compare(a, b)
    }

    pub fn compare_att_entries(
        &self,
        aattno: u16,
        a: &[u8],
        acat: NullCategory,
        battno: u16,
        b: &[u8],
        bcat: NullCategory,
    ) -> Ordering {
        aattno
            .cmp(&battno)
            .then_with(|| self.compare_entries(aattno, a, acat, b, bcat))
    }

    pub fn compare_keys(&self, a: &EntryKey, b: &EntryKey) -> Ordering {
        self.compare_att_entries(a.attno, &a.key, a.category, b.attno, &b.key, b.category)
    }

    /// Orders a search key against a stored tuple.
    pub fn compare_tuple(&self, key: &EntryKey, tuple: &EntryTuple<'_>) -> Ordering {
        self.compare_att_entries(
            key.attno,
            &key.key,
            key.category,
            tuple.attno(),
            tuple.key(),
            tuple.category(),
        )
    }

    /// Keys of one column value, sorted and deduplicated. A null value
    /// yields a single null-item placeholder, a value without keys a single
    /// empty-item placeholder.
    pub fn extract_entries(&self, attno: u16, value: Option<&Datum>) -> Vec<EntryKey> {
        let Some(value) = value else {
            return vec![EntryKey::placeholder(attno, NullCategory::NullItem)];
        };
        let extracted = self.opclass(attno).extract_value(value);
        if extracted.is_empty() {
            return vec![EntryKey::placeholder(attno, NullCategory::EmptyItem)];
        }
        let mut keys: Vec<EntryKey> = extracted
            .into_iter()
            .map(|k| match k {
                Some(key) => EntryKey::new(attno, NullCategory::NormKey, key),
                None => EntryKey::placeholder(attno, NullCategory::NullKey),
            })
            .collect();
        keys.sort_by(|a, b| self.compare_keys(a, b));
        keys.dedup_by(|a, b| self.compare_keys(a, b) == Ordering::Equal);
        keys
    }

    /// Keys of a whole row.
    pub fn extract_row(&self, values: &[Option<Datum>]) -> Result<Vec<EntryKey>> {
        if values.len() != self.natts() {
            return Err(GinError::InvalidParameter {
                name: "values".to_string(),
                value: format!("{} columns for a {}-column index", values.len(), self.natts()),
            });
        }
        let mut keys = Vec::new();
        for (i, value) in values.iter().enumerate() {
            keys.extend(self.extract_entries(i as u16 + 1, value.as_ref()));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opclass::{ArrayOps, PrefixOps};

    fn state() -> GinState {
        GinState::new(
            vec![Arc::new(ArrayOps), Arc::new(PrefixOps)],
            &IndexOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_requires_a_column() {
        assert!(GinState::new(vec![], &IndexOptions::default()).is_err());
    }

    #[test]
    fn test_max_item_size_override_is_capped() {
        let opts = IndexOptions {
            max_item_size: Some(1 << 20),
            ..Default::default()
        };
        let st = GinState::new(vec![Arc::new(ArrayOps)], &opts).unwrap();
        assert_eq!(st.max_item_size(), GIN_MAX_ITEM_SIZE);

        let opts = IndexOptions {
            max_item_size: Some(200),
            ..Default::default()
        };
        let st = GinState::new(vec![Arc::new(ArrayOps)], &opts).unwrap();
        assert_eq!(st.max_item_size(), 200);
    }

    #[test]
    fn test_placeholders_sort_after_keys() {
        let st = state();
        let ord = st.compare_entries(1, b"zzz", NullCategory::NormKey, b"", NullCategory::NullKey);
        assert_eq!(ord, Ordering::Less);
        let ord = st.compare_entries(1, b"", NullCategory::EmptyItem, b"", NullCategory::NullItem);
        assert_eq!(ord, Ordering::Less);
        let ord = st.compare_entries(1, b"", NullCategory::EmptyQuery, b"a", NullCategory::NormKey);
        assert_eq!(ord, Ordering::Less);
    }

    #[test]
    fn test_attno_dominates() {
        let st = state();
        let ord = st.compare_att_entries(
            1,
            b"",
            NullCategory::NullItem,
            2,
            b"a",
            NullCategory::NormKey,
        );
        assert_eq!(ord, Ordering::Less);
    }

    #[test]
    fn test_extract_null_and_empty() {
        let st = state();
        let keys = st.extract_entries(1, None);
        assert_eq!(keys, vec![EntryKey::placeholder(1, NullCategory::NullItem)]);

        let empty = Datum::Array(vec![]);
        let keys = st.extract_entries(1, Some(&empty));
        assert_eq!(keys, vec![EntryKey::placeholder(1, NullCategory::EmptyItem)]);
    }

    #[test]
    fn test_extract_sorts_and_dedups() {
        let st = state();
        let value = Datum::Array(vec![
            Some(Datum::text("b")),
            None,
            Some(Datum::text("a")),
            Some(Datum::text("b")),
            None,
        ]);
        let keys = st.extract_entries(1, Some(&value));
        assert_eq!(
            keys,
            vec![
                EntryKey::norm(1, Bytes::from_static(b"a")),
                EntryKey::norm(1, Bytes::from_static(b"b")),
                EntryKey::placeholder(1, NullCategory::NullKey),
            ]
        );
    }

    #[test]
    fn test_extract_row_checks_width() {
        let st = state();
        assert!(st.extract_row(&[None]).is_err());
        let keys = st
            .extract_row(&[Some(Datum::text_array(&["x"])), Some(Datum::text("abc"))])
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].attno, 1);
        assert_eq!(keys[1].attno, 2);
    }
}
