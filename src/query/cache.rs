use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::options::QueryOptions;
use crate::query::translate::TranslatorResult;
use crate::query::Query;

const CACHE_CAPACITY: usize = 500;

/// Per-collection memo of translated queries, keyed by a structural digest
/// of `(query, options)`. Bounded, LRU-evicted, never persisted.
pub(crate) struct TranslationCache {
    enabled: bool,
    entries: Mutex<LruCache<String, TranslatorResult>>,
}

impl TranslationCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        }
    }

    /// Returns the memoised translation, or runs `translate` and stores the
    /// result. Queries with inner filters or positional array access are
    /// never memoised.
    pub fn get_or_translate<F>(
        &self,
        query: &Query,
        opts: &QueryOptions,
        translate: F,
    ) -> crate::error::Result<TranslatorResult>
    where
        F: FnOnce() -> crate::error::Result<TranslatorResult>,
    {
        if !self.enabled || query.bypasses_cache() {
            return translate();
        }
        let key = match digest(query, opts) {
            Some(key) => key,
            None => return translate(),
        };
        if let Some(hit) = self.entries.lock().get(&key) {
            return Ok(hit.clone());
        }
        let result = translate()?;
        self.entries.lock().put(key, result.clone());
        Ok(result)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

fn digest(query: &Query, opts: &QueryOptions) -> Option<String> {
    let query = serde_json::to_string(query).ok()?;
    let opts = serde_json::to_string(opts).ok()?;
    Some(format!("{}\u{1f}{}", query, opts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::translate::Translator;
    use crate::query::{elem_match, eq};
    use crate::schema::{FieldDef, Schema, SqlType};

    fn schema() -> Schema<()> {
        Schema::builder()
            .field(FieldDef::new("age", SqlType::Integer).indexed())
            .build()
            .unwrap()
    }

    #[test]
    fn repeated_translations_hit_the_cache() {
        let schema = schema();
        let cache = TranslationCache::new(true);
        let opts = QueryOptions::new();
        let q = eq("age", 30);

        let first = cache
            .get_or_translate(&q, &opts, || Translator::new(&schema.fields).translate(&q, &opts))
            .unwrap();
        assert_eq!(cache.len(), 1);

        let second = cache
            .get_or_translate(&q, &opts, || panic!("must not re-translate"))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn elem_match_is_not_memoised() {
        let schema = schema();
        let cache = TranslationCache::new(true);
        let opts = QueryOptions::new();
        let q = elem_match("items", eq("value", 1));

        cache
            .get_or_translate(&q, &opts, || Translator::new(&schema.fields).translate(&q, &opts))
            .unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let schema = schema();
        let cache = TranslationCache::new(false);
        let opts = QueryOptions::new();
        let q = eq("age", 1);
        cache
            .get_or_translate(&q, &opts, || Translator::new(&schema.fields).translate(&q, &opts))
            .unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn clear_empties_the_cache() {
        let schema = schema();
        let cache = TranslationCache::new(true);
        let opts = QueryOptions::new();
        let q = eq("age", 1);
        cache
            .get_or_translate(&q, &opts, || Translator::new(&schema.fields).translate(&q, &opts))
            .unwrap();
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
