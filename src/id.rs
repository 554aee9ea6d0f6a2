use std::sync::Arc;

use ulid::Ulid;

/// Produces document ids. The default factory emits ULIDs: 128-bit,
/// lexicographically time-sortable, rendered as 26 characters of Crockford
/// base32.
pub type IdFactory = Arc<dyn Fn() -> String + Send + Sync>;

pub(crate) fn default_id_factory() -> IdFactory {
    Arc::new(|| Ulid::new().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_sort_by_creation_time() {
        let factory = default_id_factory();
        let ids: Vec<String> = (0..4)
            .map(|_| {
                // Ids within one millisecond carry a random tail; space the
                // samples out so the time prefix decides the order.
                std::thread::sleep(std::time::Duration::from_millis(2));
                factory()
            })
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn generated_ids_are_unique() {
        let factory = default_id_factory();
        let mut ids: Vec<String> = (0..64).map(|_| factory()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn generated_ids_are_26_chars() {
        let factory = default_id_factory();
        assert_eq!(factory().len(), 26);
    }
}
