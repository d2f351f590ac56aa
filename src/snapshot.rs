/*!
A cell holding an immutable value that is replaced as a whole.

Readers take an `Arc` once and keep working on it while writers publish
new values. A reader never observes a half-updated value.
*/

use arc_swap::ArcSwap;

use std::fmt;
use std::sync::Arc;

pub struct Snapshot<T> {
    cell: ArcSwap<T>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Snapshot<T> {
        Snapshot {
            cell: ArcSwap::from_pointee(value),
        }
    }

    /// The current value
    pub fn load(&self) -> Arc<T> {
        self.cell.load_full()
    }

    /// Publishes a new value and returns the previous one
    pub fn store(&self, value: T) -> Arc<T> {
        self.store_arc(Arc::new(value))
    }

    pub fn store_arc(&self, value: Arc<T>) -> Arc<T> {
        self.cell.swap(value)
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Snapshot::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Snapshot({:?})", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn readers_keep_their_snapshot() {
        let cell = Snapshot::new(vec![1, 2, 3]);
        let before = cell.load();
        let old = cell.store(vec![4]);
        assert_eq!(vec![1, 2, 3], *before);
        assert!(Arc::ptr_eq(&before, &old));
        assert_eq!(vec![4], *cell.load());
    }

    #[test]
    fn concurrent_store() {
        let cell = Arc::new(Snapshot::new(0usize));
        let handles: Vec<_> = (1..5)
            .map(|i| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    cell.store(i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let last = *cell.load();
        assert!(last >= 1 && last < 5);
    }
}
