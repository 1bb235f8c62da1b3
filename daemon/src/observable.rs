/// A value holder that notifies registered observers whenever it changes.
///
/// Observers run synchronously on the thread that called [`Observable::set`];
/// anything slow must be handed off by the observer itself (e.g. into a
/// channel).
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Observers<T> {
    next_id: AtomicU64,
    list: Mutex<Vec<(u64, Observer<T>)>>,
}

pub struct Observable<T> {
    value: Mutex<T>,
    observers: Arc<Observers<T>>,
}

/// Keeps an observer registered; dropping it unsubscribes.
pub struct ObserverGuard<T> {
    id: u64,
    observers: Weak<Observers<T>>,
}

impl<T: Clone + PartialEq> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(initial),
            observers: Arc::new(Observers {
                next_id: AtomicU64::new(0),
                list: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.value.lock().unwrap().clone()
    }

    /// Stores `value` and notifies observers if it differs from the current one.
    /// Returns whether a change happened.
    pub fn set(&self, value: T) -> bool {
        {
            let mut current = self.value.lock().unwrap();
            if *current == value {
                return false;
            }
            *current = value.clone();
        }

        // Snapshot so observers may subscribe/unsubscribe from inside a callback.
        let observers: Vec<Observer<T>> = self
            .observers
            .list
            .lock()
            .unwrap()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for observer in observers {
            observer(&value);
        }
        true
    }

    pub fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> ObserverGuard<T> {
        let id = self.observers.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .list
            .lock()
            .unwrap()
            .push((id, Arc::new(observer)));
        ObserverGuard {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }
}

impl<T> Drop for ObserverGuard<T> {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.list.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().unwrap().push(v.clone()))
    }

    #[test]
    fn set_notifies_only_on_change() {
        let value = Observable::new(1);
        let (seen, observer) = recorder();
        let _guard = value.subscribe(observer);

        assert!(value.set(2));
        assert!(!value.set(2));
        assert!(value.set(3));

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(value.get(), 3);
    }

    #[test]
    fn dropping_guard_unsubscribes() {
        let value = Observable::new(false);
        let (seen, observer) = recorder();
        let guard = value.subscribe(observer);

        value.set(true);
        drop(guard);
        value.set(false);

        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn observers_are_independent() {
        let value = Observable::new(0u8);
        let (a, obs_a) = recorder();
        let (b, obs_b) = recorder();
        let _ga = value.subscribe(obs_a);
        let gb = value.subscribe(obs_b);

        value.set(1);
        drop(gb);
        value.set(2);

        assert_eq!(*a.lock().unwrap(), vec![1, 2]);
        assert_eq!(*b.lock().unwrap(), vec![1]);
    }

    #[test]
    fn guard_outliving_observable_is_harmless() {
        let value = Observable::new(0);
        let guard = value.subscribe(|_| {});
        drop(value);
        drop(guard);
    }
}
