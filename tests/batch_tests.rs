//! These tests are intended to ensure that a batch function is called the
//! correct number of times for different configurations

use coalesce_loader::{BatchRules, FetchError, Key, KeySet, Loader, Pass, ValueSet, Window};
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{executor, future, FutureExt};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    thread,
    time::Duration,
};

async fn stringify(keys: KeySet<Key>) -> Result<ValueSet<String>, FetchError> {
    Ok(keys.into_values(|key| key.id().as_int().unwrap().to_string()))
}

fn counted_loader(counter: &Arc<AtomicUsize>, rules: BatchRules) -> Loader<String> {
    let counter = counter.clone();

    Loader::new("numbers", rules, Pass::new(), move |keys| {
        counter.fetch_add(1, Ordering::SeqCst);
        stringify(keys)
    })
}

#[test]
fn simple_test() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = counted_loader(&counter, BatchRules::default());

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);

    let res1 = executor::block_on(fut1.get());
    let res2 = executor::block_on(fut2.get());

    assert_eq!(res1.unwrap(), "10");
    assert_eq!(res2.unwrap(), "20");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn low_key_test() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = counted_loader(
        &counter,
        BatchRules {
            max_keys: NonZeroUsize::new(2),
            ..BatchRules::default()
        },
    );

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);
    let fut3 = loader.load(30);

    let res1 = executor::block_on(fut1.get());
    let res2 = executor::block_on(fut2.get());
    let res3 = executor::block_on(fut3.get());

    assert_eq!(res1.unwrap(), "10");
    assert_eq!(res2.unwrap(), "20");
    assert_eq!(res3.unwrap(), "30");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_duplicate_keys() {
    let counter = Arc::new(AtomicUsize::new(0));
    let keys_seen = Arc::new(AtomicUsize::new(0));

    let loader = {
        let counter = counter.clone();
        let keys_seen = keys_seen.clone();

        Loader::new("numbers", BatchRules::default(), Pass::new(), move |keys: KeySet<Key>| {
            counter.fetch_add(1, Ordering::SeqCst);
            keys_seen.fetch_add(keys.len(), Ordering::SeqCst);
            stringify(keys)
        })
    };

    let fut1 = loader.load(10);
    let fut2 = loader.load(10);
    let fut3 = loader.load(10);
    let fut4 = loader.load(20);

    let res1 = executor::block_on(fut1.get());
    let res2 = executor::block_on(fut2.get());
    let res3 = executor::block_on(fut3.get());
    let res4 = executor::block_on(fut4.get());

    assert_eq!(res1.unwrap(), "10");
    assert_eq!(res2.unwrap(), "10");
    assert_eq!(res3.unwrap(), "10");
    assert_eq!(res4.unwrap(), "20");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(keys_seen.load(Ordering::SeqCst), 2);
}

/// Siblings joined in one task coalesce under the default window, even when
/// each of them loads and awaits on its own.
#[test]
fn test_joined_siblings() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = counted_loader(&counter, BatchRules::default());

    let loads = (0..5).map(|i| loader.load(i % 3).get());
    let results: Vec<String> = executor::block_on(future::join_all(loads))
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(results, ["0", "1", "2", "0", "1"]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// Spawn several batch futures in different threads, and confirm that a single
/// batch call was made fulfilling all of them
#[test]
fn test_threaded() {
    let counter = Arc::new(AtomicUsize::new(0));
    let loader = counted_loader(
        &counter,
        BatchRules {
            window: Window::Delay(Duration::from_millis(10)),
            max_keys: None,
        },
    );
    let loader_ref = &loader;

    let result: Vec<String> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4)
            .map(move |i| {
                s.spawn(move |_s| {
                    thread::sleep(Duration::from_millis(i + 2));
                    let handle = loader_ref.load(i as i64);
                    let result = executor::block_on(handle.get());
                    result.unwrap()
                })
            })
            .collect();

        let result: Vec<String> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        result
    })
    .unwrap();

    assert_eq!(result, &["0", "1", "2", "3"]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

#[test]
fn test_key_limit_instant_trigger() {
    let loader = Loader::new(
        "numbers",
        BatchRules {
            window: Window::Delay(Duration::from_secs(3600)),
            max_keys: NonZeroUsize::new(3),
        },
        Pass::new(),
        stringify,
    );

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1).get();
    assert!(fut1.poll_unpin(&mut ctx).is_pending());

    let mut fut2 = loader.load(2).get();
    assert!(fut2.poll_unpin(&mut ctx).is_pending());

    // Reusing a key means we won't yet be at the key limit
    let mut fut11 = loader.load(1).get();
    assert!(fut11.poll_unpin(&mut ctx).is_pending());

    let mut fut3 = loader.load(3).get();

    assert_eq!(fut3.poll_unpin(&mut ctx).map(Result::unwrap), Poll::Ready(String::from("3")));
    assert_eq!(fut1.poll_unpin(&mut ctx).map(Result::unwrap), Poll::Ready(String::from("1")));
    assert_eq!(fut11.poll_unpin(&mut ctx).map(Result::unwrap), Poll::Ready(String::from("1")));
    assert_eq!(fut2.poll_unpin(&mut ctx).map(Result::unwrap), Poll::Ready(String::from("2")));

    assert_eq!(loader.dispatch_count(), 1);
}

/// A full window is detached as soon as it fills up; the next key opens a new
/// one instead of joining a window that is about to be dispatched.
#[test]
fn test_key_limit_opens_new_window() {
    let loader = Loader::new(
        "numbers",
        BatchRules {
            window: Window::Delay(Duration::from_secs(3600)),
            max_keys: NonZeroUsize::new(2),
        },
        Pass::new(),
        stringify,
    );

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1).get();
    let mut fut2 = loader.load(2).get();
    let mut fut3 = loader.load(3).get();

    assert_eq!(fut1.poll_unpin(&mut ctx).map(Result::unwrap), Poll::Ready(String::from("1")));
    assert_eq!(fut2.poll_unpin(&mut ctx).map(Result::unwrap), Poll::Ready(String::from("2")));

    // Key 3 sits alone in a window whose timer hasn't fired
    assert!(fut3.poll_unpin(&mut ctx).is_pending());
    assert_eq!(loader.dispatch_count(), 1);
}
