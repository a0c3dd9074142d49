//! Wake-ups between the handles sharing a window: which task is woken to push
//! a batch forward, and when.

use coalesce_loader::{BatchRules, FetchError, Get, Id, Key, KeySet, Loader, Pass, Window};
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{channel::oneshot, FutureExt};
use parking_lot::Mutex;
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

#[derive(Debug, Clone, Default, IntoWaker)]
struct Signal {
    woken: Arc<AtomicBool>,
}

impl WakeRef for Signal {
    fn wake_by_ref(&self) {
        self.woken.store(true, Ordering::SeqCst)
    }
}

impl Wake for Signal {}

/// A `Get` that we poll by hand, with a waker that remembers being woken.
struct Polled {
    get: Get<i64>,
    signal: Signal,
    waker: Waker,
}

impl Polled {
    fn new(get: Get<i64>) -> Self {
        let signal = Signal::default();
        let waker = signal.clone().into_waker();
        Polled { get, signal, waker }
    }

    fn poll(&mut self) -> Poll<i64> {
        let mut ctx = Context::from_waker(&self.waker);
        self.get.poll_unpin(&mut ctx).map(|result| result.unwrap())
    }

    /// Check whether this task was woken since the last check, and clear it.
    fn woken(&self) -> bool {
        self.signal.woken.swap(false, Ordering::SeqCst)
    }
}

type Batches = Arc<Mutex<Vec<Vec<i64>>>>;

/// A loader over integers that records every batch. Its first batch stays
/// running until the returned sender fires (or is dropped).
fn gated_loader(rules: BatchRules) -> (Loader<i64>, oneshot::Sender<()>, Batches) {
    let (release, gate) = oneshot::channel::<()>();
    let gate = Mutex::new(Some(gate));
    let batches: Batches = Arc::default();
    let seen = batches.clone();

    let loader = Loader::new("numbers", rules, Pass::new(), move |keys: KeySet<Key>| {
        let gate = gate.lock().take();
        let mut ids: Vec<i64> = keys.ids().filter_map(Id::as_int).collect();
        ids.sort_unstable();
        seen.lock().push(ids);

        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok::<_, FetchError>(keys.into_values(|key| key.id().as_int().unwrap()))
        }
    });

    (loader, release, batches)
}

#[test]
fn tick_window_closes_on_the_second_poll() {
    let (loader, release, batches) = gated_loader(BatchRules::default());
    drop(release);

    let mut one = Polled::new(loader.load(1).get());
    let mut two = Polled::new(loader.load(2).get());

    // The first poll of each handle only yields, and asks to be polled again
    assert_eq!(one.poll(), Poll::Pending);
    assert_eq!(two.poll(), Poll::Pending);
    assert!(one.woken());
    assert!(two.woken());
    assert!(batches.lock().is_empty());

    // The window is still open for keys loaded between the two polls
    let three = loader.load(3);

    assert_eq!(one.poll(), Poll::Ready(1));
    assert_eq!(*batches.lock(), [vec![1, 2, 3]]);

    // Finishing the batch woke the other waiting task, but not the finisher
    assert!(two.woken());
    assert!(!one.woken());
    assert_eq!(two.poll(), Poll::Ready(2));
    assert_eq!(three.peek().unwrap().unwrap(), 3);
    assert_eq!(loader.dispatch_count(), 1);
}

#[test]
fn reaching_the_key_limit_wakes_only_the_driving_task() {
    let rules = BatchRules {
        window: Window::Delay(Duration::from_secs(3600)),
        max_keys: NonZeroUsize::new(3),
    };
    let (loader, release, batches) = gated_loader(rules);
    drop(release);

    let mut one = Polled::new(loader.load(1).get());
    let mut two = Polled::new(loader.load(2).get());

    // Both tasks wait on the timer; `two` polled last, so it drives
    assert_eq!(one.poll(), Poll::Pending);
    assert_eq!(two.poll(), Poll::Pending);
    assert!(!one.woken());
    assert!(!two.woken());

    // The third key fills the window long before the timer fires
    let three = loader.load(3);
    assert!(two.woken());
    assert!(!one.woken());

    assert_eq!(two.poll(), Poll::Ready(2));
    assert_eq!(*batches.lock(), [vec![1, 2, 3]]);
    assert!(one.woken());
    assert_eq!(one.poll(), Poll::Ready(1));
    assert_eq!(three.peek().unwrap().unwrap(), 3);

    // The full window was detached, so the next key waits in a new one
    let four = loader.load(4);
    assert!(four.peek().is_none());
    assert_eq!(loader.dispatch_count(), 1);
}

#[test]
fn dropping_the_driver_of_a_running_batch_hands_it_off() {
    let (loader, release, batches) = gated_loader(BatchRules::default());

    let mut tasks: Vec<Polled> = (1..=3).map(|id| Polled::new(loader.load(id).get())).collect();

    for task in &mut tasks {
        assert_eq!(task.poll(), Poll::Pending);
        assert!(task.woken());
    }

    // The second poll closes the window; the batch is now waiting on its gate
    assert_eq!(tasks[0].poll(), Poll::Pending);
    assert_eq!(*batches.lock(), [vec![1, 2, 3]]);
    assert!(tasks.iter().all(|task| !task.woken()));

    // Exactly one of the remaining tasks takes over
    drop(tasks.remove(0));
    let woken: Vec<usize> = (0..tasks.len()).filter(|&i| tasks[i].woken()).collect();
    assert_eq!(woken.len(), 1);

    let driver = woken[0];
    let other = 1 - driver;

    // The new driver polls the batch itself, so the gate now wakes it
    assert_eq!(tasks[driver].poll(), Poll::Pending);
    release.send(()).unwrap();
    assert!(tasks[driver].woken());
    assert!(!tasks[other].woken());

    let expected = driver as i64 + 2;
    assert_eq!(tasks[driver].poll(), Poll::Ready(expected));
    assert!(tasks[other].woken());
    assert_eq!(tasks[other].poll(), Poll::Ready(5 - expected));

    // The dropped task's key was settled along with the rest
    assert_eq!(loader.load(1).peek().unwrap().unwrap(), 1);
    assert_eq!(loader.dispatch_count(), 1);
}

#[test]
fn abandoned_running_batch_is_fetched_again() {
    let (loader, _release, batches) = gated_loader(BatchRules::default());

    let mut task = Polled::new(loader.load(8).get());
    assert_eq!(task.poll(), Poll::Pending);
    assert_eq!(task.poll(), Poll::Pending);
    assert_eq!(loader.dispatch_count(), 1);

    // Nobody is left to drive the batch, so it never settles into the cache
    drop(task);

    let mut task = Polled::new(loader.load(8).get());
    assert_eq!(task.poll(), Poll::Pending);
    assert_eq!(task.poll(), Poll::Ready(8));
    assert_eq!(*batches.lock(), [vec![8], vec![8]]);
    assert_eq!(loader.dispatch_count(), 2);
}
