//! Integration tests for the lock filter and the distributor.

use moviola::error::Result;
use moviola::factory::NodeRegistry;
use moviola::filters::{DistributorFilter, LockFilter};
use moviola::frame::{Audio, Frame};
use moviola::node::{Node, NodeBase, NodeKind};
use moviola::property::PropertyBag;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

/// An input that counts fetches per position.
#[derive(Debug, Default)]
struct CountingInput {
    base: NodeBase,
    fetches: Mutex<HashMap<i32, usize>>,
    total: AtomicUsize,
}

impl CountingInput {
    fn new() -> Self {
        Self::default()
    }

    fn fetches_for(&self, position: i32) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&position)
            .copied()
            .unwrap_or(0)
    }
}

impl Node for CountingInput {
    fn uri(&self) -> String {
        "counter:".to_string()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Input
    }

    fn frames(&self) -> i32 {
        1000
    }

    fn seek(&self, position: i32, relative: bool) {
        self.base.seek(position, relative, self.frames());
    }

    fn position(&self) -> i32 {
        self.base.position()
    }

    fn fetch(&self) -> Result<Frame> {
        let position = self.base.position();
        *self.fetches.lock().unwrap().entry(position).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let mut frame = Frame::new(position);
        frame.set_audio(Audio::new(48000, 1, vec![position as i16, 1, 2, 3]));
        Ok(frame)
    }

    fn properties(&self) -> PropertyBag {
        self.base.properties()
    }
}

#[test]
fn test_lock_filter_isolates_thread_positions() {
    let lock = Arc::new(LockFilter::new());
    lock.connect(Arc::new(CountingInput::new()), 0);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [(7, 0), (42, 1)]
        .into_iter()
        .map(|(position, _)| {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                lock.seek(position, false);
                barrier.wait();
                // Both threads fetch concurrently; each sees its own seek.
                (0..5)
                    .map(|_| lock.fetch().unwrap().position())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let results: Vec<Vec<i32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results[0].iter().all(|&p| p == 7));
    assert!(results[1].iter().all(|&p| p == 42));
}

#[test]
fn test_lock_filter_cache_avoids_refetches() {
    let input = Arc::new(CountingInput::new());
    let lock = Arc::new(LockFilter::new());
    lock.connect(Arc::clone(&input) as moviola::node::NodeHandle, 0);

    lock.seek(3, false);
    for _ in 0..10 {
        lock.fetch().unwrap();
    }
    assert_eq!(input.fetches_for(3), 1);
}

#[test]
fn test_distributor_computes_each_position_once() {
    let input = Arc::new(CountingInput::new());
    let distributor = Arc::new(DistributorFilter::new(NodeRegistry::standard()));
    distributor.connect(Arc::clone(&input) as moviola::node::NodeHandle, 0);
    distributor.properties().assign("threads", "4").unwrap();

    distributor.seek(5, false);
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let distributor = Arc::clone(&distributor);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                distributor.fetch().unwrap().position()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 5);
    }

    // Four concurrent requests, one upstream computation.
    assert_eq!(input.fetches_for(5), 1);
}

#[test]
fn test_distributor_prediction_prefetches() {
    let input = Arc::new(CountingInput::new());
    let distributor = DistributorFilter::new(NodeRegistry::standard());
    distributor.connect(Arc::clone(&input) as moviola::node::NodeHandle, 0);
    distributor.properties().assign("threads", "2").unwrap();
    distributor.properties().assign("queue", "8").unwrap();

    // Sequential play: the scheduler runs ahead of the caller.
    for position in 0..32 {
        distributor.seek(position, false);
        let frame = distributor.fetch().unwrap();
        assert_eq!(frame.position(), position);
    }

    // Every played position was computed exactly once (the prefetch never
    // double-schedules what the caller then requests).
    for position in 0..32 {
        assert_eq!(input.fetches_for(position), 1, "position {position}");
    }
}

#[test]
fn test_distributor_reverse_play_reverses_audio_once() {
    let distributor = DistributorFilter::new(NodeRegistry::standard());
    distributor.connect(Arc::new(CountingInput::new()), 0);

    // Forward first, then walk backwards to flip direction.
    for position in [20, 19, 18] {
        distributor.seek(position, false);
        let frame = distributor.fetch().unwrap();
        if position == 18 {
            let audio = frame.audio().unwrap();
            // Forward order is [position, 1, 2, 3]; reversed once.
            assert_eq!(audio.samples(), &[3, 2, 1, 18]);
            assert_eq!(frame.properties().get_i64("audio_reversed"), Some(1));
        }
    }
}

#[test]
fn test_distributor_timeout_is_reported() {
    use moviola::error::Error;

    /// An input whose fetch stalls far longer than the caller's timeout.
    #[derive(Debug, Default)]
    struct StallingInput {
        base: NodeBase,
    }

    impl Node for StallingInput {
        fn uri(&self) -> String {
            "stall:".to_string()
        }
        fn kind(&self) -> NodeKind {
            NodeKind::Input
        }
        fn frames(&self) -> i32 {
            100
        }
        fn seek(&self, position: i32, relative: bool) {
            self.base.seek(position, relative, 100);
        }
        fn position(&self) -> i32 {
            self.base.position()
        }
        fn fetch(&self) -> Result<Frame> {
            thread::sleep(std::time::Duration::from_millis(500));
            Ok(Frame::new(self.base.position()))
        }
        fn properties(&self) -> PropertyBag {
            self.base.properties()
        }
    }

    let distributor = DistributorFilter::new(NodeRegistry::standard());
    distributor.connect(Arc::new(StallingInput::default()), 0);
    distributor.properties().assign("timeout", "50").unwrap();

    distributor.seek(0, false);
    assert!(matches!(
        distributor.fetch(),
        Err(Error::SchedulingTimeout { position: 0, .. })
    ));
}

#[test]
fn test_distributor_through_tee_shares_upstream() {
    let input = Arc::new(CountingInput::new());
    let registry = NodeRegistry::standard();

    let tee = registry.create_filter("tee");
    tee.connect(Arc::clone(&input) as moviola::node::NodeHandle, 0);

    let distributor = DistributorFilter::new(registry);
    distributor.connect(tee, 0);
    distributor.properties().assign("threads", "2").unwrap();

    distributor.seek(9, false);
    let frame = distributor.fetch().unwrap();
    assert_eq!(frame.position(), 9);
    // The tee was not duplicated: a lock boundary shares it.
    assert_eq!(distributor.slot(0).unwrap().uri(), "lock");
    assert_eq!(distributor.slot(0).unwrap().slot(0).unwrap().uri(), "tee");
}
