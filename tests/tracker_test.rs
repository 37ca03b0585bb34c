use queue_tasks::engine::{ShutdownReason, shutdown_channel};
use queue_tasks::tracker::EntityTracker;

#[test]
fn add_then_remove_restores_count() {
    let tracker = EntityTracker::new();
    assert!(tracker.add("a"));
    assert!(tracker.add("b"));
    assert_eq!(tracker.count(), 2);

    assert!(tracker.remove("b"));
    assert_eq!(tracker.count(), 1);
    assert!(tracker.contains("a"));
    assert!(!tracker.contains("b"));
}

#[test]
fn adding_twice_tracks_once() {
    let tracker = EntityTracker::new();
    assert!(tracker.add("a"));
    assert!(!tracker.add("a"));
    assert_eq!(tracker.count(), 1);
}

#[test]
fn removing_absent_entity_is_a_noop() {
    let (handle, mut listener) = shutdown_channel();
    let tracker = EntityTracker::with_shutdown(handle);
    tracker.add("a");

    assert!(!tracker.remove("missing"));
    assert_eq!(tracker.count(), 1);
    assert_eq!(listener.try_recv(), None);
}

#[test]
fn second_completion_requests_shutdown_exactly_once() {
    let (handle, mut listener) = shutdown_channel();
    let tracker = EntityTracker::with_shutdown(handle);
    tracker.add("A");
    tracker.add("B");

    assert!(tracker.remove("A"));
    assert_eq!(tracker.count(), 1);
    assert!(!tracker.is_drained());
    assert_eq!(listener.try_recv(), None);

    assert!(tracker.remove("B"));
    assert_eq!(tracker.count(), 0);
    assert!(tracker.is_drained());
    assert_eq!(listener.try_recv(), Some(ShutdownReason::Drained));
    assert_eq!(listener.try_recv(), None);

    // Later drains never fire again.
    assert!(!tracker.notify_if_drained());
    tracker.add("C");
    tracker.remove("C");
    assert_eq!(listener.try_recv(), None);
}

#[test]
fn never_used_tracker_is_not_drained() {
    let (handle, mut listener) = shutdown_channel();
    let tracker = EntityTracker::with_shutdown(handle);

    assert!(!tracker.is_drained());
    assert!(!tracker.notify_if_drained());
    assert!(!tracker.remove("a"));
    assert_eq!(listener.try_recv(), None);
}

#[test]
fn notify_if_drained_fires_once_for_a_drained_tracker() {
    let tracker = EntityTracker::new();
    tracker.add("a");
    assert!(!tracker.notify_if_drained());

    // Without a shutdown handle the drain is still recorded once.
    assert!(tracker.remove("a"));
    assert!(tracker.is_drained());
    assert!(!tracker.notify_if_drained());
}
