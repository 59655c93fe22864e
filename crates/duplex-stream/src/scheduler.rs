//! External instrument clock.
//!
//! A [`ClockScheduler`] thread follows the position the device callback
//! publishes and dispatches timed events to a [`ClockSink`], for example a
//! MIDI output. The audio clock is authoritative; nothing flows back.

use crate::error::Result;
use crate::shared::{PauseControl, StreamShared};
use arc_swap::ArcSwap;
use duplex_core::{PlayMode, StreamPosition, SyncFlag};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Read-only view of a stream's published clock.
#[derive(Clone)]
pub struct ClockSource {
    shared: Arc<StreamShared>,
    pause: Arc<PauseControl>,
    start: f64,
    end: f64,
    mode: PlayMode,
}

impl ClockSource {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        pause: Arc<PauseControl>,
        start: f64,
        end: f64,
        mode: PlayMode,
    ) -> Self {
        Self {
            shared,
            pause,
            start,
            end,
            mode,
        }
    }

    pub fn position(&self) -> StreamPosition {
        self.shared.position.load()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// The stream is shutting down or gone.
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.get()
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.start, self.end)
    }

    pub fn mode(&self) -> PlayMode {
        self.mode
    }
}

/// An event at a track time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub time: f64,
    pub message: Vec<u8>,
}

/// Receiver of scheduled events.
pub trait ClockSink: Send {
    /// `at` is the event time on a continuous timeline: looped passes are
    /// laid end to end.
    fn send(&mut self, event: &ScheduledEvent, at: f64);

    /// Silence everything that is sounding.
    fn all_off(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Send events this many seconds ahead of the audible position.
    pub synth_latency: f64,
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            synth_latency: 0.0,
            poll_interval_ms: 1,
        }
    }
}

/// Handle to the scheduler thread.
pub struct ClockScheduler {
    events: Arc<ArcSwap<Vec<ScheduledEvent>>>,
    shutdown: Arc<SyncFlag>,
    handle: Option<JoinHandle<()>>,
}

impl ClockScheduler {
    pub fn spawn(
        source: ClockSource,
        sink: Box<dyn ClockSink>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let events = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let shutdown = Arc::new(SyncFlag::new(false));
        // events set from here on are measured against the position now
        let origin = Cursor {
            list: events.load_full(),
            next: None,
            pass: source.position().pass,
            last_time: source.position().track_time,
            sent_until: None,
        };

        let handle = {
            let events = Arc::clone(&events);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("duplex-clock".into())
                .spawn(move || scheduler_loop(source, sink, config, events, shutdown, origin))?
        };

        Ok(Self {
            events,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Replace the event list. Events are sorted by time.
    pub fn set_events(&self, mut events: Vec<ScheduledEvent>) {
        events.sort_by(|a, b| a.time.total_cmp(&b.time));
        self.events.store(Arc::new(events));
    }

    pub fn stop(&mut self) {
        self.shutdown.set(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClockScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn first_at_or_after(events: &[ScheduledEvent], time: f64) -> usize {
    events.partition_point(|e| e.time < time)
}

/// Where the scheduler is in the event list.
struct Cursor {
    list: Arc<Vec<ScheduledEvent>>,
    /// Next event to send; `None` right after the list was replaced.
    next: Option<usize>,
    pass: u64,
    last_time: f64,
    /// Latest event time already dispatched in this pass.
    sent_until: Option<f64>,
}

/// Send events from `from` up to `until` at `offset`. Looped play never
/// sends events at or past the end bound. Returns the next unsent index.
fn dispatch(
    list: &[ScheduledEvent],
    from: usize,
    until: f64,
    offset: f64,
    loop_end: Option<f64>,
    sink: &mut dyn ClockSink,
) -> usize {
    let mut next = from;
    while let Some(event) = list.get(next) {
        if event.time > until {
            break;
        }
        if loop_end.map_or(true, |end| event.time < end) {
            sink.send(event, event.time + offset);
        }
        next += 1;
    }
    next
}

fn scheduler_loop(
    source: ClockSource,
    mut sink: Box<dyn ClockSink>,
    config: SchedulerConfig,
    events: Arc<ArcSwap<Vec<ScheduledEvent>>>,
    shutdown: Arc<SyncFlag>,
    mut cursor: Cursor,
) {
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));
    let (start, end) = source.bounds();
    let looped = source.mode() == PlayMode::Looped;
    let loop_end = looped.then_some(end);
    let offset_of = |pass: u64| if looped { pass as f64 * (end - start) } else { 0.0 };
    let mut was_paused = false;

    tracing::debug!("Clock scheduler started");
    loop {
        if shutdown.get() || source.is_stopping() {
            sink.all_off();
            break;
        }

        if source.is_paused() {
            if !was_paused {
                sink.all_off();
                was_paused = true;
            }
            thread::sleep(poll);
            continue;
        }
        was_paused = false;

        let current = events.load_full();
        if !Arc::ptr_eq(&current, &cursor.list) {
            cursor.list = current;
            cursor.next = None;
        }
        let list = Arc::clone(&cursor.list);

        let position = source.position();
        let now = position.track_time + config.synth_latency;

        // a replaced list resumes after what the old one sent
        let resume = cursor.next.unwrap_or_else(|| match cursor.sent_until {
            Some(sent) if sent <= now => list.partition_point(|e| e.time <= sent),
            _ => first_at_or_after(&list, cursor.last_time.min(position.track_time)),
        });
        let next = if position.pass != cursor.pass {
            if looped && position.pass > cursor.pass {
                // the wrapped pass still owes its tail
                dispatch(&list, resume, end, offset_of(cursor.pass), loop_end, sink.as_mut());
            }
            // a new loop pass re-arms every event in the bounds
            cursor.sent_until = None;
            first_at_or_after(&list, start)
        } else if cursor.next.is_some()
            && position.track_time < cursor.last_time
            && source.mode() != PlayMode::Scrub
        {
            sink.all_off();
            first_at_or_after(&list, position.track_time)
        } else {
            resume
        };
        cursor.pass = position.pass;
        cursor.last_time = position.track_time;

        let from = next;
        let next = dispatch(&list, from, now, offset_of(cursor.pass), loop_end, sink.as_mut());
        if next > from {
            cursor.sent_until = list.get(next - 1).map(|e| e.time);
        }
        cursor.next = Some(next);

        thread::sleep(poll);
    }
    tracing::debug!("Clock scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::PauseSource;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Log {
        sent: Vec<(Vec<u8>, f64)>,
        all_off: usize,
    }

    struct RecordingSink(Arc<Mutex<Log>>);

    impl ClockSink for RecordingSink {
        fn send(&mut self, event: &ScheduledEvent, at: f64) {
            self.0.lock().sent.push((event.message.clone(), at));
        }
        fn all_off(&mut self) {
            self.0.lock().all_off += 1;
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn event(time: f64, tag: u8) -> ScheduledEvent {
        ScheduledEvent {
            time,
            message: vec![tag],
        }
    }

    fn publish(shared: &StreamShared, track_time: f64, pass: u64) {
        shared.position.publish(StreamPosition {
            device_time: 0.0,
            track_time,
            pass,
        });
    }

    #[test]
    fn test_looped_passes_rearm_events_with_offset() {
        let shared = Arc::new(StreamShared::new(0.0, 0, 2));
        let pause = Arc::new(PauseControl::new());
        let source = ClockSource::new(
            Arc::clone(&shared),
            Arc::clone(&pause),
            0.0,
            2.0,
            PlayMode::Looped,
        );
        let log = Arc::new(Mutex::new(Log::default()));
        let mut scheduler = ClockScheduler::spawn(
            source,
            Box::new(RecordingSink(Arc::clone(&log))),
            SchedulerConfig::default(),
        )
        .unwrap();
        scheduler.set_events(vec![event(1.0, 2), event(0.5, 1)]);

        publish(&shared, 1.2, 0);
        assert!(wait_until(|| log.lock().sent.len() == 2));
        publish(&shared, 0.7, 1);
        assert!(wait_until(|| log.lock().sent.len() == 3));

        let sent = log.lock().sent.clone();
        assert_eq!(sent[0], (vec![1], 0.5));
        assert_eq!(sent[1], (vec![2], 1.0));
        assert_eq!(sent[2], (vec![1], 2.5));

        scheduler.stop();
    }

    #[test]
    fn test_wrap_sends_tail_of_finished_pass() {
        let shared = Arc::new(StreamShared::new(0.0, 0, 2));
        let pause = Arc::new(PauseControl::new());
        let source = ClockSource::new(
            Arc::clone(&shared),
            Arc::clone(&pause),
            0.0,
            2.0,
            PlayMode::Looped,
        );
        let log = Arc::new(Mutex::new(Log::default()));
        let mut scheduler = ClockScheduler::spawn(
            source,
            Box::new(RecordingSink(Arc::clone(&log))),
            SchedulerConfig::default(),
        )
        .unwrap();
        scheduler.set_events(vec![event(0.5, 1), event(1.8, 3), event(2.0, 4)]);

        publish(&shared, 1.2, 0);
        assert!(wait_until(|| log.lock().sent.len() == 1));
        // wraps before the poll ever sees 1.8
        publish(&shared, 0.3, 1);
        assert!(wait_until(|| log.lock().sent.len() == 2));
        publish(&shared, 0.6, 1);
        assert!(wait_until(|| log.lock().sent.len() == 3));
        publish(&shared, 1.9, 1);
        assert!(wait_until(|| log.lock().sent.len() == 4));
        thread::sleep(Duration::from_millis(20));

        let sent = log.lock().sent.clone();
        assert_eq!(
            sent,
            vec![
                (vec![1], 0.5),
                (vec![3], 1.8),
                (vec![1], 2.5),
                (vec![3], 3.8),
            ]
        );
        scheduler.stop();
    }

    #[test]
    fn test_replaced_list_resumes_without_repeats() {
        let shared = Arc::new(StreamShared::new(0.0, 0, 2));
        let pause = Arc::new(PauseControl::new());
        let source = ClockSource::new(
            Arc::clone(&shared),
            Arc::clone(&pause),
            0.0,
            10.0,
            PlayMode::Straight,
        );
        let log = Arc::new(Mutex::new(Log::default()));
        let mut scheduler = ClockScheduler::spawn(
            source,
            Box::new(RecordingSink(Arc::clone(&log))),
            SchedulerConfig::default(),
        )
        .unwrap();
        scheduler.set_events(vec![event(1.0, 1)]);
        publish(&shared, 1.5, 0);
        assert!(wait_until(|| log.lock().sent.len() == 1));

        scheduler.set_events(vec![event(1.0, 1), event(2.0, 2)]);
        publish(&shared, 2.5, 0);
        assert!(wait_until(|| log.lock().sent.len() == 2));
        thread::sleep(Duration::from_millis(20));

        assert_eq!(log.lock().sent, vec![(vec![1], 1.0), (vec![2], 2.0)]);
        scheduler.stop();
    }

    #[test]
    fn test_pause_sends_all_off_once() {
        let shared = Arc::new(StreamShared::new(0.0, 0, 2));
        let pause = Arc::new(PauseControl::new());
        let source = ClockSource::new(
            Arc::clone(&shared),
            Arc::clone(&pause),
            0.0,
            10.0,
            PlayMode::Straight,
        );
        let log = Arc::new(Mutex::new(Log::default()));
        let mut scheduler = ClockScheduler::spawn(
            source,
            Box::new(RecordingSink(Arc::clone(&log))),
            SchedulerConfig::default(),
        )
        .unwrap();

        pause.set(PauseSource::User, true);
        assert!(wait_until(|| log.lock().all_off == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(log.lock().all_off, 1);

        shared.stopping.set(true);
        assert!(wait_until(|| log.lock().all_off == 2));
        scheduler.stop();
    }
}
