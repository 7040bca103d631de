use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;

/// A stream entry id: milliseconds part and per-millisecond sequence.
/// Ordering is lexicographic on `(ms, seq)`, which `derive(Ord)` gives us
/// with the fields in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub const MIN: Self = Self { ms: 0, seq: 0 };
    pub const MAX: Self = Self {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Low end of an XRANGE: `-` is the first id, a time-only id covers the
    /// millisecond from sequence 0.
    pub fn parse_range_start(s: &str) -> Result<Self, StreamIdError> {
        if s == "-" {
            return Ok(Self::MIN);
        }
        Self::parse_with_default_seq(s, 0)
    }

    /// High end of an XRANGE: `+` is the last id, a time-only id covers the
    /// whole millisecond.
    pub fn parse_range_end(s: &str) -> Result<Self, StreamIdError> {
        if s == "+" {
            return Ok(Self::MAX);
        }
        Self::parse_with_default_seq(s, u64::MAX)
    }

    fn parse_with_default_seq(s: &str, default_seq: u64) -> Result<Self, StreamIdError> {
        let parse = |part: &str| part.parse::<u64>().map_err(|_| StreamIdError::Malformed);
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: parse(ms)?,
                seq: parse(seq)?,
            }),
            None => Ok(Self {
                ms: parse(s)?,
                seq: default_seq,
            }),
        }
    }
}

impl FromStr for StreamEntryId {
    type Err = StreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_default_seq(s, 0)
    }
}

impl Display for StreamEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// The id argument of an XADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryIdSpec {
    /// `*`: current time, next free sequence.
    Auto,
    /// `<ms>-*`: caller-provided time, next sequence for it.
    PartialAuto(u64),
    /// Fully explicit id; must beat the stream's top.
    Explicit(StreamEntryId),
}

impl EntryIdSpec {
    pub fn parse(s: &str) -> Result<Self, StreamIdError> {
        if s == "*" {
            return Ok(Self::Auto);
        }
        match s.split_once('-') {
            Some((ms, "*")) => {
                let ms = ms.parse::<u64>().map_err(|_| StreamIdError::Malformed)?;
                Ok(Self::PartialAuto(ms))
            }
            _ => Ok(Self::Explicit(s.parse()?)),
        }
    }

    fn resolve(&self, top: Option<StreamEntryId>) -> StreamEntryId {
        match *self {
            EntryIdSpec::Auto => {
                let now = unix_now_ms();
                match top {
                    Some(top) if top.ms == now => StreamEntryId::new(now, top.seq + 1),
                    _ => StreamEntryId::new(now, 0),
                }
            }
            EntryIdSpec::PartialAuto(ms) => match top {
                Some(top) if top.ms == ms => StreamEntryId::new(ms, top.seq + 1),
                // sequences for the zero millisecond start at 1, 0-0 is forbidden
                _ => StreamEntryId::new(ms, if ms == 0 { 1 } else { 0 }),
            },
            EntryIdSpec::Explicit(id) => id,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StreamIdError {
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    ZeroZero,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    NotIncreasing,
    #[error("ERR Invalid stream ID specified as stream command argument")]
    Malformed,
}

pub type EntryFields = Vec<(Bytes, Bytes)>;

/// New-entry notification delivered to blocked XREAD waiters.
#[derive(Debug, Clone)]
pub struct StreamEvent(pub String, pub StreamEntryId);

/// A waiter parks on the condvar; appends drop the event into the slot and
/// wake it. The store holds only weak references, so an abandoned waiter is
/// reaped on the next notification pass.
pub type Listener = std::sync::Arc<(Mutex<Option<StreamEvent>>, Condvar)>;
pub type WeakListener = Weak<(Mutex<Option<StreamEvent>>, Condvar)>;

pub fn new_listener() -> Listener {
    std::sync::Arc::new((Mutex::new(None), Condvar::new()))
}

/// One append-only stream: an ordered map keyed by entry id, so ranges are
/// subrange scans and XREAD is an upper-bound scan.
#[derive(Default)]
struct Stream {
    entries: BTreeMap<StreamEntryId, EntryFields>,
}

impl Stream {
    fn top_id(&self) -> Option<StreamEntryId> {
        self.entries.keys().next_back().copied()
    }

    fn append(
        &mut self,
        id_spec: &EntryIdSpec,
        fields: EntryFields,
    ) -> Result<StreamEntryId, StreamIdError> {
        let top = self.top_id();
        let id = id_spec.resolve(top);
        if id == StreamEntryId::MIN {
            return Err(StreamIdError::ZeroZero);
        }
        if let Some(top) = top {
            if id <= top {
                return Err(StreamIdError::NotIncreasing);
            }
        }
        self.entries.insert(id, fields);
        Ok(id)
    }

    fn range(&self, lo: StreamEntryId, hi: StreamEntryId) -> Vec<(StreamEntryId, EntryFields)> {
        self.entries
            .range(lo..=hi)
            .map(|(id, fields)| (*id, fields.clone()))
            .collect()
    }

    fn since(&self, start: StreamEntryId) -> Vec<(StreamEntryId, EntryFields)> {
        self.entries
            .range((Bound::Excluded(start), Bound::Unbounded))
            .map(|(id, fields)| (*id, fields.clone()))
            .collect()
    }
}

/// All streams plus the waiters watching them, guarded by one lock at the
/// call site.
#[derive(Default)]
pub struct StreamStore {
    streams: HashMap<String, Stream>,
    listeners: HashMap<String, Vec<WeakListener>>,
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        key: &str,
        id_spec: &EntryIdSpec,
        fields: EntryFields,
    ) -> Result<StreamEntryId, StreamIdError> {
        let stream = self.streams.entry(key.to_string()).or_default();
        let id = stream.append(id_spec, fields)?;
        self.notify(key, id);
        Ok(id)
    }

    /// Inclusive on both ends; a missing stream is an empty one.
    pub fn range(
        &self,
        key: &str,
        lo: StreamEntryId,
        hi: StreamEntryId,
    ) -> Vec<(StreamEntryId, EntryFields)> {
        self.streams
            .get(key)
            .map(|stream| stream.range(lo, hi))
            .unwrap_or_default()
    }

    /// Entries strictly after `start`, the XREAD contract.
    pub fn read_since(&self, key: &str, start: StreamEntryId) -> Vec<(StreamEntryId, EntryFields)> {
        self.streams
            .get(key)
            .map(|stream| stream.since(start))
            .unwrap_or_default()
    }

    /// Greatest id currently in the stream; `0-0` when there is none, which
    /// is what `$` resolves to on a missing stream.
    pub fn top_id(&self, key: &str) -> StreamEntryId {
        self.streams
            .get(key)
            .and_then(Stream::top_id)
            .unwrap_or(StreamEntryId::MIN)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.streams.contains_key(key)
    }

    /// Drop a stream binding (type-changing SET, DEL).
    pub fn remove(&mut self, key: &str) -> bool {
        self.streams.remove(key).is_some()
    }

    /// Register a waiter on each key. Keys without a stream yet are fine;
    /// the waiter is woken when the first append creates them.
    pub fn subscribe(&mut self, keys: &[String], listener: &Listener) {
        for key in keys {
            self.listeners
                .entry(key.clone())
                .or_default()
                .push(std::sync::Arc::downgrade(listener));
        }
    }

    fn notify(&mut self, key: &str, id: StreamEntryId) {
        let Some(listeners) = self.listeners.get_mut(key) else {
            return;
        };
        let event = StreamEvent(key.to_string(), id);
        listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                let (slot, cvar) = &*listener;
                slot.lock().unwrap().replace(event.clone());
                cvar.notify_one();
                true
            }
            None => false,
        });
        if listeners.is_empty() {
            self.listeners.remove(key);
        }
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> EntryFields {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    Bytes::copy_from_slice(k.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect()
    }

    #[test]
    fn id_ordering_is_lexicographic() {
        assert!(StreamEntryId::new(1, 9) < StreamEntryId::new(2, 0));
        assert!(StreamEntryId::new(2, 0) < StreamEntryId::new(2, 1));
        assert_eq!(StreamEntryId::new(3, 3), StreamEntryId::new(3, 3));
    }

    #[test]
    fn id_parse_forms() {
        assert_eq!("5-7".parse::<StreamEntryId>().unwrap(), StreamEntryId::new(5, 7));
        assert_eq!("5".parse::<StreamEntryId>().unwrap(), StreamEntryId::new(5, 0));
        assert!("x-1".parse::<StreamEntryId>().is_err());
        assert_eq!(
            StreamEntryId::parse_range_start("-").unwrap(),
            StreamEntryId::MIN
        );
        assert_eq!(
            StreamEntryId::parse_range_end("+").unwrap(),
            StreamEntryId::MAX
        );
        // a time-only id expands to the whole millisecond
        assert_eq!(
            StreamEntryId::parse_range_start("7").unwrap(),
            StreamEntryId::new(7, 0)
        );
        assert_eq!(
            StreamEntryId::parse_range_end("7").unwrap(),
            StreamEntryId::new(7, u64::MAX)
        );
    }

    #[test]
    fn explicit_ids_must_increase() {
        let mut store = StreamStore::new();
        let spec = |s: &str| EntryIdSpec::parse(s).unwrap();
        assert_eq!(
            store.append("s", &spec("1-1"), fields(&[("f", "v")])).unwrap(),
            StreamEntryId::new(1, 1)
        );
        assert_eq!(
            store.append("s", &spec("1-1"), fields(&[("f", "v")])),
            Err(StreamIdError::NotIncreasing)
        );
        assert_eq!(
            store.append("s", &spec("0-5"), fields(&[("f", "v")])),
            Err(StreamIdError::NotIncreasing)
        );
        assert_eq!(
            store.append("s", &spec("2-0"), fields(&[("f", "v")])).unwrap(),
            StreamEntryId::new(2, 0)
        );
    }

    #[test]
    fn zero_zero_is_forbidden() {
        let mut store = StreamStore::new();
        assert_eq!(
            store.append("s", &EntryIdSpec::parse("0-0").unwrap(), fields(&[("f", "v")])),
            Err(StreamIdError::ZeroZero)
        );
    }

    #[test]
    fn partial_auto_picks_next_sequence() {
        let mut store = StreamStore::new();
        let spec = EntryIdSpec::parse("5-*").unwrap();
        assert_eq!(
            store.append("s", &spec, fields(&[("f", "v")])).unwrap(),
            StreamEntryId::new(5, 0)
        );
        assert_eq!(
            store.append("s", &spec, fields(&[("f", "v")])).unwrap(),
            StreamEntryId::new(5, 1)
        );
        // sequences for millisecond zero start at 1
        let mut store = StreamStore::new();
        assert_eq!(
            store
                .append("s", &EntryIdSpec::parse("0-*").unwrap(), fields(&[("f", "v")]))
                .unwrap(),
            StreamEntryId::new(0, 1)
        );
    }

    #[test]
    fn auto_ids_are_strictly_monotonic() {
        let mut store = StreamStore::new();
        let mut last = StreamEntryId::MIN;
        for _ in 0..10 {
            let id = store
                .append("s", &EntryIdSpec::Auto, fields(&[("f", "v")]))
                .unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn range_is_inclusive_and_read_since_exclusive() {
        let mut store = StreamStore::new();
        for (ms, seq) in [(1, 1), (1, 2), (2, 0), (3, 5)] {
            let spec = EntryIdSpec::Explicit(StreamEntryId::new(ms, seq));
            store.append("s", &spec, fields(&[("n", "v")])).unwrap();
        }
        let ids: Vec<_> = store
            .range("s", StreamEntryId::new(1, 2), StreamEntryId::new(3, 5))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(
            ids,
            vec![
                StreamEntryId::new(1, 2),
                StreamEntryId::new(2, 0),
                StreamEntryId::new(3, 5)
            ]
        );

        // time-only bounds cover the whole millisecond
        let ids: Vec<_> = store
            .range(
                "s",
                StreamEntryId::parse_range_start("1").unwrap(),
                StreamEntryId::parse_range_end("1").unwrap(),
            )
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![StreamEntryId::new(1, 1), StreamEntryId::new(1, 2)]);

        let ids: Vec<_> = store
            .read_since("s", StreamEntryId::new(1, 2))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![StreamEntryId::new(2, 0), StreamEntryId::new(3, 5)]);
    }

    #[test]
    fn missing_stream_reads_empty() {
        let store = StreamStore::new();
        assert!(store.range("none", StreamEntryId::MIN, StreamEntryId::MAX).is_empty());
        assert!(store.read_since("none", StreamEntryId::MIN).is_empty());
        assert_eq!(store.top_id("none"), StreamEntryId::MIN);
    }

    #[test]
    fn append_wakes_subscribers_even_on_new_streams() {
        let mut store = StreamStore::new();
        let listener = new_listener();
        store.subscribe(&["fresh".to_string()], &listener);

        let id = store
            .append(
                "fresh",
                &EntryIdSpec::Explicit(StreamEntryId::new(1, 1)),
                fields(&[("f", "v")]),
            )
            .unwrap();

        let (slot, _) = &*listener;
        let event = slot.lock().unwrap().clone().expect("waiter notified");
        assert_eq!(event.0, "fresh");
        assert_eq!(event.1, id);
    }

    #[test]
    fn dropped_subscribers_are_reaped() {
        let mut store = StreamStore::new();
        let listener = new_listener();
        store.subscribe(&["s".to_string()], &listener);
        drop(listener);
        store
            .append(
                "s",
                &EntryIdSpec::Explicit(StreamEntryId::new(1, 1)),
                fields(&[("f", "v")]),
            )
            .unwrap();
        assert!(store.listeners.is_empty());
    }
}
