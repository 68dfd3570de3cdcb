//! Operation telemetry
use const_default1::ConstDefault;
use core::fmt;

/// The kind of a recorded heap operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Allocate,
    Release,
    Resize,
}

impl Op {
    /// The single-character code used in heap operation logs.
    #[inline]
    pub const fn code(self) -> char {
        match self {
            Self::Allocate => 'm',
            Self::Release => 'f',
            Self::Resize => 'r',
        }
    }
}

/// One successful heap operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRecord {
    pub op: Op,
    /// The requested size. Zero for [`Op::Release`].
    pub size: usize,
    /// The address returned to (or released by) the caller.
    pub addr: usize,
    /// The position of this record in the sequence of all records made by
    /// the same [`Telemetry`]. Starts at 1 and wraps around.
    pub seq: u32,
}

impl OpRecord {
    const EMPTY: Self = Self {
        op: Op::Allocate,
        size: 0,
        addr: 0,
        seq: 0,
    };
}

impl fmt::Display for OpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Op::Release => write!(f, "hl{{f,{:x},0}} {}", self.addr, self.seq),
            op => write!(
                f,
                "hl{{{},{},0,{:x}}} {}",
                op.code(),
                self.size,
                self.addr,
                self.seq
            ),
        }
    }
}

/// Observes successful heap operations.
///
/// Implementations are called inside the heap's critical section. They must
/// not allocate from the heap they are attached to and must not influence
/// its state.
pub trait Recorder {
    /// Record an operation. `free_bytes` is the number of free bytes left
    /// after it if [`Self::wants_free_bytes`] returned `true`, and `None`
    /// otherwise.
    fn record(&mut self, op: Op, size: usize, addr: usize, free_bytes: Option<usize>);

    /// Whether the next [`Self::record`] call needs the free byte count.
    /// Computing it takes a walk over the heap.
    #[inline]
    fn wants_free_bytes(&self) -> bool {
        false
    }
}

/// A [`Recorder`] that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecorder;

impl ConstDefault for NoRecorder {
    const DEFAULT: Self = Self;
}

impl Recorder for NoRecorder {
    #[inline]
    fn record(&mut self, _op: Op, _size: usize, _addr: usize, _free_bytes: Option<usize>) {}
}

/// Receives the contents of a [`Telemetry`] buffer when it's drained.
///
/// `free_bytes` is the heap's free byte count when the drain was caused by a
/// new record, and `None` for [`Telemetry::flush`].
pub trait Sink {
    fn drain(&mut self, records: &[OpRecord], free_bytes: Option<usize>);
}

impl<F: FnMut(&[OpRecord], Option<usize>)> Sink for F {
    #[inline]
    fn drain(&mut self, records: &[OpRecord], free_bytes: Option<usize>) {
        self(records, free_bytes)
    }
}

/// A [`Sink`] writing one `log::info!` line per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ConstDefault for LogSink {
    const DEFAULT: Self = Self;
}

impl Sink for LogSink {
    fn drain(&mut self, records: &[OpRecord], free_bytes: Option<usize>) {
        for record in records {
            log::info!("{}", record);
        }
        if let Some(last) = records.last() {
            match free_bytes {
                Some(free) => log::info!("hl flush {} - remains {}", last.seq, free),
                None => log::info!("hl flush {}", last.seq),
            }
        }
    }
}

/// A [`Recorder`] keeping the last `N` operations in a fixed buffer.
///
/// The buffer is drained through `S` and reset when it's full or holds
/// [`Self::flush_after`] records, whichever comes first, right before the
/// next record is added.
#[derive(Debug)]
pub struct Telemetry<S, const N: usize> {
    records: [OpRecord; N],
    len: usize,
    flush_after: usize,
    seq: u32,
    sink: S,
}

impl<S: ConstDefault, const N: usize> ConstDefault for Telemetry<S, N> {
    const DEFAULT: Self = Self::new(S::DEFAULT);
}

impl<S: ConstDefault, const N: usize> Default for Telemetry<S, N> {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl<S, const N: usize> Telemetry<S, N> {
    /// Construct a `Telemetry` that drains only when its buffer is full.
    pub const fn new(sink: S) -> Self {
        Self {
            records: [OpRecord::EMPTY; N],
            len: 0,
            flush_after: N,
            seq: 0,
            sink,
        }
    }

    /// Drain after `flush_after` records instead of `N`. Values outside
    /// `1..=N` are clamped.
    pub const fn with_flush_after(mut self, flush_after: usize) -> Self {
        self.flush_after = if flush_after == 0 {
            1
        } else if flush_after > N {
            N
        } else {
            flush_after
        };
        self
    }

    #[inline]
    pub fn flush_after(&self) -> usize {
        self.flush_after
    }

    /// Get the records buffered since the last drain, oldest first.
    #[inline]
    pub fn records(&self) -> &[OpRecord] {
        &self.records[..self.len]
    }

    /// Get the total number of records made, modulo 2³².
    #[inline]
    pub fn total(&self) -> u32 {
        self.seq
    }

    #[inline]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[inline]
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

impl<S: Sink, const N: usize> Telemetry<S, N> {
    /// Drain the buffered records through the sink now.
    pub fn flush(&mut self) {
        self.drain(None);
    }

    fn drain(&mut self, free_bytes: Option<usize>) {
        if self.len > 0 {
            self.sink.drain(&self.records[..self.len], free_bytes);
            self.len = 0;
        }
    }
}

impl<S: Sink, const N: usize> Recorder for Telemetry<S, N> {
    fn record(&mut self, op: Op, size: usize, addr: usize, free_bytes: Option<usize>) {
        if N == 0 {
            return;
        }
        if self.len >= self.flush_after {
            self.drain(free_bytes);
        }
        self.seq = self.seq.wrapping_add(1);
        self.records[self.len] = OpRecord {
            op,
            size,
            addr,
            seq: self.seq,
        };
        self.len += 1;
    }

    #[inline]
    fn wants_free_bytes(&self) -> bool {
        N != 0 && self.len >= self.flush_after
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec;

    #[derive(Default)]
    struct Collect {
        drains: Vec<Vec<OpRecord>>,
        free_bytes: Vec<Option<usize>>,
    }

    impl Sink for Collect {
        fn drain(&mut self, records: &[OpRecord], free_bytes: Option<usize>) {
            self.drains.push(records.to_vec());
            self.free_bytes.push(free_bytes);
        }
    }

    #[test]
    fn drains_when_full() {
        let mut t: Telemetry<Collect, 3> = Telemetry::new(Collect::default());
        for i in 0..3 {
            assert!(!t.wants_free_bytes());
            t.record(Op::Allocate, i, 0x100 + i, None);
        }
        assert!(t.sink().drains.is_empty());
        assert_eq!(t.records().len(), 3);
        assert!(t.wants_free_bytes());

        t.record(Op::Release, 0, 0x100, Some(96));
        assert_eq!(t.sink().drains.len(), 1);
        assert_eq!(t.sink().free_bytes, [Some(96)]);
        assert_eq!(t.sink().drains[0].len(), 3);
        assert_eq!(t.sink().drains[0][2].seq, 3);
        assert_eq!(
            t.records(),
            &[OpRecord {
                op: Op::Release,
                size: 0,
                addr: 0x100,
                seq: 4
            }]
        );
    }

    #[test]
    fn drains_at_threshold() {
        let mut t: Telemetry<Collect, 8> =
            Telemetry::new(Collect::default()).with_flush_after(2);
        assert_eq!(t.flush_after(), 2);
        for i in 0..5 {
            t.record(Op::Resize, i, i, Some(i));
        }
        let lens: Vec<usize> = t.sink().drains.iter().map(Vec::len).collect();
        assert_eq!(lens, [2, 2]);
        assert_eq!(t.records().len(), 1);
        assert_eq!(t.total(), 5);

        t.flush();
        assert!(t.records().is_empty());
        assert_eq!(t.sink().drains.len(), 3);
        assert_eq!(t.sink().free_bytes, [Some(2), Some(4), None]);

        // Nothing to drain
        t.flush();
        assert_eq!(t.sink().drains.len(), 3);
    }

    #[test]
    fn threshold_is_clamped() {
        let t: Telemetry<LogSink, 4> = Telemetry::new(LogSink).with_flush_after(0);
        assert_eq!(t.flush_after(), 1);
        let t: Telemetry<LogSink, 4> = Telemetry::new(LogSink).with_flush_after(100);
        assert_eq!(t.flush_after(), 4);
    }

    #[test]
    fn log_format() {
        use std::string::ToString;
        let r = OpRecord {
            op: Op::Allocate,
            size: 24,
            addr: 0x3ffe_8010,
            seq: 7,
        };
        assert_eq!(r.to_string(), "hl{m,24,0,3ffe8010} 7");
        let r = OpRecord {
            op: Op::Release,
            size: 0,
            addr: 0x3ffe_8010,
            seq: 8,
        };
        assert_eq!(r.to_string(), "hl{f,3ffe8010,0} 8");
    }

    #[test]
    fn closure_sink() {
        let mut seen = 0;
        {
            let mut t: Telemetry<_, 2> =
                Telemetry::new(|r: &[OpRecord], _: Option<usize>| seen += r.len());
            t.record(Op::Allocate, 1, 1, None);
            t.record(Op::Allocate, 1, 2, None);
            t.flush();
        }
        assert_eq!(seen, 2);
    }
}
