//! Bounded single-producer / single-consumer sample FIFO.
//!
//! One mutex guards the ring indices and storage and is only held while
//! indices move or samples are copied in or out. `space` is signalled when
//! the reader frees slots, `data` when the writer commits samples.

use num_complex::Complex32;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Ring {
    buf: Vec<Complex32>,
    rd: usize,
    wr: usize,
    closed: bool,
}

impl Ring {
    #[inline]
    fn mask(&self) -> usize {
        self.buf.len() - 1
    }

    #[inline]
    fn used(&self) -> usize {
        self.wr.wrapping_sub(self.rd) & self.mask()
    }

    #[inline]
    fn free(&self) -> usize {
        self.mask() - self.used()
    }

    fn write_contiguous(&self) -> usize {
        self.free().min(self.buf.len() - self.wr)
    }

    fn read_contiguous(&self) -> usize {
        self.used().min(self.buf.len() - self.rd)
    }
}

#[derive(Debug)]
pub struct SampleFifo {
    ring: Mutex<Ring>,
    space: Condvar,
    data: Condvar,
}

impl SampleFifo {
    /// `capacity` is rounded up to a power of two; one slot is kept empty.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            ring: Mutex::new(Ring {
                buf: vec![Complex32::default(); capacity],
                rd: 0,
                wr: 0,
                closed: false,
            }),
            space: Condvar::new(),
            data: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().buf.len()
    }

    pub fn free(&self) -> usize {
        self.ring.lock().free()
    }

    pub fn used(&self) -> usize {
        self.ring.lock().used()
    }

    pub fn write_max_contiguous(&self) -> usize {
        self.ring.lock().write_contiguous()
    }

    pub fn read_max_contiguous(&self) -> usize {
        self.ring.lock().read_contiguous()
    }

    /// Reserves room for up to `len` samples.
    ///
    /// With `wait`, blocks until `len` slots are free. The writer stages into
    /// its own buffer, sized to the contiguous part of that room, so it may
    /// be shorter than `len` near the end of the ring. Nothing is locked
    /// until `commit`. Returns `None` if the FIFO is closed, if `len` can
    /// never fit, or (without `wait`) if nothing is writable.
    pub fn write_prepare(&self, len: usize, wait: bool) -> Option<FifoWriter<'_>> {
        let mut ring = self.ring.lock();
        if len == 0 || len > ring.mask() {
            return None;
        }
        if wait {
            while !ring.closed && ring.free() < len {
                self.space.wait(&mut ring);
            }
        }
        if ring.closed {
            return None;
        }
        let len = len.min(ring.write_contiguous());
        let wr = ring.wr;
        drop(ring);
        (len > 0).then(|| FifoWriter {
            fifo: self,
            wr,
            staging: vec![Complex32::default(); len],
        })
    }

    /// Copies up to `len` readable samples into `scratch` without consuming them.
    ///
    /// Same blocking and contiguity rules as [`write_prepare`](Self::write_prepare).
    /// The lock is only held for the copy, so the producer keeps running
    /// while the caller works on the returned samples.
    pub fn read_peek<'a>(
        &'a self,
        len: usize,
        wait: bool,
        scratch: &'a mut Vec<Complex32>,
    ) -> Option<FifoReader<'a>> {
        let mut ring = self.ring.lock();
        if len == 0 || len > ring.mask() {
            return None;
        }
        if wait {
            while !ring.closed && ring.used() < len {
                self.data.wait(&mut ring);
            }
        }
        if ring.closed && ring.used() == 0 {
            return None;
        }
        let len = len.min(ring.read_contiguous());
        if len == 0 {
            return None;
        }
        let rd = ring.rd;
        scratch.clear();
        scratch.extend_from_slice(&ring.buf[rd..rd + len]);
        Some(FifoReader {
            fifo: self,
            rd,
            samples: scratch,
        })
    }

    /// Waits up to `timeout` for at least `len` samples. Returns whether they are there.
    pub fn wait_readable(&self, len: usize, timeout: Duration) -> bool {
        let mut ring = self.ring.lock();
        if ring.used() < len && !ring.closed {
            let _ = self.data.wait_for(&mut ring, timeout);
        }
        ring.used() >= len
    }

    /// Copies as much of `samples` as fits. Returns how many were taken.
    ///
    /// With `wait`, keeps going as the reader frees slots until everything
    /// is in or the FIFO is closed.
    pub fn push(&self, samples: &[Complex32], wait: bool) -> usize {
        let mut done = 0;
        let mut ring = self.ring.lock();
        while done < samples.len() {
            if wait {
                while !ring.closed && ring.free() == 0 {
                    self.space.wait(&mut ring);
                }
            }
            if ring.closed {
                break;
            }
            let n = (samples.len() - done).min(ring.write_contiguous());
            if n == 0 {
                break;
            }
            let wr = ring.wr;
            ring.buf[wr..wr + n].copy_from_slice(&samples[done..done + n]);
            ring.wr = (wr + n) & ring.mask();
            done += n;
            self.data.notify_all();
        }
        done
    }

    /// Drops everything currently buffered.
    pub fn discard_all(&self) -> usize {
        let mut ring = self.ring.lock();
        let used = ring.used();
        ring.rd = ring.wr;
        drop(ring);
        self.space.notify_all();
        used
    }

    /// Wakes every waiter; later prepares fail and peeks only drain what is left.
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.space.notify_all();
        self.data.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }
}

/// Reserved write region. Dropping it without `commit` publishes nothing.
#[derive(Debug)]
pub struct FifoWriter<'a> {
    fifo: &'a SampleFifo,
    wr: usize,
    staging: Vec<Complex32>,
}

impl FifoWriter<'_> {
    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub fn slice_mut(&mut self) -> &mut [Complex32] {
        &mut self.staging
    }

    /// Publishes the first `n` staged samples. Returns how many went in,
    /// zero if the FIFO was closed since `write_prepare`.
    pub fn commit(self, n: usize) -> usize {
        let n = n.min(self.staging.len());
        let mut ring = self.fifo.ring.lock();
        // single producer: nobody else moves `wr` between prepare and commit
        if ring.closed || ring.wr != self.wr || n == 0 {
            return 0;
        }
        let wr = self.wr;
        ring.buf[wr..wr + n].copy_from_slice(&self.staging[..n]);
        ring.wr = (wr + n) & ring.mask();
        drop(ring);
        self.fifo.data.notify_all();
        n
    }
}

/// Copied-out readable region. Dropping it without `discard` consumes nothing.
#[derive(Debug)]
pub struct FifoReader<'a> {
    fifo: &'a SampleFifo,
    rd: usize,
    samples: &'a [Complex32],
}

impl FifoReader<'_> {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Complex32] {
        self.samples
    }

    /// Consumes the first `n` peeked samples. A `discard_all` since the
    /// peek already dropped them, so nothing moves in that case.
    pub fn discard(self, n: usize) {
        let n = n.min(self.samples.len());
        let mut ring = self.fifo.ring.lock();
        if ring.rd != self.rd || n == 0 {
            return;
        }
        ring.rd = (self.rd + n) & ring.mask();
        drop(ring);
        self.fifo.space.notify_all();
    }
}
