//! The parallel-read / serial-write admission gate around the taxonomy.
//!
//! Request handlers take a read guard for the duration of a query; the
//! rare patch operations take the write guard. Writers are preferred: as
//! soon as one is waiting, new readers are turned away until it has run,
//! so a patch cannot be starved by a steady stream of queries. Waiters
//! sleep on condvars rather than polling.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct GateBook {
    readers_working: usize,
    writers_waiting: usize,
    writer_working: bool,
}

impl GateBook {
    fn write_possible(&self) -> bool {
        self.readers_working == 0 && !self.writer_working
    }

    fn read_possible(&self) -> bool {
        self.writers_waiting == 0 && !self.writer_working
    }
}

/// A value guarded by the gate. Functionally a read/write lock, but with
/// the admission policy spelled out so it can be tested: a writer is
/// admitted iff no reader is active and no other writer is working; a
/// reader is admitted iff no writer is active or waiting.
pub struct ParallelReadSerialWrite<T> {
    book: Mutex<GateBook>,
    no_readers_working: Condvar,
    writer_released: Condvar,
    data: UnsafeCell<T>,
}

// Readers hand out &T concurrently and the writer &mut T exclusively, with
// the bookkeeping mutex ordering every transition.
unsafe impl<T: Send> Send for ParallelReadSerialWrite<T> {}
unsafe impl<T: Send + Sync> Sync for ParallelReadSerialWrite<T> {}

impl<T> ParallelReadSerialWrite<T> {
    pub fn new(data: T) -> Self {
        ParallelReadSerialWrite {
            book: Mutex::new(GateBook::default()),
            no_readers_working: Condvar::new(),
            writer_released: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until a read-only operation may proceed.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut book = self.book.lock();
        while !book.read_possible() {
            self.writer_released.wait(&mut book);
        }
        book.readers_working += 1;
        drop(book);
        ReadGuard { gate: self }
    }

    /// Block until this writer has exclusive access.
    pub fn write(&self) -> WriteGuard<'_, T> {
        let mut book = self.book.lock();
        if !book.write_possible() {
            book.writers_waiting += 1;
            while !book.write_possible() {
                self.no_readers_working.wait(&mut book);
            }
            book.writers_waiting -= 1;
        }
        book.writer_working = true;
        drop(book);
        WriteGuard { gate: self }
    }

    /// Try to read without blocking; used by tests to observe admission.
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        let mut book = self.book.lock();
        if !book.read_possible() {
            return None;
        }
        book.readers_working += 1;
        drop(book);
        Some(ReadGuard { gate: self })
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct ReadGuard<'g, T> {
    gate: &'g ParallelReadSerialWrite<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.gate.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut book = self.gate.book.lock();
        book.readers_working -= 1;
        let was_last = book.readers_working == 0;
        drop(book);
        if was_last {
            self.gate.no_readers_working.notify_one();
        }
    }
}

pub struct WriteGuard<'g, T> {
    gate: &'g ParallelReadSerialWrite<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.gate.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.gate.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut book = self.gate.book.lock();
        book.writer_working = false;
        let more_writers = book.writers_waiting > 0;
        drop(book);
        if more_writers {
            // hand off to the next writer before letting readers back in
            self.gate.no_readers_working.notify_one();
        } else {
            self.gate.writer_released.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_parallel_readers() {
        let gate = ParallelReadSerialWrite::new(5u32);
        let r1 = gate.read();
        let r2 = gate.read();
        assert_eq!(*r1 + *r2, 10);
    }

    #[test]
    fn test_writer_blocks_new_readers() {
        let gate = Arc::new(ParallelReadSerialWrite::new(0u32));
        let r = gate.read();

        let g2 = Arc::clone(&gate);
        let writer = thread::spawn(move || {
            let mut w = g2.write();
            *w += 1;
        });

        // wait until the writer has registered as waiting
        while gate.book.lock().writers_waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        // a waiting writer keeps new readers out
        assert!(gate.try_read().is_none());
        drop(r);
        writer.join().unwrap();
        assert_eq!(*gate.read(), 1);
    }

    #[test]
    fn test_writes_are_serial_and_exclusive() {
        let gate = Arc::new(ParallelReadSerialWrite::new(0u64));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            let active = Arc::clone(&active);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut w = gate.write();
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    *w += 1;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*gate.read(), 400);
    }

    #[test]
    fn test_readers_see_consistent_snapshots() {
        // a writer updates two fields together; readers must never observe
        // them out of step
        let gate = Arc::new(ParallelReadSerialWrite::new((0u64, 0u64)));
        let g2 = Arc::clone(&gate);
        let writer = thread::spawn(move || {
            for _ in 0..500 {
                let mut w = g2.write();
                w.0 += 1;
                w.1 += 1;
            }
        });
        for _ in 0..500 {
            let r = gate.read();
            assert_eq!(r.0, r.1);
        }
        writer.join().unwrap();
    }
}
