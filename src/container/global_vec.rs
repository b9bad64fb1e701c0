// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A fixed-element-size vector in the global heap. The handle is a plain
//! value (pointer, length, capacity) and may be freely captured by tasks; the
//! storage is dereferenceable on every rank. Collective vectors place their
//! storage through the collective arena so that ranks constructing them in
//! lockstep agree on the address; non-collective vectors live in the
//! constructing rank's segment.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    global_heap,
    memory::GlobalPtr,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A vector of plain-old-data elements in the global heap.
#[derive(Clone, Copy)]
pub struct GlobalVec<T: Copy + 'static> {
    data: GlobalPtr<T>,
    len: usize,
    capacity: usize,
    collective: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<T: Copy + 'static> GlobalVec<T> {
    /// Creates a collective vector of `len` elements, each set to `fill`.
    pub fn new_coll(len: usize, fill: T) -> Self {
        let capacity: usize = len.max(1);
        let data: GlobalPtr<T> = global_heap().alloc_coll::<T>(capacity);
        let v: GlobalVec<T> = Self {
            data,
            len,
            capacity,
            collective: true,
        };
        v.fill_range(0, len, fill);
        v
    }

    /// Creates a non-collective vector of `len` elements, each set to `fill`,
    /// homed on the calling rank.
    pub fn new(len: usize, fill: T) -> Self {
        let capacity: usize = len.max(1);
        let data: GlobalPtr<T> = global_heap().alloc::<T>(capacity);
        let v: GlobalVec<T> = Self {
            data,
            len,
            capacity,
            collective: false,
        };
        v.fill_range(0, len, fill);
        v
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_collective(&self) -> bool {
        self.collective
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: usize) -> Result<T, Fail> {
        if index >= self.len {
            return Err(Fail::out_of_range(index, self.len));
        }
        Ok(unsafe { self.data.add(index).as_ptr().read() })
    }

    /// Writes the element at `index`.
    pub fn put(&self, index: usize, value: T) -> Result<(), Fail> {
        if index >= self.len {
            return Err(Fail::out_of_range(index, self.len));
        }
        unsafe { self.data.add(index).as_ptr().write(value) };
        Ok(())
    }

    /// Reads the element at `index` without a bounds check. Used by the
    /// iteration patterns after validating the range once.
    pub(crate) fn get_unchecked(&self, index: usize) -> T {
        debug_assert!(index < self.len);
        unsafe { self.data.add(index).as_ptr().read() }
    }

    /// Resizes to `new_len`, setting any newly exposed elements to `fill`.
    /// Growth beyond the capacity moves the storage within the arena.
    pub fn resize(&mut self, new_len: usize, fill: T) {
        if new_len > self.capacity {
            let new_capacity: usize = new_len.max(self.capacity * 2);
            let new_data: GlobalPtr<T> = if self.collective {
                global_heap().alloc_coll::<T>(new_capacity)
            } else {
                global_heap().alloc::<T>(new_capacity)
            };
            unsafe {
                ::std::ptr::copy_nonoverlapping(self.data.as_ptr(), new_data.as_ptr(), self.len);
            }
            self.data = new_data;
            self.capacity = new_capacity;
        }
        let old_len: usize = self.len;
        self.len = new_len;
        if new_len > old_len {
            self.fill_range(old_len, new_len, fill);
        }
    }

    fn fill_range(&self, begin: usize, end: usize, fill: T) {
        for i in begin..end {
            unsafe { self.data.add(i).as_ptr().write(fill) };
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::GlobalVec;
    use crate::runtime::fail::Fail;
    use ::anyhow::Result;

    /// The runtime is a process-wide singleton; tests sharing the process
    /// take turns.
    static RUNTIME_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_runtime<F: FnOnce()>(tag: &str, f: F) {
        let _guard = RUNTIME_LOCK.lock().unwrap();
        let session: String = format!("spindle-test-gvec-{}-{}", tag, std::process::id());
        crate::runtime::init_with(0, 1, &session);
        f();
        crate::runtime::fini();
    }

    /// Element access round trips and bounds errors carry index and length.
    #[test]
    fn get_put_bounds() -> Result<()> {
        let mut failed: Option<Fail> = None;
        with_runtime("bounds", || {
            let v: GlobalVec<i64> = GlobalVec::new(4, 7);
            assert_eq!(v.len(), 4);
            for i in 0..4 {
                assert_eq!(v.get(i).unwrap(), 7);
            }
            v.put(2, 42).unwrap();
            assert_eq!(v.get(2).unwrap(), 42);
            failed = v.get(4).err();
        });
        let e: Fail = failed.expect("out-of-range access must fail");
        crate::ensure_eq!(e.errno, libc::ERANGE);
        assert!(e.cause.contains("index=4") && e.cause.contains("len=4"));
        Ok(())
    }

    /// Resize preserves the prefix and fills the extension.
    #[test]
    fn resize_fills() {
        with_runtime("resize", || {
            let mut v: GlobalVec<i32> = GlobalVec::new(3, 1);
            v.put(1, 9).unwrap();
            v.resize(10, 5);
            assert_eq!(v.len(), 10);
            assert_eq!(v.get(1).unwrap(), 9);
            for i in 3..10 {
                assert_eq!(v.get(i).unwrap(), 5);
            }
            v.resize(2, 0);
            assert_eq!(v.len(), 2);
            assert!(v.get(2).is_err());
        });
    }

    /// Collective vectors live in rank 0's segment.
    #[test]
    fn collective_construction() {
        with_runtime("coll", || {
            let v: GlobalVec<u64> = GlobalVec::new_coll(16, 3);
            assert!(v.is_collective());
            assert_eq!(v.get(15).unwrap(), 3);
        });
    }
}
