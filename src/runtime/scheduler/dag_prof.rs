// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lightweight profile of the executed task DAG. Travels by value with every
/// thread return value, so it stays plain old data: counters only.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct DagProfiler {
    thread_count: u64,
    strand_count: u64,
    running: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DagProfiler {
    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_stopped(&self) -> bool {
        !self.running
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn increment_thread_count(&mut self) {
        self.thread_count += 1;
    }

    pub fn increment_strand_count(&mut self) {
        self.strand_count += 1;
    }

    pub fn thread_count(&self) -> u64 {
        self.thread_count
    }

    pub fn strand_count(&self) -> u64 {
        self.strand_count
    }

    /// Folds in the profile of work that ran before this profile started.
    pub fn merge_serial(&mut self, other: DagProfiler) {
        self.thread_count += other.thread_count;
        self.strand_count += other.strand_count;
    }

    /// Folds in the profile of work that ran in parallel with this profile.
    pub fn merge_parallel(&mut self, other: DagProfiler) {
        self.thread_count += other.thread_count;
        self.strand_count += other.strand_count;
    }

    pub fn print(&self) {
        println!(
            "dag profile: {} threads, {} strands",
            self.thread_count, self.strand_count
        );
    }
}
