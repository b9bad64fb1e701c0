// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod dag_prof;
pub mod drange;
pub mod dtree;
pub mod flipper;
pub mod mailbox;
pub mod task;
pub mod thread;
pub mod worker;
pub mod wsqueue;

pub use self::{
    dag_prof::DagProfiler,
    drange::DistRange,
    dtree::NodeRef,
    flipper::Flipper,
    thread::Thread,
    worker::{
        TaskGroupData,
        Worker,
    },
};
