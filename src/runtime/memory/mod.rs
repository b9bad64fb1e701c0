// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod global;
pub mod remotable;

pub use global::{
    GlobalHeap,
    GlobalPtr,
};
pub use remotable::RemotableHeap;
