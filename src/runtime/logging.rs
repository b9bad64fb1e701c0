// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    DeferredNow,
    Logger,
};
use ::log::Record;
use ::std::{
    env,
    io::Write,
    sync::{
        Once,
        OnceLock,
    },
};

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Rank tag of this process, resolved once at first use.
static RANK_TAG: OnceLock<String> = OnceLock::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging. The specification is read from `SPINDLE_LOG`, falling
/// back to `RUST_LOG`, then to warnings only. Every worker of a launch writes
/// to the same terminal, so each record is tagged with the worker's rank.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let spec: String = env::var("SPINDLE_LOG")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| "warn".to_string());
        Logger::try_with_str(&spec)
            .expect("malformed SPINDLE_LOG specification")
            .format(format_with_rank)
            .start()
            .expect("failed to start the logger");
    });
}

/// Prefixes each record with the rank of the emitting worker.
fn format_with_rank(w: &mut dyn Write, _now: &mut DeferredNow, record: &Record) -> Result<(), std::io::Error> {
    write!(w, "[rank {}] {} {}", rank_tag(), record.level(), record.args())
}

fn rank_tag() -> &'static str {
    RANK_TAG.get_or_init(|| env::var("SPINDLE_RANK").unwrap_or_else(|_| "0".to_string()))
}
