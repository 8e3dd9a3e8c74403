//! Test support: on-disk pipeline trees and a recording dispatcher.

mod fixtures;
mod mocks;

pub use fixtures::{
    PipelineTree, DROP_SECOND_ROW, EMIT_ROWS, FAIL_WITH_ERROR, HANG, PASS_THROUGH,
};
pub use mocks::RecordingDispatcher;
