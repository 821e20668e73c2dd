//! Progress events and the reporters that observe them.

mod progress;
mod reporter;

pub use progress::ProgressEvent;
pub use reporter::{
    CollectingReporter, FanOutReporter, JsonLinesReporter, LoggingReporter, NoOpReporter,
    ProgressReporter, SafeReporter,
};
