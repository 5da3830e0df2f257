pub mod event_sink;
pub mod dispatcher;

pub use dispatcher::Dispatcher;
pub use event_sink::{ChannelSink, EventSink, JsonLinesSink, NullSink};
