//! Frame reframing, distribution and preview

mod channel;
pub mod preview;
pub mod reframer;

pub use channel::{ChannelStats, FanOut, FrameChannel, FrameSubscription, OverflowPolicy, PublishOutcome};
pub use preview::{LatestPreview, NullPreview, PreviewGate, PreviewSink};
pub use reframer::{FrameReader, FrameReframer};
