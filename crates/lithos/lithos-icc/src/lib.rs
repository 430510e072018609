mod channel;
mod clock;
mod error;
pub mod frame;
mod liveness;
mod reader;
mod region;
mod ring;
mod scheduler;
mod segment;
mod shm_layout;
mod stats;
mod wait;
mod writer;

pub use channel::{
    ChannelConfig, ChannelPublisher, ChannelSubscriber, PublishError, Record, SeqGap,
    SubscriberState,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use error::{ReadError, ReadStatus, SegmentError, WriteError, WriteStatus};
pub use frame::{FrameError, RecordType};
pub use lithos_mmap::ShmNamespace;
pub use liveness::{LivenessEvent, LivenessMonitor};
pub use reader::{AttachPoint, RingReader, ShadowRing};
pub use ring::{MAX_CAPACITY, MIN_CAPACITY, OverflowPolicy, RingOptions};
pub use scheduler::{
    ManualScheduler, Scheduler, ThreadScheduler, TimerCallback, TimerId, spawn_heartbeat,
};
pub use segment::{OpenMode, SegmentIdent};
pub use shm_layout::{LayoutFault, MAX_READERS};
pub use stats::RingStats;
#[cfg(target_os = "linux")]
pub use wait::FutexWaiter;
pub use wait::{PlatformWaiter, PollWaiter, WaitConfig, WaitOutcome, WaitWord, WordWaiter};
pub use writer::RingBuffer;
