//! Audio subsystem module
//!
//! Inbound commentary path: decode queue, playback scheduling and output.

pub mod clock;
pub mod device;
pub mod output;
pub mod playback;
pub mod queue;

pub use clock::{AudioClock, FrameClock, ManualClock};
pub use device::{get_output_device, list_output_devices, OutputDeviceInfo};
pub use output::AudioOutput;
pub use playback::{
    playback_channel, AudioSink, PlaybackEvent, PlaybackNotifier, PlaybackScheduler,
    PlaybackState, ScheduledFragment,
};
pub use queue::{AudioDecodeQueue, AudioFragment, FragmentQueue};
