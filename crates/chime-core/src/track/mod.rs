//! Track objects and their lifecycle
//!
//! A playback track is split across three owners:
//! - the client holds a [`TrackHandle`](crate::track::handle::TrackHandle)
//!   with the producing end of the shared block
//! - the owning thread holds a [`Track`] with lifecycle state and retry
//!   bookkeeping
//! - the mixer slot (or the direct output loop) holds the consuming end
//!
//! All lifecycle moves funnel through [`advance_state`], the single
//! transition table, so an illegal client call fails the same way no
//! matter which surface it came through.

pub mod handle;

use std::sync::Arc;

use crate::cblk::{flags, BlockConsumer, TrackShared};
use crate::error::{AudioResult, InvalidTransition};
use crate::types::{PcmSpec, StreamType};

/// Lifecycle states of a playback or record track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Created, never started
    Idle,
    Active,
    /// Stop requested while mixing; drains then parks
    Stopped,
    /// Pause requested; the next mix block ramps down, then parks
    Pausing,
    Paused,
    /// Start requested on a paused record track; ramps back in
    Resuming,
    /// Flushed while paused; buffers discarded
    Flushed,
    /// Evicted or destroyed; only removal is left
    Terminated,
}

/// Requested lifecycle moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    Start,
    Stop,
    Pause,
    Flush,
    Terminate,
}

/// The one transition table. Returns the new state or the refused move.
pub fn advance_state(from: TrackState, event: TrackEvent) -> Result<TrackState, InvalidTransition> {
    use TrackEvent::*;
    use TrackState::*;
    let next = match (from, event) {
        (Idle | Stopped | Flushed, Start) => Active,
        (Paused | Pausing, Start) => Resuming,
        (Active | Resuming, Start) => Active, // redundant start is benign
        (Active | Resuming | Pausing | Paused, Stop) => Stopped,
        (Stopped | Idle | Flushed, Stop) => from, // already inert
        (Active | Resuming, Pause) => Pausing,
        (Pausing | Paused, Pause) => from,
        (Paused | Pausing, Flush) => Flushed,
        (Stopped | Flushed | Idle, Flush) => Flushed,
        (_, Terminate) => Terminated,
        (Terminated, _) => {
            return Err(InvalidTransition {
                from: state_name(from),
                to: event_name(event),
            })
        }
        (Active | Resuming, Flush) => {
            return Err(InvalidTransition {
                from: state_name(from),
                to: event_name(event),
            })
        }
        (Idle, Pause) => {
            return Err(InvalidTransition {
                from: state_name(from),
                to: event_name(event),
            })
        }
        (Stopped | Flushed, Pause) => {
            return Err(InvalidTransition {
                from: state_name(from),
                to: event_name(event),
            })
        }
    };
    Ok(next)
}

fn state_name(s: TrackState) -> &'static str {
    match s {
        TrackState::Idle => "idle",
        TrackState::Active => "active",
        TrackState::Stopped => "stopped",
        TrackState::Pausing => "pausing",
        TrackState::Paused => "paused",
        TrackState::Resuming => "resuming",
        TrackState::Flushed => "flushed",
        TrackState::Terminated => "terminated",
    }
}

fn event_name(e: TrackEvent) -> &'static str {
    match e {
        TrackEvent::Start => "start",
        TrackEvent::Stop => "stop",
        TrackEvent::Pause => "pause",
        TrackEvent::Flush => "flush",
        TrackEvent::Terminate => "terminate",
    }
}

/// Identifies the client that created a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// Server-side state of one playback track
pub struct Track {
    pub id: usize,
    pub client: ClientId,
    pub stream_type: StreamType,
    pub spec: PcmSpec,
    pub shared: Arc<TrackShared>,
    /// The consuming end, present until an output loop takes it
    pub consumer: Option<BlockConsumer>,
    pub state: TrackState,
    /// Mix cycles left before an underrunning active track is evicted
    pub retries_left: u32,
    pub underrun_count: u64,
    /// Whether this track has ever had a full mix block ready
    pub filled_once: bool,
    pub muted: bool,
}

impl Track {
    pub fn new(
        id: usize,
        client: ClientId,
        stream_type: StreamType,
        spec: PcmSpec,
        shared: Arc<TrackShared>,
        consumer: BlockConsumer,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            client,
            stream_type,
            spec,
            shared,
            consumer: Some(consumer),
            state: TrackState::Idle,
            retries_left: max_retries,
            underrun_count: 0,
            filled_once: false,
            muted: false,
        }
    }

    pub fn apply(&mut self, event: TrackEvent) -> AudioResult<()> {
        self.state = advance_state(self.state, event)?;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            TrackState::Active | TrackState::Resuming | TrackState::Pausing | TrackState::Stopped
        )
    }

    pub fn frames_ready(&self) -> usize {
        self.shared.frames_ready()
    }

    /// Evict the track after its retry budget ran out: discard whatever
    /// is queued and park it. The client sees the flag and must restart
    /// explicitly.
    pub fn disable_for_underrun(&mut self) {
        // Reset first: it clears all flags, including the one we raise
        self.shared.reset();
        self.shared.raise_flags(flags::UNDERRUN_DISABLED);
        self.state = TrackState::Idle;
        self.filled_once = false;
    }
}

/// Server-side state of one record track
pub struct RecordTrack {
    pub id: usize,
    pub client: ClientId,
    pub spec: PcmSpec,
    pub shared: Arc<TrackShared>,
    pub state: TrackState,
    pub overflow_count: u64,
}

impl RecordTrack {
    pub fn new(id: usize, client: ClientId, spec: PcmSpec, shared: Arc<TrackShared>) -> Self {
        Self {
            id,
            client,
            spec,
            shared,
            state: TrackState::Idle,
            overflow_count: 0,
        }
    }

    pub fn apply(&mut self, event: TrackEvent) -> AudioResult<()> {
        self.state = advance_state(self.state, event)?;
        Ok(())
    }

    /// Latch an overflow: the capture ring had no room and frames from
    /// the device were dropped
    pub fn note_overflow(&mut self) {
        self.overflow_count += 1;
        self.shared.raise_flags(flags::OVERFLOW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TrackEvent::*;
    use TrackState::*;

    #[test]
    fn test_happy_path() {
        let mut s = Idle;
        for (ev, expect) in [
            (Start, Active),
            (Pause, Pausing),
            (Start, Resuming),
            (Stop, Stopped),
            (Start, Active),
            (Stop, Stopped),
            (Flush, Flushed),
            (Start, Active),
        ] {
            s = advance_state(s, ev).unwrap();
            assert_eq!(s, expect);
        }
    }

    #[test]
    fn test_flush_requires_inactive() {
        assert!(advance_state(Active, Flush).is_err());
        assert!(advance_state(Resuming, Flush).is_err());
        assert_eq!(advance_state(Paused, Flush).unwrap(), Flushed);
        assert_eq!(advance_state(Stopped, Flush).unwrap(), Flushed);
    }

    #[test]
    fn test_terminated_is_final() {
        let s = advance_state(Active, Terminate).unwrap();
        assert_eq!(s, Terminated);
        for ev in [Start, Stop, Pause, Flush] {
            assert!(advance_state(Terminated, ev).is_err(), "{:?}", ev);
        }
    }

    #[test]
    fn test_redundant_calls_are_benign() {
        assert_eq!(advance_state(Active, Start).unwrap(), Active);
        assert_eq!(advance_state(Stopped, Stop).unwrap(), Stopped);
        assert_eq!(advance_state(Paused, Pause).unwrap(), Paused);
    }

    #[test]
    fn test_pause_requires_running() {
        assert!(advance_state(Idle, Pause).is_err());
        assert!(advance_state(Stopped, Pause).is_err());
    }
}
