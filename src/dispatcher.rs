//! Event queue and run loop
//!
//! Transport threads hold an [`EventSender`]; the [`Dispatcher`] owns the
//! conference and the receiving end, and applies events strictly one after
//! another. A failing event is logged and dropped, it never stops the loop.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};

use tracing::{debug, info, warn};

use crate::conference::Conference;
use crate::error::{ConferenceError, Result};
use crate::model::propagated::Propagated;

/// Creates a bounded event queue.
pub fn channel(size: usize) -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::sync_channel(size.max(1));
    (EventSender(tx), EventQueue(rx))
}

#[derive(Debug, Clone)]
pub struct EventSender(SyncSender<Propagated>);

impl EventSender {
    /// Queues an event, blocking while the queue is full.
    pub fn send(&self, event: Propagated) -> Result<()> {
        self.0
            .send(event)
            .map_err(|_| ConferenceError::DispatcherClosed)
    }

    /// Asks the run loop to return once it reaches this event.
    pub fn stop(&self) -> Result<()> {
        self.send(Propagated::Stop)
    }
}

#[derive(Debug)]
pub struct EventQueue(Receiver<Propagated>);

impl EventQueue {
    #[cfg(test)]
    pub(crate) fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Propagated> {
        self.0.recv_timeout(timeout).ok()
    }
}

pub struct Dispatcher {
    conference: Conference,
    queue: EventQueue,
}

impl Dispatcher {
    pub fn new(conference: Conference, queue: EventQueue) -> Dispatcher {
        Dispatcher { conference, queue }
    }

    pub fn conference(&self) -> &Conference {
        &self.conference
    }

    pub fn conference_mut(&mut self) -> &mut Conference {
        &mut self.conference
    }

    pub fn into_conference(self) -> Conference {
        self.conference
    }

    /// Handles everything already queued without blocking. Returns how many
    /// events were handled; a stop event ends the batch.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            // try_recv here won't lock up the thread.
            match self.queue.0.try_recv() {
                Ok(Propagated::Stop) => return handled,
                Ok(event) => {
                    self.dispatch(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return handled,
            }
        }
    }

    /// Blocks handling events until a stop event arrives or every sender is
    /// gone.
    pub fn run(&mut self) {
        info!("Dispatcher running for conference {}", self.conference.id());
        while let Ok(event) = self.queue.0.recv() {
            if let Propagated::Stop = event {
                break;
            }
            self.dispatch(event);
        }
        info!("Dispatcher for conference {} stopped", self.conference.id());
    }

    fn dispatch(&mut self, event: Propagated) {
        let key = event.stream_key();
        match self.conference.propagate(event) {
            Ok(()) => {}
            Err(e @ ConferenceError::UnknownTrack(_))
            | Err(e @ ConferenceError::UnknownParticipant(_)) => {
                // Streams can be removed while their transport still reports.
                debug!("No stream accepts event for {:?}: {}", key, e);
            }
            Err(e) => warn!("Dropping event for {:?}: {}", key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::ConferenceConfig;
    use crate::graph::InMemoryGraph;
    use crate::model::candidate::{ComponentId, TransportCandidate};
    use crate::model::codec::{Codec, MediaType};
    use crate::model::participant::ParticipantId;
    use crate::model::stream::{Direction, StreamKey, StreamState};
    use crate::model::tracks::TrackId;
    use crate::transport::{ComponentState, TransmitterKind, Transport};

    struct ReadyTransport;

    impl Transport for ReadyTransport {
        fn establish(
            &self,
            _key: &StreamKey,
            candidates: &[TransportCandidate],
        ) -> Vec<(ComponentId, ComponentState)> {
            candidates
                .iter()
                .map(|c| (c.component(), ComponentState::Ready))
                .collect()
        }
    }

    fn dispatcher() -> (Dispatcher, EventSender, StreamKey) {
        let graph = Arc::new(InMemoryGraph::new());
        let mut conference = Conference::new(ConferenceConfig::default(), graph);
        conference.register_transmitter(TransmitterKind::Nice, Arc::new(ReadyTransport));
        conference.create().unwrap();

        let track = conference.add_track(MediaType::Video).unwrap().id();
        let participant = conference.add_participant().unwrap().id();
        let stream = conference
            .new_stream(track, participant, Direction::Recv)
            .unwrap();
        stream.set_transmitter(TransmitterKind::Nice).unwrap();
        stream
            .set_remote_codecs(vec![Codec::new(96, "H263-1998", MediaType::Video, 90000)])
            .unwrap();
        let key = stream.key();

        let (tx, queue) = channel(16);
        (Dispatcher::new(conference, queue), tx, key)
    }

    #[test]
    fn test_dispatch_pending_routes_events() {
        let (mut dispatcher, tx, key) = dispatcher();

        tx.send(Propagated::ComponentState(key, ComponentId::Rtp, ComponentState::Ready))
            .unwrap();
        tx.send(Propagated::ComponentState(key, ComponentId::Rtcp, ComponentState::Ready))
            .unwrap();
        tx.send(Propagated::SourceDiscovered {
            key,
            ssrc: 42,
            payload_type: 96,
        })
        .unwrap();

        assert_eq!(dispatcher.dispatch_pending(), 3);
        let stream = dispatcher.conference().stream(key).unwrap();
        assert_eq!(stream.state(), StreamState::Connected);
        assert!(stream.has_source(42));
        assert_eq!(dispatcher.conference().sink_pool().constructions(), 1);
    }

    #[test]
    fn test_unknown_stream_does_not_stop_dispatch() {
        let (mut dispatcher, tx, key) = dispatcher();
        let stranger = StreamKey {
            track: TrackId(u64::MAX),
            participant: ParticipantId(u64::MAX),
        };

        tx.send(Propagated::SourceDiscovered {
            key: stranger,
            ssrc: 1,
            payload_type: 96,
        })
        .unwrap();
        tx.send(Propagated::Noop).unwrap();
        tx.send(Propagated::ComponentState(key, ComponentId::Rtcp, ComponentState::Failed))
            .unwrap();

        assert_eq!(dispatcher.dispatch_pending(), 3);
        assert_eq!(
            dispatcher.conference().stream(key).unwrap().state(),
            StreamState::Failed
        );
    }

    #[test]
    fn test_run_until_stop() {
        let (mut dispatcher, tx, key) = dispatcher();

        let producer = thread::spawn(move || {
            for ssrc in 0..4 {
                tx.send(Propagated::SourceDiscovered {
                    key,
                    ssrc,
                    payload_type: 96,
                })
                .unwrap();
            }
            tx.stop().unwrap();
        });

        dispatcher.run();
        producer.join().unwrap();

        let conference = dispatcher.into_conference();
        assert_eq!(conference.sink_pool().linked_sources().len(), 4);
        assert_eq!(conference.sink_pool().constructions(), 1);
    }

    #[test]
    fn test_send_after_close() {
        let (tx, queue) = channel(1);
        drop(queue);
        assert!(matches!(tx.send(Propagated::Noop), Err(ConferenceError::DispatcherClosed)));
    }
}
